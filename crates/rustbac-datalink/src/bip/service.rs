//! BACnet/IPv4 virtual link layer service modes: Normal, Foreign Device, and
//! Broadcast Distribution (BBMD).
//!
//! Each mode is modeled the way [`rustbac_core`]'s SSM states are modeled:
//! a plain data struct with `handle_*`/`tick` methods that take the current
//! instant and inbound data and return a list of [`Outbound`] actions to
//! perform (send a frame, deliver a payload upward). No socket I/O happens
//! in this module; [`crate::bip::transport::BacnetIpTransport`] drives it.

use crate::bip::bvlc::{
    BdtEntry, BvlcFunction, DeleteFdtEntryBody, FdtEntry, ForwardedNpduHeader, ReadBdtAck,
    ReadFdtAck, RegisterForeignDeviceBody, ResultCode, WriteBdt,
};
use rustbac_core::encoding::reader::Reader;
use rustbac_core::encoding::writer::Writer;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::time::Instant;

/// Seconds added to a freshly registered FDT entry's `remaining` counter,
/// matching the spec.md §4.3 BBMD behavior (and §8 invariant 6).
pub const BBMD_FDT_ENTRY_GRACE_SECONDS: u16 = 5;

/// Seconds past the advertised TTL before a foreign device gives up on an
/// unconfirmed registration and considers itself unregistered again.
pub const FOREIGN_EXPIRATION_GRACE_SECONDS: u64 = 30;

/// A frame this mode wants sent, or a payload ready for upward delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a BVLC frame (header + payload, caller encodes) to `to`.
    Send {
        to: SocketAddr,
        function: BvlcFunction,
        payload: Vec<u8>,
    },
    /// Deliver a decoded NPDU payload to the application, logically
    /// received as a broadcast or unicast from `from`.
    Deliver { from: SocketAddr, npdu: Vec<u8> },
}

fn send(to: SocketAddr, function: BvlcFunction, payload: Vec<u8>) -> Outbound {
    Outbound::Send {
        to,
        function,
        payload,
    }
}

fn result(to: SocketAddr, code: ResultCode) -> Outbound {
    let mut buf = [0u8; 2];
    let mut w = Writer::new(&mut buf);
    let _ = code.encode(&mut w);
    send(to, BvlcFunction::Result, w.as_written().to_vec())
}

fn socket_addr_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

/// Status of a foreign-device registration, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignRegistrationStatus {
    /// No registration in flight; status code -2 in the BACnet standard.
    Unregistered,
    /// A RegisterForeignDevice was sent and no reply has arrived yet;
    /// status code -1.
    InProgress,
    /// The BBMD acknowledged registration with Result=0; status code 0.
    Registered,
    /// The BBMD NAK'd registration with this result code.
    Error(u16),
}

/// State owned by a node operating in Foreign Device mode.
#[derive(Debug, Clone)]
pub struct ForeignState {
    pub bbmd: SocketAddr,
    pub ttl_seconds: u16,
    pub status: ForeignRegistrationStatus,
    renewal_deadline: Option<Instant>,
    expiration_deadline: Option<Instant>,
}

impl ForeignState {
    pub fn new(bbmd: SocketAddr, ttl_seconds: u16) -> Self {
        Self {
            bbmd,
            ttl_seconds,
            status: ForeignRegistrationStatus::Unregistered,
            renewal_deadline: None,
            expiration_deadline: None,
        }
    }

    /// Starts (or restarts) registration: schedules an immediate
    /// RegisterForeignDevice. Per spec.md §4.3 step 2, the caller is
    /// expected to keep re-sending at `min(5, ttl)` second intervals until
    /// a Result arrives.
    pub fn register(&mut self) -> Vec<Outbound> {
        log::debug!("foreign device registration attempt to {}", self.bbmd);
        self.status = ForeignRegistrationStatus::InProgress;
        self.renewal_deadline = None;
        self.expiration_deadline = None;
        vec![self.registration_frame()]
    }

    /// `min(5, ttl)` seconds, the re-attempt interval while unconfirmed.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_seconds.min(5)))
    }

    fn registration_frame(&self) -> Outbound {
        let mut buf = [0u8; 2];
        let mut w = Writer::new(&mut buf);
        let _ = RegisterForeignDeviceBody {
            ttl_seconds: self.ttl_seconds,
        }
        .encode(&mut w);
        send(
            self.bbmd,
            BvlcFunction::RegisterForeignDevice,
            w.as_written().to_vec(),
        )
    }

    /// Tears down the registration: sends TTL=0 and clears timers.
    /// Idempotent -- calling this again while already unregistered is a
    /// no-op that emits no frame.
    pub fn unregister(&mut self) -> Vec<Outbound> {
        if matches!(self.status, ForeignRegistrationStatus::Unregistered)
            && self.renewal_deadline.is_none()
        {
            return Vec::new();
        }
        self.status = ForeignRegistrationStatus::Unregistered;
        self.renewal_deadline = None;
        self.expiration_deadline = None;
        let mut buf = [0u8; 2];
        let mut w = Writer::new(&mut buf);
        let _ = RegisterForeignDeviceBody { ttl_seconds: 0 }.encode(&mut w);
        vec![send(
            self.bbmd,
            BvlcFunction::RegisterForeignDevice,
            w.as_written().to_vec(),
        )]
    }

    /// Handles a BVLC Result frame from `from`. Only accepted when `from`
    /// matches the configured BBMD address exactly, including port
    /// (resolution of spec.md §9 Open Question 2).
    pub fn handle_result(&mut self, from: SocketAddr, code: ResultCode, now: Instant) {
        if from != self.bbmd {
            return;
        }
        match code {
            ResultCode::Successful => {
                log::debug!(
                    "foreign device registration with {} confirmed, ttl={}s",
                    self.bbmd,
                    self.ttl_seconds
                );
                self.status = ForeignRegistrationStatus::Registered;
                self.renewal_deadline = Some(now + Duration::from_secs(u64::from(self.ttl_seconds)));
                self.expiration_deadline = Some(
                    now + Duration::from_secs(u64::from(self.ttl_seconds))
                        + Duration::from_secs(FOREIGN_EXPIRATION_GRACE_SECONDS),
                );
            }
            ResultCode::RegisterForeignDeviceNak => {
                log::warn!("foreign device registration with {} nak'd", self.bbmd);
                self.status = ForeignRegistrationStatus::Error(code.to_u16());
            }
            other => {
                log::warn!(
                    "unexpected bvlc result {:?} from bbmd {}",
                    other,
                    self.bbmd
                );
                self.status = ForeignRegistrationStatus::Error(other.to_u16());
            }
        }
    }

    /// Inbound `ForwardedNpdu` from the registered BBMD is delivered as a
    /// local broadcast; from anyone else it is ignored.
    pub fn handle_forwarded_npdu(
        &self,
        from: SocketAddr,
        header: ForwardedNpduHeader,
        npdu: &[u8],
    ) -> Vec<Outbound> {
        if from != self.bbmd {
            return Vec::new();
        }
        vec![Outbound::Deliver {
            from: SocketAddr::V4(header.original_source),
            npdu: npdu.to_vec(),
        }]
    }

    /// Wraps an outbound local broadcast as DistributeBroadcastToNetwork
    /// unicast to the BBMD. Per spec.md §4.3 and §8 invariant 7, dropped
    /// entirely unless currently registered.
    pub fn send_local_broadcast(&self, npdu: &[u8]) -> Vec<Outbound> {
        if !matches!(self.status, ForeignRegistrationStatus::Registered) {
            log::trace!(
                "dropping local broadcast: not registered with bbmd {}",
                self.bbmd
            );
            return Vec::new();
        }
        vec![send(
            self.bbmd,
            BvlcFunction::DistributeBroadcastToNetwork,
            npdu.to_vec(),
        )]
    }

    /// Should be called whenever the driver's renewal timer fires; returns
    /// the next registration frame(s) to send and advances `self` toward
    /// `InProgress`. If the expiration deadline has also passed, status
    /// falls back to `Unregistered` per spec.md §4.3 step 5.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Outbound> {
        if let Some(expiration) = self.expiration_deadline {
            if now >= expiration {
                log::warn!(
                    "foreign device registration with {} expired without renewal",
                    self.bbmd
                );
                self.status = ForeignRegistrationStatus::Unregistered;
                self.renewal_deadline = None;
                self.expiration_deadline = None;
                return Vec::new();
            }
        }
        if let Some(renewal) = self.renewal_deadline {
            if now >= renewal {
                return self.register();
            }
        }
        Vec::new()
    }
}

/// One row of a BBMD's Foreign Device Table, with its own expiry clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdtRow {
    ttl_seconds: u16,
    remaining_seconds: u32,
}

/// State owned by a node operating as a Broadcast Distribution Device.
#[derive(Debug, Clone, Default)]
pub struct BbmdState {
    pub bdt: Vec<BdtEntry>,
    fdt: HashMap<SocketAddrV4, FdtRow>,
    pub self_addr: Option<SocketAddrV4>,
}

impl BbmdState {
    pub fn new(self_addr: SocketAddrV4, bdt: Vec<BdtEntry>) -> Self {
        Self {
            bdt,
            fdt: HashMap::new(),
            self_addr: Some(self_addr),
        }
    }

    pub fn fdt_entries(&self) -> Vec<FdtEntry> {
        self.fdt
            .iter()
            .map(|(addr, row)| FdtEntry {
                address: *addr,
                ttl_seconds: row.ttl_seconds,
                remaining_seconds: row.remaining_seconds.min(u32::from(u16::MAX)) as u16,
            })
            .collect()
    }

    /// Runs the 1 Hz FDT clock: decrements every entry and purges any that
    /// have expired. Pure given `elapsed`, so it is trivially unit-testable
    /// without a real timer.
    pub fn tick(&mut self, elapsed: Duration) {
        let elapsed_secs = elapsed.as_secs() as u32;
        self.fdt.retain(|_, row| {
            row.remaining_seconds = row.remaining_seconds.saturating_sub(elapsed_secs.max(1));
            row.remaining_seconds > 0
        });
    }

    /// RegisterForeignDevice: TTL=0 deletes, else upsert with
    /// `remaining = TTL + 5` (spec.md §3, §4.3).
    pub fn handle_register_foreign_device(
        &mut self,
        from: SocketAddr,
        body: RegisterForeignDeviceBody,
    ) -> Vec<Outbound> {
        let Some(addr) = socket_addr_v4(from) else {
            return vec![result(from, ResultCode::RegisterForeignDeviceNak)];
        };
        if body.ttl_seconds == 0 {
            self.fdt.remove(&addr);
        } else {
            self.fdt.insert(
                addr,
                FdtRow {
                    ttl_seconds: body.ttl_seconds,
                    remaining_seconds: u32::from(body.ttl_seconds)
                        + u32::from(BBMD_FDT_ENTRY_GRACE_SECONDS),
                },
            );
        }
        vec![result(from, ResultCode::Successful)]
    }

    pub fn handle_delete_foreign_device_table_entry(
        &mut self,
        from: SocketAddr,
        body: DeleteFdtEntryBody,
    ) -> Vec<Outbound> {
        self.fdt.remove(&body.address);
        vec![result(from, ResultCode::Successful)]
    }

    pub fn handle_read_broadcast_distribution_table(&self, from: SocketAddr) -> Vec<Outbound> {
        let ack = ReadBdtAck {
            entries: self.bdt.clone(),
        };
        let mut buf = vec![0u8; self.bdt.len() * 10];
        let mut w = Writer::new(&mut buf);
        let _ = ack.encode(&mut w);
        vec![send(
            from,
            BvlcFunction::ReadBroadcastDistributionTableAck,
            w.as_written().to_vec(),
        )]
    }

    pub fn handle_write_broadcast_distribution_table(
        &mut self,
        from: SocketAddr,
        table: WriteBdt,
    ) -> Vec<Outbound> {
        self.bdt = table.entries;
        vec![result(from, ResultCode::Successful)]
    }

    pub fn handle_read_foreign_device_table(&self, from: SocketAddr) -> Vec<Outbound> {
        let ack = ReadFdtAck {
            entries: self.fdt_entries(),
        };
        let mut buf = vec![0u8; self.fdt.len() * 10];
        let mut w = Writer::new(&mut buf);
        let _ = ack.encode(&mut w);
        vec![send(
            from,
            BvlcFunction::ReadForeignDeviceTableAck,
            w.as_written().to_vec(),
        )]
    }

    /// OriginalBroadcast from a local station: forward to every BDT peer
    /// (excluding self) and every FDT entry.
    pub fn handle_original_broadcast(&self, from: SocketAddr, npdu: &[u8]) -> Vec<Outbound> {
        let Some(from_v4) = socket_addr_v4(from) else {
            return Vec::new();
        };
        let header = ForwardedNpduHeader {
            original_source: from_v4,
        };
        let mut header_buf = [0u8; 6];
        let mut hw = Writer::new(&mut header_buf);
        let _ = header.encode(&mut hw);
        let mut payload = hw.as_written().to_vec();
        payload.extend_from_slice(npdu);

        let mut out = Vec::new();
        for peer in &self.bdt {
            if Some(peer.address) == self.self_addr {
                continue;
            }
            out.push(send(
                SocketAddr::V4(peer.address),
                BvlcFunction::ForwardedNpdu,
                payload.clone(),
            ));
        }
        for addr in self.fdt.keys() {
            out.push(send(
                SocketAddr::V4(*addr),
                BvlcFunction::ForwardedNpdu,
                payload.clone(),
            ));
        }
        out
    }

    /// ForwardedNpdu from a peer BBMD: deliver locally and relay to every
    /// FDT entry, but do not re-broadcast to BDT peers.
    pub fn handle_forwarded_npdu(
        &self,
        header: ForwardedNpduHeader,
        npdu: &[u8],
    ) -> Vec<Outbound> {
        let mut header_buf = [0u8; 6];
        let mut hw = Writer::new(&mut header_buf);
        let _ = header.encode(&mut hw);
        let mut payload = hw.as_written().to_vec();
        payload.extend_from_slice(npdu);

        let mut out = vec![Outbound::Deliver {
            from: SocketAddr::V4(header.original_source),
            npdu: npdu.to_vec(),
        }];
        for addr in self.fdt.keys() {
            out.push(send(
                SocketAddr::V4(*addr),
                BvlcFunction::ForwardedNpdu,
                payload.clone(),
            ));
        }
        out
    }

    /// DistributeBroadcastToNetwork from a registered FD: local-broadcast,
    /// relay to every BDT peer, and relay to all *other* FDs.
    pub fn handle_distribute_broadcast_to_network(
        &self,
        from: SocketAddr,
        npdu: &[u8],
    ) -> Vec<Outbound> {
        let Some(from_v4) = socket_addr_v4(from) else {
            return Vec::new();
        };
        if !self.fdt.contains_key(&from_v4) {
            return Vec::new();
        }

        let header = ForwardedNpduHeader {
            original_source: from_v4,
        };
        let mut header_buf = [0u8; 6];
        let mut hw = Writer::new(&mut header_buf);
        let _ = header.encode(&mut hw);
        let mut payload = hw.as_written().to_vec();
        payload.extend_from_slice(npdu);

        let mut out = vec![Outbound::Deliver {
            from: SocketAddr::V4(from_v4),
            npdu: npdu.to_vec(),
        }];
        for peer in &self.bdt {
            if Some(peer.address) == self.self_addr {
                continue;
            }
            out.push(send(
                SocketAddr::V4(peer.address),
                BvlcFunction::ForwardedNpdu,
                payload.clone(),
            ));
        }
        for addr in self.fdt.keys() {
            if *addr == from_v4 {
                continue;
            }
            out.push(send(
                SocketAddr::V4(*addr),
                BvlcFunction::ForwardedNpdu,
                payload.clone(),
            ));
        }
        out
    }
}

/// Which of the three link-layer service modes a node is operating in.
#[derive(Debug, Clone)]
pub enum BvllMode {
    Normal,
    Foreign(ForeignState),
    Bbmd(BbmdState),
}

impl BvllMode {
    /// Dispatches one already-separated inbound BVLC function + body to
    /// whichever mode `self` is in. Function codes a mode has no business
    /// receiving (e.g. `RegisterForeignDevice` outside `Bbmd`) are ignored,
    /// matching the teacher's `transport.rs` read loop behavior of dropping
    /// frames it cannot act on rather than erroring the whole recv.
    pub fn inbound(
        &mut self,
        from: SocketAddr,
        function: BvlcFunction,
        payload: &[u8],
        now: Instant,
    ) -> Vec<Outbound> {
        match self {
            BvllMode::Normal => {
                let nak = match function {
                    BvlcFunction::WriteBroadcastDistributionTable => {
                        Some(ResultCode::WriteBroadcastDistributionTableNak)
                    }
                    BvlcFunction::ReadBroadcastDistributionTable => {
                        Some(ResultCode::ReadBroadcastDistributionTableNak)
                    }
                    BvlcFunction::RegisterForeignDevice => {
                        Some(ResultCode::RegisterForeignDeviceNak)
                    }
                    BvlcFunction::ReadForeignDeviceTable => {
                        Some(ResultCode::ReadForeignDeviceTableNak)
                    }
                    BvlcFunction::DeleteForeignDeviceTableEntry => {
                        Some(ResultCode::DeleteForeignDeviceTableEntryNak)
                    }
                    BvlcFunction::DistributeBroadcastToNetwork => {
                        Some(ResultCode::DistributeBroadcastToNetworkNak)
                    }
                    _ => None,
                };
                match nak {
                    Some(code) => {
                        log::debug!("naking {:?} from {} in normal mode", function, from);
                        vec![result(from, code)]
                    }
                    None => Vec::new(),
                }
            }
            BvllMode::Foreign(state) => match function {
                BvlcFunction::Result => {
                    let mut r = Reader::new(payload);
                    if let Ok(code) = ResultCode::decode(&mut r) {
                        state.handle_result(from, code, now);
                    }
                    Vec::new()
                }
                BvlcFunction::ForwardedNpdu => {
                    let mut r = Reader::new(payload);
                    let Ok(header) = ForwardedNpduHeader::decode(&mut r) else {
                        return Vec::new();
                    };
                    state.handle_forwarded_npdu(from, header, &payload[r.position()..])
                }
                _ => Vec::new(),
            },
            BvllMode::Bbmd(state) => match function {
                BvlcFunction::RegisterForeignDevice => {
                    let mut r = Reader::new(payload);
                    let Ok(body) = RegisterForeignDeviceBody::decode(&mut r) else {
                        return Vec::new();
                    };
                    state.handle_register_foreign_device(from, body)
                }
                BvlcFunction::DeleteForeignDeviceTableEntry => {
                    let mut r = Reader::new(payload);
                    let Ok(body) = DeleteFdtEntryBody::decode(&mut r) else {
                        return Vec::new();
                    };
                    state.handle_delete_foreign_device_table_entry(from, body)
                }
                BvlcFunction::ReadBroadcastDistributionTable => {
                    state.handle_read_broadcast_distribution_table(from)
                }
                BvlcFunction::WriteBroadcastDistributionTable => {
                    let mut r = Reader::new(payload);
                    let Ok(table) = WriteBdt::decode(&mut r) else {
                        return Vec::new();
                    };
                    state.handle_write_broadcast_distribution_table(from, table)
                }
                BvlcFunction::ReadForeignDeviceTable => {
                    state.handle_read_foreign_device_table(from)
                }
                BvlcFunction::OriginalBroadcastNpdu => {
                    state.handle_original_broadcast(from, payload)
                }
                BvlcFunction::ForwardedNpdu => {
                    let mut r = Reader::new(payload);
                    let Ok(header) = ForwardedNpduHeader::decode(&mut r) else {
                        return Vec::new();
                    };
                    state.handle_forwarded_npdu(header, &payload[r.position()..])
                }
                BvlcFunction::DistributeBroadcastToNetwork => {
                    state.handle_distribute_broadcast_to_network(from, payload)
                }
                _ => Vec::new(),
            },
        }
    }

    /// Routes one outbound NPDU. `to` is the immediate wire destination for
    /// a unicast, or the local subnet broadcast address when
    /// `is_broadcast`; a `Foreign` or `Bbmd` node additionally tunnels or
    /// relays a broadcast through its BBMD role instead of (or in addition
    /// to) sending it directly.
    pub fn outbound(&self, to: SocketAddr, is_broadcast: bool, npdu: &[u8]) -> Vec<Outbound> {
        if !is_broadcast {
            return vec![send(to, BvlcFunction::OriginalUnicastNpdu, npdu.to_vec())];
        }
        match self {
            BvllMode::Normal => vec![send(to, BvlcFunction::OriginalBroadcastNpdu, npdu.to_vec())],
            BvllMode::Foreign(state) => state.send_local_broadcast(npdu),
            BvllMode::Bbmd(state) => {
                let mut out = vec![send(to, BvlcFunction::OriginalBroadcastNpdu, npdu.to_vec())];
                if let Some(self_addr) = state.self_addr {
                    out.extend(state.handle_original_broadcast(SocketAddr::V4(self_addr), npdu));
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip::bvlc::ResultCode;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port))
    }

    #[test]
    fn foreign_registration_round_trip_s3() {
        let bbmd = addr(10, 0, 0, 1, 47808);
        let mut fs = ForeignState::new(bbmd, 60);
        let frames = fs.register();
        assert_eq!(frames.len(), 1);
        assert!(matches!(fs.status, ForeignRegistrationStatus::InProgress));

        let now = Instant::now();
        fs.handle_result(bbmd, ResultCode::Successful, now);
        assert!(matches!(fs.status, ForeignRegistrationStatus::Registered));

        // No renewal before T=60.
        assert!(fs.on_timer(now + Duration::from_secs(30)).is_empty());

        // Renewal fires at T=60.
        let renewal = fs.on_timer(now + Duration::from_secs(60));
        assert_eq!(renewal.len(), 1);
        assert!(matches!(fs.status, ForeignRegistrationStatus::InProgress));

        // Successful re-ack restarts both timers.
        fs.handle_result(bbmd, ResultCode::Successful, now + Duration::from_secs(60));
        assert!(matches!(fs.status, ForeignRegistrationStatus::Registered));
    }

    #[test]
    fn foreign_expiration_drops_to_unregistered_without_reply() {
        let bbmd = addr(10, 0, 0, 1, 47808);
        let mut fs = ForeignState::new(bbmd, 60);
        fs.register();
        let now = Instant::now();
        fs.handle_result(bbmd, ResultCode::Successful, now);
        // No response to the T=60 renewal; by T=90 (TTL+30) it gives up.
        let out = fs.on_timer(now + Duration::from_secs(90));
        assert!(out.is_empty());
        assert!(matches!(fs.status, ForeignRegistrationStatus::Unregistered));
    }

    #[test]
    fn foreign_broadcast_dropped_unless_registered() {
        let fs = ForeignState::new(addr(10, 0, 0, 1, 47808), 60);
        assert!(fs.send_local_broadcast(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn foreign_result_ignored_from_non_bbmd_source() {
        let bbmd = addr(10, 0, 0, 1, 47808);
        let mut fs = ForeignState::new(bbmd, 60);
        fs.register();
        fs.handle_result(addr(10, 0, 0, 2, 47808), ResultCode::Successful, Instant::now());
        assert!(matches!(fs.status, ForeignRegistrationStatus::InProgress));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut fs = ForeignState::new(addr(10, 0, 0, 1, 47808), 60);
        assert!(fs.unregister().is_empty());
        fs.register();
        assert_eq!(fs.unregister().len(), 1);
        assert!(fs.unregister().is_empty());
    }

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
    }

    #[test]
    fn bbmd_broadcast_fan_out_s4() {
        let self_addr = v4(10, 0, 0, 1, 47808);
        let p1 = v4(10, 0, 0, 2, 47808);
        let p2 = v4(10, 0, 0, 3, 47808);
        let mut bbmd = BbmdState::new(
            self_addr,
            vec![
                BdtEntry {
                    address: self_addr,
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                },
                BdtEntry {
                    address: p1,
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                },
                BdtEntry {
                    address: p2,
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                },
            ],
        );
        bbmd.handle_register_foreign_device(
            SocketAddr::V4(v4(10, 0, 0, 9, 47808)),
            RegisterForeignDeviceBody { ttl_seconds: 30 },
        );

        let station = addr(10, 0, 0, 50, 47808);
        let out = bbmd.handle_original_broadcast(station, &[0xde, 0xad]);
        let targets: Vec<SocketAddr> = out
            .iter()
            .filter_map(|o| match o {
                Outbound::Send { to, function, .. } if *function == BvlcFunction::ForwardedNpdu => {
                    Some(*to)
                }
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&SocketAddr::V4(p1)));
        assert!(targets.contains(&SocketAddr::V4(p2)));
        assert!(targets.contains(&SocketAddr::V4(v4(10, 0, 0, 9, 47808))));
        assert!(!targets.contains(&SocketAddr::V4(self_addr)));
    }

    #[test]
    fn bbmd_fdt_entry_gets_five_second_grace() {
        let mut bbmd = BbmdState::new(v4(10, 0, 0, 1, 47808), vec![]);
        bbmd.handle_register_foreign_device(
            SocketAddr::V4(v4(10, 0, 0, 9, 47808)),
            RegisterForeignDeviceBody { ttl_seconds: 30 },
        );
        let entries = bbmd.fdt_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remaining_seconds, 35);
    }

    #[test]
    fn bbmd_fdt_clock_purges_expired_entries() {
        let mut bbmd = BbmdState::new(v4(10, 0, 0, 1, 47808), vec![]);
        bbmd.handle_register_foreign_device(
            SocketAddr::V4(v4(10, 0, 0, 9, 47808)),
            RegisterForeignDeviceBody { ttl_seconds: 2 },
        );
        assert_eq!(bbmd.fdt_entries().len(), 1);
        bbmd.tick(Duration::from_secs(10));
        assert_eq!(bbmd.fdt_entries().len(), 0);
    }

    #[test]
    fn bbmd_register_zero_ttl_deletes() {
        let mut bbmd = BbmdState::new(v4(10, 0, 0, 1, 47808), vec![]);
        let fd = SocketAddr::V4(v4(10, 0, 0, 9, 47808));
        bbmd.handle_register_foreign_device(fd, RegisterForeignDeviceBody { ttl_seconds: 30 });
        assert_eq!(bbmd.fdt_entries().len(), 1);
        bbmd.handle_register_foreign_device(fd, RegisterForeignDeviceBody { ttl_seconds: 0 });
        assert_eq!(bbmd.fdt_entries().len(), 0);
    }

    #[test]
    fn bbmd_distribute_broadcast_relays_to_peers_and_other_fds_only() {
        let self_addr = v4(10, 0, 0, 1, 47808);
        let p1 = v4(10, 0, 0, 2, 47808);
        let mut bbmd = BbmdState::new(
            self_addr,
            vec![BdtEntry {
                address: p1,
                mask: Ipv4Addr::new(255, 255, 255, 0),
            }],
        );
        let fd_a = v4(10, 0, 0, 9, 47808);
        let fd_b = v4(10, 0, 0, 10, 47808);
        bbmd.handle_register_foreign_device(
            SocketAddr::V4(fd_a),
            RegisterForeignDeviceBody { ttl_seconds: 30 },
        );
        bbmd.handle_register_foreign_device(
            SocketAddr::V4(fd_b),
            RegisterForeignDeviceBody { ttl_seconds: 30 },
        );

        let out = bbmd.handle_distribute_broadcast_to_network(SocketAddr::V4(fd_a), &[1]);
        let targets: Vec<SocketAddr> = out
            .iter()
            .filter_map(|o| match o {
                Outbound::Send { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert!(targets.contains(&SocketAddr::V4(p1)));
        assert!(targets.contains(&SocketAddr::V4(fd_b)));
        assert!(!targets.contains(&SocketAddr::V4(fd_a)));
    }

    #[test]
    fn bvll_mode_normal_inbound_ignores_everything() {
        let mut mode = BvllMode::Normal;
        let out = mode.inbound(
            addr(10, 0, 0, 2, 47808),
            BvlcFunction::OriginalBroadcastNpdu,
            &[1, 2, 3],
            Instant::now(),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn bvll_mode_normal_naks_bbmd_control_messages() {
        let mut mode = BvllMode::Normal;
        let from = addr(10, 0, 0, 2, 47808);
        let out = mode.inbound(
            from,
            BvlcFunction::RegisterForeignDevice,
            &[0, 60],
            Instant::now(),
        );
        match out.as_slice() {
            [Outbound::Send { to, function, payload }] => {
                assert_eq!(*to, from);
                assert_eq!(*function, BvlcFunction::Result);
                let mut r = Reader::new(payload);
                assert_eq!(
                    ResultCode::decode(&mut r).unwrap(),
                    ResultCode::RegisterForeignDeviceNak
                );
            }
            other => panic!("expected a single Result NAK, got {other:?}"),
        }
    }

    #[test]
    fn bvll_mode_foreign_inbound_result_updates_registration() {
        let bbmd = addr(10, 0, 0, 1, 47808);
        let mut mode = BvllMode::Foreign(ForeignState::new(bbmd, 60));
        let mut buf = [0u8; 2];
        let mut w = Writer::new(&mut buf);
        ResultCode::Successful.encode(&mut w).unwrap();
        mode.inbound(bbmd, BvlcFunction::Result, w.as_written(), Instant::now());
        let BvllMode::Foreign(state) = &mode else {
            panic!("still foreign");
        };
        assert!(matches!(state.status, ForeignRegistrationStatus::Registered));
    }

    #[test]
    fn bvll_mode_bbmd_inbound_register_then_outbound_broadcast_relays() {
        let self_addr = v4(10, 0, 0, 1, 47808);
        let peer = v4(10, 0, 0, 2, 47808);
        let mut mode = BvllMode::Bbmd(BbmdState::new(
            self_addr,
            vec![BdtEntry {
                address: peer,
                mask: Ipv4Addr::new(255, 255, 255, 0),
            }],
        ));
        let fd = addr(10, 0, 0, 9, 47808);
        let mut buf = [0u8; 2];
        let mut w = Writer::new(&mut buf);
        RegisterForeignDeviceBody { ttl_seconds: 30 }
            .encode(&mut w)
            .unwrap();
        let registered = mode.inbound(
            fd,
            BvlcFunction::RegisterForeignDevice,
            w.as_written(),
            Instant::now(),
        );
        assert_eq!(registered.len(), 1);

        let broadcast = addr(255, 255, 255, 255, 47808);
        let out = mode.outbound(broadcast, true, &[0xAA]);
        let targets: Vec<SocketAddr> = out
            .iter()
            .filter_map(|o| match o {
                Outbound::Send { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert!(targets.contains(&broadcast));
        assert!(targets.contains(&SocketAddr::V4(peer)));
        assert!(targets.contains(&fd));
    }
}
