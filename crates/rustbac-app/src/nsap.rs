//! The Network Service Access Point (spec.md §4.4): multi-adapter routing,
//! a DNET → router cache, and `WhoIsRouterToNetwork`/`IAmRouterToNetwork`
//! discovery.
//!
//! Grounded in `original_source/bacpypes3/ipv4/service.py`'s
//! `NetworkServiceAccessPoint`/`RouterInfoCache` for the miss/broadcast/
//! park/flush sequence, but kept as a pure `poll`-free step function like
//! the SSMs: no socket or timer lives here, only the routing decision.

use crate::error::NsapError;
use rustbac_core::address::{Address, AddressKind};
use rustbac_core::npdu::message::{IAmRouterToNetwork, WhoIsRouterToNetwork};
use rustbac_core::npdu::{Npdu, NpduAddress};
use std::collections::HashMap;

/// One locally attached BACnet network. `network` is `None` until learned
/// (via configuration or a `NetworkNumberIs` reply to `WhatIsNetworkNumber`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adapter {
    pub network: Option<u16>,
}

impl Adapter {
    pub const fn new(network: Option<u16>) -> Self {
        Self { network }
    }
}

/// Health of a cached route, as reported by `RouterBusyToNetwork`/
/// `RouterAvailableToNetwork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    Available,
    Busy,
    Disconnected,
}

/// A cached DNET → next-hop mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterInfo {
    pub adapter_index: usize,
    pub next_hop: Address,
    pub status: RouterStatus,
}

/// A PDU that could not be routed immediately and is waiting on a pending
/// `WhoIsRouterToNetwork` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParkedPdu {
    npdu: Npdu,
    payload: Vec<u8>,
}

/// What the NSAP wants its caller to do, mirroring the SSM `Action` idiom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsapAction {
    /// Hand this NPDU + payload to the adapter at `adapter_index`, addressed
    /// to `dest` at the datalink layer.
    Send {
        adapter_index: usize,
        dest: Address,
        npdu: Npdu,
        payload: Vec<u8>,
    },
    /// A fully routed/local APDU payload for the application layer.
    DeliverUpward { source: Address, payload: Vec<u8> },
}

/// Owns every locally attached adapter plus the router cache and pending
/// queue, per spec.md §4.4.
#[derive(Debug, Default)]
pub struct NetworkServiceAccessPoint {
    adapters: Vec<Adapter>,
    router_cache: HashMap<u16, RouterInfo>,
    pending: HashMap<u16, Vec<ParkedPdu>>,
}

impl NetworkServiceAccessPoint {
    pub fn new(adapters: Vec<Adapter>) -> Self {
        Self {
            adapters,
            router_cache: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn router_info(&self, network: u16) -> Option<&RouterInfo> {
        self.router_cache.get(&network)
    }

    fn local_adapter_index(&self) -> Result<usize, NsapError> {
        if self.adapters.is_empty() {
            Err(NsapError::UnknownNetwork)
        } else {
            Ok(0)
        }
    }

    /// Routes one outbound APDU, addressed to `dest`. A `LocalStation`/
    /// `LocalBroadcast`/`Null` destination goes straight to the sole local
    /// adapter; anything else consults the router cache, broadcasting
    /// `WhoIsRouterToNetwork` and parking the PDU on a cache miss.
    pub fn request(&mut self, dest: Address, payload: Vec<u8>) -> Result<Vec<NsapAction>, NsapError> {
        match &dest.kind {
            AddressKind::Null | AddressKind::LocalStation { .. } | AddressKind::LocalBroadcast => {
                let adapter_index = self.local_adapter_index()?;
                let npdu = Npdu::new(0x00);
                Ok(vec![NsapAction::Send {
                    adapter_index,
                    dest,
                    npdu,
                    payload,
                }])
            }
            AddressKind::GlobalBroadcast => {
                let npdu = Npdu {
                    destination: Some(NpduAddress {
                        network: 0xFFFF,
                        mac: [0u8; 6],
                        mac_len: 0,
                    }),
                    hop_count: Some(255),
                    ..Npdu::new(0x20)
                };
                Ok(self
                    .adapters
                    .iter()
                    .enumerate()
                    .map(|(adapter_index, _)| NsapAction::Send {
                        adapter_index,
                        dest: dest.clone(),
                        npdu,
                        payload: payload.clone(),
                    })
                    .collect())
            }
            AddressKind::RemoteBroadcast { net } | AddressKind::RemoteStation { net, .. } => {
                let net = *net;
                if let Some(route) = self.router_cache.get(&net) {
                    let npdu = Npdu {
                        destination: Some(remote_npdu_address(net, &dest.kind)),
                        hop_count: Some(255),
                        ..Npdu::new(0x20)
                    };
                    return Ok(vec![NsapAction::Send {
                        adapter_index: route.adapter_index,
                        dest: route.next_hop.clone(),
                        npdu,
                        payload,
                    }]);
                }
                let npdu = Npdu {
                    destination: Some(remote_npdu_address(net, &dest.kind)),
                    hop_count: Some(255),
                    ..Npdu::new(0x20)
                };
                self.pending.entry(net).or_default().push(ParkedPdu {
                    npdu,
                    payload,
                });
                Ok(self.broadcast_who_is_router(Some(net)))
            }
        }
    }

    fn broadcast_who_is_router(&self, network: Option<u16>) -> Vec<NsapAction> {
        let who_is = WhoIsRouterToNetwork { network };
        let mut payload = vec![0u8; 4];
        let mut w = rustbac_core::encoding::writer::Writer::new(&mut payload);
        who_is.encode(&mut w).expect("fixed-size who-is-router-to-network");
        let n = w.position();
        payload.truncate(n);

        let npdu = Npdu {
            message_type: Some(
                rustbac_core::npdu::message::message_type::WHO_IS_ROUTER_TO_NETWORK,
            ),
            ..Npdu::new(0x80)
        };
        self.adapters
            .iter()
            .enumerate()
            .map(|(adapter_index, _)| NsapAction::Send {
                adapter_index,
                dest: Address {
                    kind: AddressKind::LocalBroadcast,
                    route: None,
                },
                npdu,
                payload: payload.clone(),
            })
            .collect()
    }

    /// Handles an `IAmRouterToNetwork` heard on `adapter_index` from
    /// `source`: updates the cache for every network named, then flushes
    /// any PDU parked waiting on one of them.
    pub fn handle_i_am_router_to_network(
        &mut self,
        adapter_index: usize,
        source: Address,
        msg: IAmRouterToNetwork,
    ) -> Vec<NsapAction> {
        let mut actions = Vec::new();
        for net in msg.networks {
            self.router_cache.insert(
                net,
                RouterInfo {
                    adapter_index,
                    next_hop: source.clone(),
                    status: RouterStatus::Available,
                },
            );
            if let Some(parked) = self.pending.remove(&net) {
                for pdu in parked {
                    actions.push(NsapAction::Send {
                        adapter_index,
                        dest: source.clone(),
                        npdu: pdu.npdu,
                        payload: pdu.payload,
                    });
                }
            }
        }
        actions
    }

    /// Marks a cached route's health, e.g. on receiving
    /// `RouterBusyToNetwork`/`RouterAvailableToNetwork`.
    pub fn set_router_status(&mut self, network: u16, status: RouterStatus) {
        if let Some(info) = self.router_cache.get_mut(&network) {
            info.status = status;
        }
    }

    /// Records a network number learned via `NetworkNumberIs`.
    pub fn bind_adapter_network(&mut self, adapter_index: usize, network: u16) {
        if let Some(adapter) = self.adapters.get_mut(adapter_index) {
            adapter.network = Some(network);
        }
    }
}

fn remote_npdu_address(net: u16, kind: &AddressKind) -> NpduAddress {
    match kind {
        AddressKind::RemoteStation { mac, .. } => {
            let mut buf = [0u8; 6];
            let len = mac.len().min(6);
            buf[..len].copy_from_slice(&mac[..len]);
            NpduAddress {
                network: net,
                mac: buf,
                mac_len: len as u8,
            }
        }
        _ => NpduAddress {
            network: net,
            mac: [0u8; 6],
            mac_len: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_station(net: u16, mac: u8) -> Address {
        Address {
            kind: AddressKind::RemoteStation {
                net,
                mac: vec![mac],
            },
            route: None,
        }
    }

    fn local_station(mac: u8) -> Address {
        Address {
            kind: AddressKind::LocalStation { mac: vec![mac] },
            route: None,
        }
    }

    #[test]
    fn local_station_routes_to_sole_adapter() {
        let mut nsap = NetworkServiceAccessPoint::new(vec![Adapter::new(Some(1))]);
        let actions = nsap.request(local_station(5), vec![1, 2, 3]).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            NsapAction::Send { adapter_index: 0, .. }
        ));
    }

    /// S6: unknown DNET broadcasts WhoIsRouterToNetwork and parks the PDU;
    /// the matching IAmRouterToNetwork updates the cache and flushes it.
    #[test]
    fn s6_unknown_network_parks_then_flushes_on_i_am_router() {
        let mut nsap = NetworkServiceAccessPoint::new(vec![Adapter::new(Some(1))]);
        let dest = remote_station(5, 9);
        let actions = nsap.request(dest.clone(), vec![0xAA]).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            NsapAction::Send { adapter_index: 0, .. }
        ));

        let router = local_station(200);
        let flushed = nsap.handle_i_am_router_to_network(
            0,
            router.clone(),
            IAmRouterToNetwork { networks: vec![5] },
        );
        assert_eq!(flushed.len(), 1);
        let NsapAction::Send { dest: flushed_dest, .. } = &flushed[0] else {
            panic!("expected a flushed Send action");
        };
        assert_eq!(flushed_dest, &router);
        assert_eq!(nsap.router_info(5).unwrap().next_hop, router);

        // Subsequent traffic to network 5 goes directly, no further
        // broadcast.
        let direct = nsap.request(remote_station(5, 10), vec![0xBB]).unwrap();
        assert_eq!(direct.len(), 1);
        assert!(matches!(
            direct[0],
            NsapAction::Send { adapter_index: 0, .. }
        ));
    }

    #[test]
    fn global_broadcast_fans_out_to_every_adapter() {
        let mut nsap =
            NetworkServiceAccessPoint::new(vec![Adapter::new(Some(1)), Adapter::new(Some(2))]);
        let actions = nsap
            .request(
                Address {
                    kind: AddressKind::GlobalBroadcast,
                    route: None,
                },
                vec![0xCC],
            )
            .unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn no_adapters_is_unknown_network() {
        let mut nsap = NetworkServiceAccessPoint::new(vec![]);
        let err = nsap.request(local_station(1), vec![]).unwrap_err();
        assert_eq!(err, NsapError::UnknownNetwork);
    }
}
