//! Network-layer control messages carried by an [`Npdu`](super::Npdu) whose
//! control octet has the network-layer-message bit set.
//!
//! Each message is keyed by the `message_type` byte in the NPCI and has its
//! own fixed wire layout; there is no shared header beyond the byte itself,
//! so each type implements its own `encode`/`decode` pair rather than going
//! through a registry.

use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};

/// `message_type` byte values for the network-layer control messages.
pub mod message_type {
    pub const WHO_IS_ROUTER_TO_NETWORK: u8 = 0x00;
    pub const I_AM_ROUTER_TO_NETWORK: u8 = 0x01;
    pub const I_COULD_BE_ROUTER_TO_NETWORK: u8 = 0x02;
    pub const REJECT_MESSAGE_TO_NETWORK: u8 = 0x03;
    pub const ROUTER_BUSY_TO_NETWORK: u8 = 0x04;
    pub const ROUTER_AVAILABLE_TO_NETWORK: u8 = 0x05;
    pub const INITIALIZE_ROUTING_TABLE: u8 = 0x06;
    pub const INITIALIZE_ROUTING_TABLE_ACK: u8 = 0x07;
    pub const ESTABLISH_CONNECTION_TO_NETWORK: u8 = 0x08;
    pub const DISCONNECT_CONNECTION_TO_NETWORK: u8 = 0x09;
    pub const WHAT_IS_NETWORK_NUMBER: u8 = 0x12;
    pub const NETWORK_NUMBER_IS: u8 = 0x13;
}

/// Reject reason codes for [`RejectMessageToNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    NotDirectlyConnected = 1,
    Busy = 2,
    UnknownNetworkMessageType = 3,
    MessageTooLong = 4,
    SecurityError = 5,
    AddressingError = 6,
}

impl RejectReason {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NotDirectlyConnected,
            2 => Self::Busy,
            3 => Self::UnknownNetworkMessageType,
            4 => Self::MessageTooLong,
            5 => Self::SecurityError,
            6 => Self::AddressingError,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRouterToNetwork {
    pub network: Option<u16>,
}

impl WhoIsRouterToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if let Some(net) = self.network {
            w.write_be_u16(net)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let network = if r.is_empty() {
            None
        } else {
            Some(r.read_be_u16()?)
        };
        Ok(Self { network })
    }
}

/// A list of networks, used by [`IAmRouterToNetwork`], [`RouterBusyToNetwork`]
/// and [`RouterAvailableToNetwork`], each of which is just a run of 16-bit
/// network numbers filling the rest of the PDU.
fn encode_network_list(w: &mut Writer<'_>, networks: &[u16]) -> Result<(), EncodeError> {
    for net in networks {
        w.write_be_u16(*net)?;
    }
    Ok(())
}

fn decode_network_list(r: &mut Reader<'_>) -> Result<Vec<u16>, DecodeError> {
    let mut networks = Vec::new();
    while !r.is_empty() {
        networks.push(r.read_be_u16()?);
    }
    Ok(networks)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IAmRouterToNetwork {
    pub networks: Vec<u16>,
}

impl IAmRouterToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_network_list(w, &self.networks)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            networks: decode_network_list(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ICouldBeRouterToNetwork {
    pub network: u16,
    pub performance_index: u8,
}

impl ICouldBeRouterToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.network)?;
        w.write_u8(self.performance_index)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            network: r.read_be_u16()?,
            performance_index: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectMessageToNetwork {
    pub reason: RejectReason,
    pub dnet: u16,
}

impl RejectMessageToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(self.reason as u8)?;
        w.write_be_u16(self.dnet)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let reason = RejectReason::from_u8(r.read_u8()?);
        let dnet = r.read_be_u16()?;
        Ok(Self { reason, dnet })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterBusyToNetwork {
    pub networks: Vec<u16>,
}

impl RouterBusyToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_network_list(w, &self.networks)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            networks: decode_network_list(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterAvailableToNetwork {
    pub networks: Vec<u16>,
}

impl RouterAvailableToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_network_list(w, &self.networks)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            networks: decode_network_list(r)?,
        })
    }
}

/// A single entry of an [`InitializeRoutingTable`] / [`InitializeRoutingTableAck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub dnet: u16,
    pub port_id: u8,
    pub port_info: Vec<u8>,
}

fn encode_routing_table(w: &mut Writer<'_>, table: &[RoutingTableEntry]) -> Result<(), EncodeError> {
    if table.len() > u8::MAX as usize {
        return Err(EncodeError::InvalidLength);
    }
    w.write_u8(table.len() as u8)?;
    for entry in table {
        if entry.port_info.len() > u8::MAX as usize {
            return Err(EncodeError::InvalidLength);
        }
        w.write_be_u16(entry.dnet)?;
        w.write_u8(entry.port_id)?;
        w.write_u8(entry.port_info.len() as u8)?;
        w.write_all(&entry.port_info)?;
    }
    Ok(())
}

fn decode_routing_table(r: &mut Reader<'_>) -> Result<Vec<RoutingTableEntry>, DecodeError> {
    let count = r.read_u8()?;
    let mut table = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let dnet = r.read_be_u16()?;
        let port_id = r.read_u8()?;
        let port_info_len = r.read_u8()?;
        let port_info = r.read_exact(port_info_len as usize)?.to_vec();
        table.push(RoutingTableEntry {
            dnet,
            port_id,
            port_info,
        });
    }
    Ok(table)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitializeRoutingTable {
    pub table: Vec<RoutingTableEntry>,
}

impl InitializeRoutingTable {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_routing_table(w, &self.table)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            table: decode_routing_table(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitializeRoutingTableAck {
    pub table: Vec<RoutingTableEntry>,
}

impl InitializeRoutingTableAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_routing_table(w, &self.table)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            table: decode_routing_table(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishConnectionToNetwork {
    pub dnet: u16,
    pub termination_time_minutes: u8,
}

impl EstablishConnectionToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.dnet)?;
        w.write_u8(self.termination_time_minutes)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            dnet: r.read_be_u16()?,
            termination_time_minutes: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectConnectionToNetwork {
    pub dnet: u16,
}

impl DisconnectConnectionToNetwork {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.dnet)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            dnet: r.read_be_u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhatIsNetworkNumber;

impl WhatIsNetworkNumber {
    pub fn encode(&self, _w: &mut Writer<'_>) -> Result<(), EncodeError> {
        Ok(())
    }

    pub fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkNumberIs {
    pub network: u16,
    /// True if the network number is known to be configured rather than learned.
    pub configured: bool,
}

impl NetworkNumberIs {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.network)?;
        w.write_u8(u8::from(self.configured))
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let network = r.read_be_u16()?;
        let configured = r.read_u8()? != 0;
        Ok(Self {
            network,
            configured,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn who_is_router_to_network_roundtrips_with_and_without_network() {
        for msg in [
            WhoIsRouterToNetwork { network: None },
            WhoIsRouterToNetwork { network: Some(42) },
        ] {
            let mut buf = [0u8; 8];
            let mut w = Writer::new(&mut buf);
            msg.encode(&mut w).unwrap();
            let mut r = Reader::new(w.as_written());
            assert_eq!(WhoIsRouterToNetwork::decode(&mut r).unwrap(), msg);
        }
    }

    #[test]
    fn i_am_router_to_network_roundtrip() {
        let msg = IAmRouterToNetwork {
            networks: vec![1, 2, 3],
        };
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        msg.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        assert_eq!(IAmRouterToNetwork::decode(&mut r).unwrap(), msg);
    }

    #[test]
    fn reject_message_to_network_roundtrip() {
        let msg = RejectMessageToNetwork {
            reason: RejectReason::Busy,
            dnet: 99,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        msg.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        let dec = RejectMessageToNetwork::decode(&mut r).unwrap();
        assert_eq!(dec, msg);
    }

    #[test]
    fn routing_table_roundtrip() {
        let msg = InitializeRoutingTable {
            table: vec![
                RoutingTableEntry {
                    dnet: 10,
                    port_id: 1,
                    port_info: vec![1, 2, 3],
                },
                RoutingTableEntry {
                    dnet: 20,
                    port_id: 2,
                    port_info: vec![],
                },
            ],
        };
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        msg.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        assert_eq!(InitializeRoutingTable::decode(&mut r).unwrap(), msg);
    }

    #[test]
    fn network_number_is_roundtrip() {
        let msg = NetworkNumberIs {
            network: 7,
            configured: true,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        msg.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        assert_eq!(NetworkNumberIs::decode(&mut r).unwrap(), msg);
    }

    #[test]
    fn what_is_network_number_has_no_body() {
        let msg = WhatIsNetworkNumber;
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        msg.encode(&mut w).unwrap();
        assert_eq!(w.as_written().len(), 0);
    }
}
