use rustbac_core::encoding::{reader::Reader, writer::Writer};
use rustbac_core::{DecodeError, EncodeError};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const BVLC_TYPE_BIP: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvlcFunction {
    Result,
    WriteBroadcastDistributionTable,
    ReadBroadcastDistributionTable,
    ReadBroadcastDistributionTableAck,
    ForwardedNpdu,
    RegisterForeignDevice,
    ReadForeignDeviceTable,
    ReadForeignDeviceTableAck,
    DeleteForeignDeviceTableEntry,
    DistributeBroadcastToNetwork,
    OriginalUnicastNpdu,
    OriginalBroadcastNpdu,
    Unknown(u8),
}

impl BvlcFunction {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Result,
            0x01 => Self::WriteBroadcastDistributionTable,
            0x02 => Self::ReadBroadcastDistributionTable,
            0x03 => Self::ReadBroadcastDistributionTableAck,
            0x04 => Self::ForwardedNpdu,
            0x05 => Self::RegisterForeignDevice,
            0x06 => Self::ReadForeignDeviceTable,
            0x07 => Self::ReadForeignDeviceTableAck,
            0x08 => Self::DeleteForeignDeviceTableEntry,
            0x09 => Self::DistributeBroadcastToNetwork,
            0x0A => Self::OriginalUnicastNpdu,
            0x0B => Self::OriginalBroadcastNpdu,
            v => Self::Unknown(v),
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Result => 0x00,
            Self::WriteBroadcastDistributionTable => 0x01,
            Self::ReadBroadcastDistributionTable => 0x02,
            Self::ReadBroadcastDistributionTableAck => 0x03,
            Self::ForwardedNpdu => 0x04,
            Self::RegisterForeignDevice => 0x05,
            Self::ReadForeignDeviceTable => 0x06,
            Self::ReadForeignDeviceTableAck => 0x07,
            Self::DeleteForeignDeviceTableEntry => 0x08,
            Self::DistributeBroadcastToNetwork => 0x09,
            Self::OriginalUnicastNpdu => 0x0A,
            Self::OriginalBroadcastNpdu => 0x0B,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvlcHeader {
    pub function: BvlcFunction,
    pub length: u16,
}

impl BvlcHeader {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(BVLC_TYPE_BIP)?;
        w.write_u8(self.function.to_u8())?;
        w.write_be_u16(self.length)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.read_u8()? != BVLC_TYPE_BIP {
            return Err(DecodeError::InvalidValue);
        }
        let function = BvlcFunction::from_u8(r.read_u8()?);
        let length = r.read_be_u16()?;
        if length < 4 {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Self { function, length })
    }
}

/// Result codes carried by a [`BvlcFunction::Result`] reply.
///
/// Only the codes relevant to requests this stack issues or answers are
/// named explicitly; anything else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Successful,
    WriteBroadcastDistributionTableNak,
    ReadBroadcastDistributionTableNak,
    RegisterForeignDeviceNak,
    ReadForeignDeviceTableNak,
    DeleteForeignDeviceTableEntryNak,
    DistributeBroadcastToNetworkNak,
    Other(u16),
}

impl ResultCode {
    pub const fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Self::Successful,
            0x0010 => Self::WriteBroadcastDistributionTableNak,
            0x0020 => Self::ReadBroadcastDistributionTableNak,
            0x0030 => Self::RegisterForeignDeviceNak,
            0x0040 => Self::ReadForeignDeviceTableNak,
            0x0050 => Self::DeleteForeignDeviceTableEntryNak,
            0x0060 => Self::DistributeBroadcastToNetworkNak,
            v => Self::Other(v),
        }
    }

    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Successful => 0x0000,
            Self::WriteBroadcastDistributionTableNak => 0x0010,
            Self::ReadBroadcastDistributionTableNak => 0x0020,
            Self::RegisterForeignDeviceNak => 0x0030,
            Self::ReadForeignDeviceTableNak => 0x0040,
            Self::DeleteForeignDeviceTableEntryNak => 0x0050,
            Self::DistributeBroadcastToNetworkNak => 0x0060,
            Self::Other(v) => v,
        }
    }

    pub fn encode(self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.to_u16())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self::from_u16(r.read_be_u16()?))
    }
}

/// One row of a Broadcast Distribution Table: a BBMD peer's address and the
/// broadcast distribution mask it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    pub address: SocketAddrV4,
    pub mask: Ipv4Addr,
}

impl BdtEntry {
    const WIRE_LEN: usize = 10;

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_all(&self.address.ip().octets())?;
        w.write_be_u16(self.address.port())?;
        w.write_all(&self.mask.octets())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let ip = r.read_exact(4)?;
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        let port = r.read_be_u16()?;
        let mask = r.read_exact(4)?;
        let mask = Ipv4Addr::new(mask[0], mask[1], mask[2], mask[3]);
        Ok(Self {
            address: SocketAddrV4::new(ip, port),
            mask,
        })
    }
}

/// One row of a Foreign Device Table: a registered foreign device's address
/// and its registration lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    pub address: SocketAddrV4,
    pub ttl_seconds: u16,
    pub remaining_seconds: u16,
}

impl FdtEntry {
    const WIRE_LEN: usize = 10;

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_all(&self.address.ip().octets())?;
        w.write_be_u16(self.address.port())?;
        w.write_be_u16(self.ttl_seconds)?;
        w.write_be_u16(self.remaining_seconds)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let ip = r.read_exact(4)?;
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        let port = r.read_be_u16()?;
        let ttl_seconds = r.read_be_u16()?;
        let remaining_seconds = r.read_be_u16()?;
        Ok(Self {
            address: SocketAddrV4::new(ip, port),
            ttl_seconds,
            remaining_seconds,
        })
    }
}

fn encode_entries<T: Copy>(
    w: &mut Writer<'_>,
    entries: &[T],
    encode_one: impl Fn(&mut Writer<'_>, T) -> Result<(), EncodeError>,
) -> Result<(), EncodeError> {
    for entry in entries {
        encode_one(w, *entry)?;
    }
    Ok(())
}

fn decode_entries<T>(
    r: &mut Reader<'_>,
    wire_len: usize,
    decode_one: impl Fn(&mut Reader<'_>) -> Result<T, DecodeError>,
) -> Result<Vec<T>, DecodeError> {
    if r.remaining() % wire_len != 0 {
        return Err(DecodeError::InvalidLength);
    }
    let count = r.remaining() / wire_len;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode_one(r)?);
    }
    Ok(out)
}

/// Payload of a `Read-Broadcast-Distribution-Table-Ack`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadBdtAck {
    pub entries: Vec<BdtEntry>,
}

impl ReadBdtAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_entries(w, &self.entries, BdtEntry::encode)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entries: decode_entries(r, BdtEntry::WIRE_LEN, BdtEntry::decode)?,
        })
    }
}

/// Payload of a `Write-Broadcast-Distribution-Table` request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteBdt {
    pub entries: Vec<BdtEntry>,
}

impl WriteBdt {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_entries(w, &self.entries, BdtEntry::encode)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entries: decode_entries(r, BdtEntry::WIRE_LEN, BdtEntry::decode)?,
        })
    }
}

/// Payload of a `Read-Foreign-Device-Table-Ack`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadFdtAck {
    pub entries: Vec<FdtEntry>,
}

impl ReadFdtAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_entries(w, &self.entries, FdtEntry::encode)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entries: decode_entries(r, FdtEntry::WIRE_LEN, FdtEntry::decode)?,
        })
    }
}

/// Payload of a `Register-Foreign-Device` request: the TTL the foreign
/// device is asking the BBMD to hold its registration for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterForeignDeviceBody {
    pub ttl_seconds: u16,
}

impl RegisterForeignDeviceBody {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.ttl_seconds)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            ttl_seconds: r.read_be_u16()?,
        })
    }
}

/// Payload of a `Delete-Foreign-Device-Table-Entry` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteFdtEntryBody {
    pub address: SocketAddrV4,
}

impl DeleteFdtEntryBody {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_all(&self.address.ip().octets())?;
        w.write_be_u16(self.address.port())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let ip = r.read_exact(4)?;
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        let port = r.read_be_u16()?;
        Ok(Self {
            address: SocketAddrV4::new(ip, port),
        })
    }
}

/// Header prepended to the original NPDU when a BBMD relays it as a
/// `Forwarded-NPDU` -- the original source address, so recipients can tell
/// a forwarded broadcast apart from one sent directly by its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedNpduHeader {
    pub original_source: SocketAddrV4,
}

impl ForwardedNpduHeader {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_all(&self.original_source.ip().octets())?;
        w.write_be_u16(self.original_source.port())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let ip = r.read_exact(4)?;
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        let port = r.read_be_u16()?;
        Ok(Self {
            original_source: SocketAddrV4::new(ip, port),
        })
    }
}
