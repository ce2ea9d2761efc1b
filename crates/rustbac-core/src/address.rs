//! Layer-independent BACnet addressing.
//!
//! [`Address`] models the six address forms a BACnet network-layer entity
//! can take (null, local/remote broadcast, local/remote station, global
//! broadcast), each optionally carrying a **route**: another address the
//! network layer should use as a next-hop override rather than resolving
//! the destination itself. The route participates in neither equality nor
//! hashing -- two addresses that name the same destination are the same
//! address regardless of which router path reaches them.
//!
//! This is independent of whatever datalink technology ultimately carries
//! the MAC bytes; the datalink crate has its own, narrower address type for
//! the wire it actually speaks.

#[cfg(feature = "alloc")]
use alloc::{boxed::Box, format, string::String, vec::Vec};
#[cfg(feature = "std")]
use std::{boxed::Box, format, string::String, vec::Vec};

use core::fmt;
use core::str::FromStr;

/// Coarse datalink family a [`LocalStation`](AddressKind::LocalStation) MAC
/// belongs to. Carried only for `Debug`/`Display` and tests; it is never
/// itself part of an address's wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressFamily {
    Ethernet = 0,
    Arcnet = 1,
    Mstp = 2,
    Ipv4 = 3,
    Ipv6 = 4,
    Virtual = 5,
}

/// The six address forms, without routing information.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// No address; used as a placeholder before binding.
    Null,
    /// Broadcast on the local network.
    LocalBroadcast,
    /// A specific station on the local network, addressed by its MAC.
    LocalStation { mac: Vec<u8> },
    /// Broadcast on a specific remote network.
    RemoteBroadcast { net: u16 },
    /// A specific station on a specific remote network.
    RemoteStation { net: u16, mac: Vec<u8> },
    /// Broadcast on every network (DNET 0xFFFF).
    GlobalBroadcast,
}

/// A BACnet network-layer address: an [`AddressKind`] plus an optional
/// next-hop route.
#[derive(Debug, Clone)]
pub struct Address {
    pub kind: AddressKind,
    pub route: Option<Box<Address>>,
}

impl Address {
    pub const fn new(kind: AddressKind) -> Self {
        Self { kind, route: None }
    }

    pub fn with_route(mut self, route: Address) -> Self {
        self.route = Some(Box::new(route));
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, AddressKind::Null)
    }

    pub fn is_local_broadcast(&self) -> bool {
        matches!(self.kind, AddressKind::LocalBroadcast)
    }

    pub fn is_local_station(&self) -> bool {
        matches!(self.kind, AddressKind::LocalStation { .. })
    }

    pub fn is_remote_broadcast(&self) -> bool {
        matches!(self.kind, AddressKind::RemoteBroadcast { .. })
    }

    pub fn is_remote_station(&self) -> bool {
        matches!(self.kind, AddressKind::RemoteStation { .. })
    }

    pub fn is_global_broadcast(&self) -> bool {
        matches!(self.kind, AddressKind::GlobalBroadcast)
    }

    /// The network number this address targets, if it names one.
    pub fn net(&self) -> Option<u16> {
        match &self.kind {
            AddressKind::RemoteBroadcast { net } | AddressKind::RemoteStation { net, .. } => {
                Some(*net)
            }
            _ => None,
        }
    }

    /// The MAC bytes this address names, if it names a specific station.
    pub fn mac(&self) -> Option<&[u8]> {
        match &self.kind {
            AddressKind::LocalStation { mac } | AddressKind::RemoteStation { mac, .. } => {
                Some(mac)
            }
            _ => None,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Address {}

impl core::hash::Hash for Address {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AddressKind::Null => write!(f, "Null")?,
            AddressKind::LocalBroadcast => write!(f, "*")?,
            AddressKind::LocalStation { mac } => write!(f, "{}", format_mac(mac))?,
            AddressKind::RemoteBroadcast { net } => write!(f, "{net}:*")?,
            AddressKind::RemoteStation { net, mac } => write!(f, "{net}:{}", format_mac(mac))?,
            AddressKind::GlobalBroadcast => write!(f, "*:*")?,
        }
        if let Some(route) = &self.route {
            write!(f, "@{route}")?;
        }
        Ok(())
    }
}

fn format_mac(mac: &[u8]) -> String {
    let mut s = String::with_capacity(2 + mac.len() * 2);
    s.push_str("0x");
    for b in mac {
        s.push_str(&format!("{b:02X}"));
    }
    s
}

/// Error returned by [`Address::from_str`] when the text does not match any
/// recognized address form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid BACnet address")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AddressParseError {}

/// Parses the textual forms BACnet tools commonly accept:
///
/// - `*` -- local broadcast
/// - `*:*` -- global broadcast
/// - `NET:*` -- remote broadcast on network `NET`
/// - `0xAABBCCDDEEFF` -- local station, contiguous hex MAC
/// - `NET:0xAABBCCDDEEFF` -- remote station
/// - a bare decimal integer -- local station, one-byte MAC (e.g. MS/TP)
/// - any of the above followed by `@route` -- attaches a next-hop route
///
/// A MAC, once decoded, must be 0, 1, 3, 6 or 18 bytes long; any other
/// length is rejected.
impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, route) = match s.split_once('@') {
            Some((body, route)) => (body, Some(route.parse::<Address>()?)),
            None => (s, None),
        };

        let kind = parse_kind(body)?;
        let mut addr = Address::new(kind);
        addr.route = route.map(Box::new);
        Ok(addr)
    }
}

fn parse_kind(s: &str) -> Result<AddressKind, AddressParseError> {
    if s == "*" {
        return Ok(AddressKind::LocalBroadcast);
    }
    if s == "*:*" {
        return Ok(AddressKind::GlobalBroadcast);
    }

    if let Some((net_part, rest)) = s.split_once(':') {
        if let Ok(net) = net_part.parse::<u16>() {
            if net == 0xFFFF {
                return Err(AddressParseError);
            }
            if rest == "*" {
                return Ok(AddressKind::RemoteBroadcast { net });
            }
            let mac = parse_mac(rest)?;
            return Ok(AddressKind::RemoteStation { net, mac });
        }
    }

    let mac = parse_mac(s)?;
    Ok(AddressKind::LocalStation { mac })
}

/// Parses a single address-field token: either a `0x`-prefixed contiguous
/// hex MAC or a bare decimal byte, per the `_field_address` grammar in the
/// original BACnet address parser.
fn parse_mac(s: &str) -> Result<Vec<u8>, AddressParseError> {
    let mac = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        parse_hex_mac(hex)?
    } else {
        let value: u8 = s.parse().map_err(|_| AddressParseError)?;
        [value].into()
    };
    validate_mac_len(&mac)?;
    Ok(mac)
}

fn parse_hex_mac(hex: &str) -> Result<Vec<u8>, AddressParseError> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err(AddressParseError);
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| AddressParseError))
        .collect()
}

/// BACnet MAC addresses are only ever 0 bytes (none), 1 (MS/TP, ARCNET),
/// 3 (LonTalk), 6 (Ethernet, BACnet/IP) or 18 (BACnet/IPv6) bytes long.
fn validate_mac_len(mac: &[u8]) -> Result<(), AddressParseError> {
    match mac.len() {
        0 | 1 | 3 | 6 | 18 => Ok(()),
        _ => Err(AddressParseError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_broadcast() {
        assert_eq!(
            "*".parse::<Address>().unwrap().kind,
            AddressKind::LocalBroadcast
        );
    }

    #[test]
    fn parses_global_broadcast() {
        assert_eq!(
            "*:*".parse::<Address>().unwrap().kind,
            AddressKind::GlobalBroadcast
        );
    }

    #[test]
    fn parses_remote_broadcast() {
        assert_eq!(
            "2001:*".parse::<Address>().unwrap().kind,
            AddressKind::RemoteBroadcast { net: 2001 }
        );
    }

    #[test]
    fn rejects_network_number_0xffff() {
        assert!("65535:*".parse::<Address>().is_err());
    }

    #[test]
    fn parses_local_station_mac() {
        let addr: Address = "0xAABBCCDDEEFF".parse().unwrap();
        assert_eq!(
            addr.kind,
            AddressKind::LocalStation {
                mac: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff].into()
            }
        );
        assert_eq!(addr.to_string(), "0xAABBCCDDEEFF");
    }

    #[test]
    fn parses_remote_station_mac() {
        let addr: Address = "17:0xAABBCCDDEEFF".parse().unwrap();
        assert_eq!(
            addr.kind,
            AddressKind::RemoteStation {
                net: 17,
                mac: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff].into()
            }
        );
    }

    #[test]
    fn parses_bare_integer_as_one_byte_mac() {
        assert_eq!(
            "42".parse::<Address>().unwrap().kind,
            AddressKind::LocalStation { mac: [42].into() }
        );
    }

    #[test]
    fn parses_route_suffix() {
        let addr: Address = "17:0xAABBCCDDEEFF@*".parse().unwrap();
        assert_eq!(
            addr.route.as_deref().map(|r| &r.kind),
            Some(&AddressKind::LocalBroadcast)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-an-address".parse::<Address>().is_err());
    }

    #[test]
    fn parses_short_hex_mac() {
        assert_eq!(
            "0x1234".parse::<Address>().unwrap().kind,
            AddressKind::LocalStation { mac: [0x12, 0x34].into() }
        );
    }

    #[test]
    fn parses_remote_station_short_hex_mac() {
        assert_eq!(
            "5:0x0a".parse::<Address>().unwrap().kind,
            AddressKind::RemoteStation {
                net: 5,
                mac: [0x0a].into(),
            }
        );
    }

    #[test]
    fn rejects_colon_separated_mac() {
        assert!("aa:bb:cc:dd:ee:ff".parse::<Address>().is_err());
    }

    #[test]
    fn rejects_mac_length_outside_allowed_set() {
        assert!("0xAABBCCDD".parse::<Address>().is_err());
        assert!("0xAABBCCDDEE".parse::<Address>().is_err());
        assert!("0xAABBCCDDEEFF00112233445566778899"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn accepts_every_allowed_mac_length() {
        assert!("0x".parse::<Address>().is_err());
        assert!("0xAA".parse::<Address>().is_ok());
        assert!("0xAABBCC".parse::<Address>().is_ok());
        assert!("0xAABBCCDDEEFF".parse::<Address>().is_ok());
        assert!("0xAABBCCDDEEFF0011223344556677".parse::<Address>().is_ok());
    }

    #[test]
    fn equality_and_hash_ignore_route() {
        let a = Address::new(AddressKind::RemoteStation {
            net: 5,
            mac: [1, 2, 3].into(),
        });
        let mut b = a.clone();
        b.route = Some(Box::new(Address::new(AddressKind::LocalBroadcast)));
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut ha = DefaultHasher::new();
        a.hash(&mut ha);
        let mut hb = DefaultHasher::new();
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }
}
