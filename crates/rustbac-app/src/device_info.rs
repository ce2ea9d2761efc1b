//! The device-info cache collaborator (spec.md §6): what the ASAP/SSM layer
//! knows about a peer's segmentation capabilities, keyed by its network
//! address.

use crate::config::Segmentation;
use rustbac_core::address::Address;
use std::collections::HashMap;

/// Cached capabilities of a remote device, learned from prior I-Am / APDU
/// headers rather than configured up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub max_apdu_length_accepted: u32,
    pub max_npdu_length: u32,
    pub max_segments_accepted: Option<u8>,
    pub segmentation_supported: Segmentation,
    pub vendor_id: Option<u16>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            max_apdu_length_accepted: 480,
            max_npdu_length: 1497,
            max_segments_accepted: None,
            segmentation_supported: Segmentation::None,
            vendor_id: None,
        }
    }
}

/// `HashMap`-backed device-info cache, in the idiom of the teacher's
/// `CovSubscriptionManager`-style manager structs: a plain map guarded by
/// whatever synchronization its owner needs, with no I/O of its own.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfoCache {
    entries: HashMap<Address, DeviceInfo>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<DeviceInfo> {
        self.entries.get(address).copied()
    }

    pub fn update(&mut self, address: Address, info: DeviceInfo) {
        self.entries.insert(address, info);
    }

    /// Upgrades the cached segmentation-supported flag when a peer's
    /// ConfirmedRequest carries the SA bit but the cache still says it
    /// cannot receive segments -- the opportunistic upgrade spec.md §4.5.2
    /// calls for in `ServerSSM`'s IDLE handling.
    pub fn note_segmented_response_accepted(&mut self, address: &Address) {
        let entry = self.entries.entry(address.clone()).or_default();
        entry.segmentation_supported = match entry.segmentation_supported {
            Segmentation::None => Segmentation::Receive,
            Segmentation::Transmit => Segmentation::Both,
            other => other,
        };
    }
}
