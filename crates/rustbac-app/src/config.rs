//! Process-level segmentation defaults, threaded explicitly through
//! construction rather than kept as global mutable state (spec.md §9).

use std::time::Duration;

/// Shared ASAP/SSM configuration. Every transaction copies the fields it
/// needs out of this value at creation time, the way `appservice.py`'s
/// `SSM.__init__` snapshots `sap`/`device_object` fields per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SapConfig {
    pub apdu_timeout: Duration,
    pub segment_timeout: Duration,
    pub application_timeout: Duration,
    pub number_of_apdu_retries: u8,
    pub max_apdu_length_accepted: u32,
    pub max_segments_accepted: u8,
    pub proposed_window_size: u8,
    pub segmentation_supported: Segmentation,
}

/// Which direction(s) of segmented transfer a node supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmentation {
    None,
    Transmit,
    Receive,
    Both,
}

impl Segmentation {
    pub const fn can_transmit(self) -> bool {
        matches!(self, Self::Transmit | Self::Both)
    }

    pub const fn can_receive(self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            apdu_timeout: Duration::from_millis(3000),
            segment_timeout: Duration::from_millis(1500),
            application_timeout: Duration::from_millis(3000),
            number_of_apdu_retries: 3,
            max_apdu_length_accepted: 1024,
            max_segments_accepted: 2,
            proposed_window_size: 2,
            segmentation_supported: Segmentation::Both,
        }
    }
}

impl SapConfig {
    pub fn with_apdu_timeout(mut self, timeout: Duration) -> Self {
        self.apdu_timeout = timeout;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_application_timeout(mut self, timeout: Duration) -> Self {
        self.application_timeout = timeout;
        self
    }

    pub fn with_number_of_apdu_retries(mut self, retries: u8) -> Self {
        self.number_of_apdu_retries = retries;
        self
    }

    pub fn with_max_apdu_length_accepted(mut self, len: u32) -> Self {
        self.max_apdu_length_accepted = len;
        self
    }

    pub fn with_max_segments_accepted(mut self, max: u8) -> Self {
        self.max_segments_accepted = max;
        self
    }

    pub fn with_proposed_window_size(mut self, window: u8) -> Self {
        self.proposed_window_size = window;
        self
    }

    pub fn with_segmentation_supported(mut self, value: Segmentation) -> Self {
        self.segmentation_supported = value;
        self
    }
}

/// Maps a maxApduLengthAccepted byte (the nibble BACnet puts in
/// `ConfirmedRequestHeader::max_apdu`) to its octet count, per the standard's
/// fixed table (clause 20.1.2.5).
pub const fn max_apdu_octets(code: u8) -> u32 {
    match code {
        0 => 50,
        1 => 128,
        2 => 206,
        3 => 480,
        4 => 1024,
        5 => 1476,
        _ => 480,
    }
}

/// Decodes a `maxSegmentsAccepted` nibble (clause 20.1.2.4) to an actual
/// segment count. `0` ("unspecified") and `7` ("greater than 64") have no
/// exact numeric value, so both map to `None` -- callers then treat the
/// limit as unknown rather than guessing a number.
pub const fn decode_max_segments_accepted(code: u8) -> Option<u32> {
    match code {
        1 => Some(2),
        2 => Some(4),
        3 => Some(8),
        4 => Some(16),
        5 => Some(32),
        6 => Some(64),
        _ => None,
    }
}

/// Inverse of [`max_apdu_octets`]: the largest code whose octet count does
/// not exceed `len`.
pub const fn encode_max_apdu_length_accepted(len: u32) -> u8 {
    if len >= 1476 {
        5
    } else if len >= 1024 {
        4
    } else if len >= 480 {
        3
    } else if len >= 206 {
        2
    } else if len >= 128 {
        1
    } else {
        0
    }
}
