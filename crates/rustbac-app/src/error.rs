//! Error taxonomy for the application layer, per spec.md §4.6/§7.

use thiserror::Error;

/// The BACnet abort reason codes an SSM can raise on its own initiative.
///
/// These map directly onto the reason byte of an `AbortPDU` (clause 20.1.2.13
/// of the standard); only the subset an SSM itself produces is named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
}

impl AbortReason {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Errors produced by the segmentation state machines.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SsmError {
    #[error("local node does not support segmentation for this transmission")]
    SegmentationNotSupported,
    #[error("apdu exceeds the peer's maxSegmentsAccepted")]
    ApduTooLong,
    #[error("apdu received while the transaction was not expecting one")]
    InvalidApduInThisState,
    #[error("no response from peer after exhausting retries")]
    NoResponse,
    #[error("application did not respond to a confirmed request in time")]
    ServerTimeout,
    #[error("malformed apdu: {0}")]
    Decode(&'static str),
}

impl SsmError {
    pub const fn abort_reason(self) -> AbortReason {
        match self {
            Self::SegmentationNotSupported => AbortReason::SegmentationNotSupported,
            Self::ApduTooLong => AbortReason::ApduTooLong,
            Self::InvalidApduInThisState => AbortReason::InvalidApduInThisState,
            Self::NoResponse => AbortReason::TsmTimeout,
            Self::ServerTimeout => AbortReason::ApplicationExceededReplyTime,
            Self::Decode(_) => AbortReason::Other,
        }
    }
}

/// Errors raised by the Application Service Access Point's own bookkeeping,
/// as opposed to a specific transaction's SSM.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AsapError {
    #[error("no free invoke id for this peer")]
    InvokeIdsExhausted,
    #[error("no transaction found for this (invoke id, peer) pair")]
    UnknownTransaction,
}

/// Errors raised by the Network Service Access Point.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NsapError {
    #[error("no adapter is bound to this network")]
    UnknownNetwork,
    #[error("hop count exhausted before reaching the destination")]
    HopCountExceeded,
    #[error("destination network is unreachable")]
    NoRoute,
}
