//! Application-layer Segmentation State Machines (SSM).
//!
//! Modeled per spec.md §9's design note: each SSM is a plain state struct
//! with a `poll(event) -> Vec<Action>` step. No I/O happens inside; the
//! actions name what the caller (the ASAP, see [`crate::asap`]) should do --
//! send a PDU, arm a timer, deliver data upward. This makes every state
//! transition exercisable with a handful of synthetic events and no socket.

pub mod client;
pub mod server;

use crate::error::SsmError;
use rustbac_core::apdu::{
    AbortPdu, BacnetError, ComplexAckHeader, ConfirmedRequestHeader, RejectPdu, SegmentAck,
    SimpleAck,
};
use rustbac_core::encoding::reader::Reader;
use rustbac_core::apdu::ApduType;

/// A decoded incoming APDU header plus whatever service-data bytes followed
/// it (the full payload for an unsegmented PDU, one segment's worth for a
/// segmented one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingApdu {
    ConfirmedRequest(ConfirmedRequestHeader, Vec<u8>),
    SimpleAck(SimpleAck),
    ComplexAck(ComplexAckHeader, Vec<u8>),
    SegmentAck(SegmentAck),
    Error(BacnetError),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

/// Dispatches on the PDU-type nibble and decodes the matching header,
/// leaving the rest of `bytes` as service data.
pub fn decode_incoming_apdu(bytes: &[u8]) -> Result<IncomingApdu, SsmError> {
    if bytes.is_empty() {
        return Err(SsmError::Decode("empty apdu"));
    }
    let pdu_type = ApduType::from_u8(bytes[0] >> 4).ok_or(SsmError::Decode("unknown pdu type"))?;
    let mut r = Reader::new(bytes);
    match pdu_type {
        ApduType::ConfirmedRequest => {
            let header = ConfirmedRequestHeader::decode(&mut r)
                .map_err(|_| SsmError::Decode("confirmed request header"))?;
            Ok(IncomingApdu::ConfirmedRequest(
                header,
                bytes[r.position()..].to_vec(),
            ))
        }
        ApduType::ComplexAck => {
            let header = ComplexAckHeader::decode(&mut r)
                .map_err(|_| SsmError::Decode("complex ack header"))?;
            Ok(IncomingApdu::ComplexAck(
                header,
                bytes[r.position()..].to_vec(),
            ))
        }
        ApduType::SimpleAck => SimpleAck::decode(&mut r)
            .map(IncomingApdu::SimpleAck)
            .map_err(|_| SsmError::Decode("simple ack")),
        ApduType::SegmentAck => SegmentAck::decode(&mut r)
            .map(IncomingApdu::SegmentAck)
            .map_err(|_| SsmError::Decode("segment ack")),
        ApduType::Error => BacnetError::decode(&mut r)
            .map(IncomingApdu::Error)
            .map_err(|_| SsmError::Decode("error pdu")),
        ApduType::Reject => RejectPdu::decode(&mut r)
            .map(IncomingApdu::Reject)
            .map_err(|_| SsmError::Decode("reject pdu")),
        ApduType::Abort => AbortPdu::decode(&mut r)
            .map(IncomingApdu::Abort)
            .map_err(|_| SsmError::Decode("abort pdu")),
        ApduType::UnconfirmedRequest => Err(SsmError::Decode("unconfirmed request in ssm")),
    }
}

/// True when `seq` falls inside `[start, start + window)` mod 256 -- the
/// set of sequence numbers that can legitimately be outstanding in the
/// current burst. An ack (or segment) whose sequence number falls outside
/// this range refers to a prior burst and is a duplicate/stale PDU: it
/// should not advance any counters, only restart the relevant timer.
pub fn in_window(seq: u8, start: u8, window: u8) -> bool {
    let offset = seq.wrapping_sub(start);
    offset < window
}

/// Events an SSM reacts to, per spec.md §9. `PduFromApplication` only
/// applies to `ServerSsm`: a `ClientSsm`'s one outgoing request is supplied
/// directly to `ClientSsm::new` rather than threaded through `poll`,
/// because the whole transaction begins with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TimerExpired,
    PduReceived(IncomingApdu),
    PduFromApplication(ApplicationResponse),
    Cancel,
}

/// What the application layer hands a `ClientSsm` to send: a fully-encoded
/// service-level APDU body plus the service choice it belongs to, so
/// `get_segment` can rebuild a `ConfirmedRequestHeader`/`ComplexAckHeader`
/// per segment the way `appservice.py`'s `get_segment` does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingApdu {
    pub service_choice: u8,
    pub data: Vec<u8>,
}

/// What the application layer hands a `ServerSsm` once it has finished
/// processing a request -- any of the PDU kinds a server may answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationResponse {
    SimpleAck,
    ComplexAck { service_choice: u8, data: Vec<u8> },
    Error { error_class: u32, error_code: u32 },
    Reject { reason: u8 },
    Abort { reason: crate::error::AbortReason },
}

/// What an SSM wants done, emitted from `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendPdu(Vec<u8>),
    SetTimer(core::time::Duration),
    DeliverUpward(DeliveredApdu),
    Done,
}

/// A fully reassembled (or never-segmented) APDU delivered to the
/// application or peer-ward caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredApdu {
    SimpleAck(SimpleAck),
    ComplexAck { service_choice: u8, data: Vec<u8> },
    Error(BacnetError),
    Reject(RejectPdu),
    Abort(AbortPdu),
    ConfirmedRequest { service_choice: u8, data: Vec<u8> },
}

/// The transaction's lifecycle phase; mirrors spec.md §3's `SSM transaction
/// state` enumeration exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl TransactionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Splits `data` into `segment_size`-byte chunks, at least one chunk even
/// for empty data (spec.md §4.5 segment count is `max(1, ceil(...))`).
pub fn segment_chunks(data: &[u8], segment_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![&data[..0]];
    }
    data.chunks(segment_size.max(1)).collect()
}
