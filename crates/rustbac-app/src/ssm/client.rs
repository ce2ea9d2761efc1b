//! The client-side segmentation state machine (spec.md §4.5.1): owns one
//! outstanding confirmed request to one peer, from `indication` through to
//! COMPLETED or ABORTED.

use super::{in_window, Action, DeliveredApdu, Event, IncomingApdu, OutgoingApdu, TransactionState};
use crate::config::{encode_max_apdu_length_accepted, SapConfig};
use crate::device_info::DeviceInfo;
use crate::error::AbortReason;
use rustbac_core::apdu::{AbortPdu, ComplexAckHeader, ConfirmedRequestHeader, SegmentAck};
use rustbac_core::encoding::writer::Writer;

/// One client transaction. Created by the ASAP for a single
/// `indication(APDU)` call; everything needed to resend, reassemble, or
/// abort lives here so `poll` never needs outside state beyond the event.
pub struct ClientSsm {
    state: TransactionState,
    invoke_id: u8,
    service_choice: u8,
    data: Vec<u8>,
    segment_size: usize,
    segment_count: usize,
    segmented_response_accepted: bool,
    max_segments_nibble: u8,
    max_apdu_nibble: u8,
    proposed_window_size: u8,
    window: u8,
    initial_sequence_number: u8,
    sent_all_segments: bool,
    segment_retry_count: u8,
    retry_count: u8,
    config: SapConfig,
    last_sequence_number: u8,
    window_start: u8,
    reassembled: Vec<u8>,
    response_service_choice: u8,
}

impl ClientSsm {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// `indication(APDU)`: sizes the request against `peer` (when known),
    /// runs the pre-flight checks of spec.md §4.5, and returns the new
    /// transaction along with the actions its creation already implies.
    pub fn new(
        invoke_id: u8,
        request: OutgoingApdu,
        peer: Option<DeviceInfo>,
        config: SapConfig,
    ) -> (Self, Vec<Action>) {
        let segment_size = peer
            .map(|p| p.max_npdu_length.min(p.max_apdu_length_accepted) as usize)
            .unwrap_or(config.max_apdu_length_accepted as usize)
            .max(1);
        let len = request.data.len();
        let segment_count = if len == 0 {
            1
        } else {
            len.div_ceil(segment_size)
        };

        let mut ssm = Self {
            state: TransactionState::Idle,
            invoke_id,
            service_choice: request.service_choice,
            data: request.data,
            segment_size,
            segment_count,
            segmented_response_accepted: config.segmentation_supported.can_receive(),
            max_segments_nibble: config.max_segments_accepted,
            max_apdu_nibble: encode_max_apdu_length_accepted(config.max_apdu_length_accepted),
            proposed_window_size: config.proposed_window_size,
            window: config.proposed_window_size,
            initial_sequence_number: 0,
            sent_all_segments: false,
            segment_retry_count: 0,
            retry_count: 0,
            config,
            last_sequence_number: 0,
            window_start: 0,
            reassembled: Vec::new(),
            response_service_choice: 0,
        };

        if segment_count > 1 {
            if !config.segmentation_supported.can_transmit() {
                return ssm.abort_on_creation(AbortReason::SegmentationNotSupported);
            }
            if let Some(p) = peer {
                if !p.segmentation_supported.can_receive() {
                    return ssm.abort_on_creation(AbortReason::SegmentationNotSupported);
                }
                if let Some(max_segments) = p.max_segments_accepted {
                    if segment_count > max_segments as usize {
                        return ssm.abort_on_creation(AbortReason::ApduTooLong);
                    }
                }
            }
        }

        let actions = if segment_count == 1 {
            ssm.state = TransactionState::AwaitConfirmation;
            ssm.sent_all_segments = true;
            let bytes = ssm.encode_unsegmented();
            vec![
                Action::SendPdu(bytes),
                Action::SetTimer(ssm.config.apdu_timeout),
            ]
        } else {
            ssm.state = TransactionState::SegmentedRequest;
            let mut actions = ssm.fill_window(0, ssm.proposed_window_size);
            actions.push(Action::SetTimer(ssm.config.segment_timeout));
            actions
        };
        (ssm, actions)
    }

    fn abort_on_creation(mut self, reason: AbortReason) -> (Self, Vec<Action>) {
        self.state = TransactionState::Aborted;
        let abort = AbortPdu {
            server: false,
            invoke_id: self.invoke_id,
            reason: reason.to_u8(),
        };
        // Client-originated pre-flight aborts are reported upward only;
        // there is no peer transaction to notify (spec.md §4.5).
        let actions = vec![Action::DeliverUpward(DeliveredApdu::Abort(abort)), Action::Done];
        (self, actions)
    }

    /// Drives the state machine with one event, returning the actions the
    /// caller must perform. Cancellation is handled uniformly regardless of
    /// state, per spec.md §5.
    pub fn poll(&mut self, event: Event) -> Vec<Action> {
        if matches!(event, Event::Cancel) && !self.state.is_terminal() {
            return self.abort_in_place(AbortReason::TsmTimeout, false);
        }
        match self.state {
            TransactionState::SegmentedRequest => self.poll_segmented_request(event),
            TransactionState::AwaitConfirmation => self.poll_await_confirmation(event),
            TransactionState::SegmentedConfirmation => self.poll_segmented_confirmation(event),
            _ => vec![],
        }
    }

    fn poll_segmented_request(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduReceived(IncomingApdu::SegmentAck(ack)) => {
                self.window = ack.actual_window_size.max(1);
                if !in_window(ack.sequence_number, self.initial_sequence_number, self.window) {
                    return vec![Action::SetTimer(self.config.segment_timeout)];
                }
                if self.sent_all_segments {
                    self.state = TransactionState::AwaitConfirmation;
                    return vec![Action::SetTimer(self.config.apdu_timeout)];
                }
                self.initial_sequence_number = ack.sequence_number.wrapping_add(1);
                self.segment_retry_count = 0;
                let mut actions = self.fill_window(self.initial_sequence_number, self.window);
                actions.push(Action::SetTimer(self.config.segment_timeout));
                actions
            }
            Event::PduReceived(IncomingApdu::SimpleAck(ack)) => {
                if !self.sent_all_segments {
                    return self.abort_in_place(AbortReason::InvalidApduInThisState, true);
                }
                self.state = TransactionState::Completed;
                vec![
                    Action::DeliverUpward(DeliveredApdu::SimpleAck(ack)),
                    Action::Done,
                ]
            }
            Event::PduReceived(IncomingApdu::ComplexAck(header, data)) => {
                if !self.sent_all_segments {
                    return self.abort_in_place(AbortReason::InvalidApduInThisState, true);
                }
                if !header.segmented {
                    self.state = TransactionState::Completed;
                    vec![
                        Action::DeliverUpward(DeliveredApdu::ComplexAck {
                            service_choice: header.service_choice,
                            data,
                        }),
                        Action::Done,
                    ]
                } else {
                    self.enter_segmented_confirmation(header, data)
                }
            }
            Event::PduReceived(IncomingApdu::Error(e)) => {
                self.state = TransactionState::Completed;
                vec![Action::DeliverUpward(DeliveredApdu::Error(e)), Action::Done]
            }
            Event::PduReceived(IncomingApdu::Reject(r)) => {
                self.state = TransactionState::Completed;
                vec![Action::DeliverUpward(DeliveredApdu::Reject(r)), Action::Done]
            }
            Event::PduReceived(IncomingApdu::Abort(a)) => {
                self.state = TransactionState::Aborted;
                vec![Action::DeliverUpward(DeliveredApdu::Abort(a)), Action::Done]
            }
            Event::TimerExpired => {
                if self.segment_retry_count < self.config.number_of_apdu_retries {
                    self.segment_retry_count += 1;
                    log::debug!(
                        "client transaction invoke_id={} segment retry {}/{}",
                        self.invoke_id,
                        self.segment_retry_count,
                        self.config.number_of_apdu_retries
                    );
                    let mut actions =
                        self.fill_window(self.initial_sequence_number, self.window);
                    actions.push(Action::SetTimer(self.config.segment_timeout));
                    actions
                } else {
                    self.abort_in_place(AbortReason::TsmTimeout, false)
                }
            }
            _ => vec![],
        }
    }

    fn poll_await_confirmation(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduReceived(IncomingApdu::Abort(a)) => {
                self.state = TransactionState::Aborted;
                vec![Action::DeliverUpward(DeliveredApdu::Abort(a)), Action::Done]
            }
            Event::PduReceived(IncomingApdu::SimpleAck(ack)) => {
                self.state = TransactionState::Completed;
                vec![
                    Action::DeliverUpward(DeliveredApdu::SimpleAck(ack)),
                    Action::Done,
                ]
            }
            Event::PduReceived(IncomingApdu::Error(e)) => {
                self.state = TransactionState::Completed;
                vec![Action::DeliverUpward(DeliveredApdu::Error(e)), Action::Done]
            }
            Event::PduReceived(IncomingApdu::Reject(r)) => {
                self.state = TransactionState::Completed;
                vec![Action::DeliverUpward(DeliveredApdu::Reject(r)), Action::Done]
            }
            Event::PduReceived(IncomingApdu::ComplexAck(header, data)) => {
                if !header.segmented {
                    self.state = TransactionState::Completed;
                    vec![
                        Action::DeliverUpward(DeliveredApdu::ComplexAck {
                            service_choice: header.service_choice,
                            data,
                        }),
                        Action::Done,
                    ]
                } else if header.sequence_number == Some(0) {
                    self.enter_segmented_confirmation(header, data)
                } else {
                    // Not the first segment of the response; keep waiting.
                    vec![]
                }
            }
            Event::PduReceived(IncomingApdu::SegmentAck(_)) => {
                vec![Action::SetTimer(self.config.apdu_timeout)]
            }
            Event::TimerExpired => {
                if self.retry_count < self.config.number_of_apdu_retries {
                    self.retry_count += 1;
                    log::debug!(
                        "client transaction invoke_id={} confirmation retry {}/{}",
                        self.invoke_id,
                        self.retry_count,
                        self.config.number_of_apdu_retries
                    );
                    if self.segment_count == 1 {
                        let bytes = self.encode_unsegmented();
                        vec![
                            Action::SendPdu(bytes),
                            Action::SetTimer(self.config.apdu_timeout),
                        ]
                    } else {
                        // Open Question #1 (spec.md §9): re-issuing the
                        // initial request re-runs segmentation from
                        // scratch, but `retry_count` -- the ConfirmedRequest
                        // retry counter -- is preserved across the
                        // re-entry; only the segment-level counter resets.
                        self.state = TransactionState::SegmentedRequest;
                        self.initial_sequence_number = 0;
                        self.segment_retry_count = 0;
                        self.sent_all_segments = false;
                        self.window = self.proposed_window_size;
                        let mut actions = self.fill_window(0, self.proposed_window_size);
                        actions.push(Action::SetTimer(self.config.segment_timeout));
                        actions
                    }
                } else {
                    self.abort_in_place(AbortReason::TsmTimeout, false)
                }
            }
            _ => vec![],
        }
    }

    fn poll_segmented_confirmation(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduReceived(IncomingApdu::ComplexAck(header, data)) if header.segmented => {
                let seq = header.sequence_number.unwrap_or(0);
                let expected = self.last_sequence_number.wrapping_add(1);
                if seq != expected {
                    return vec![
                        Action::SendPdu(self.encode_segment_ack(true, self.last_sequence_number)),
                        Action::SetTimer(self.config.segment_timeout),
                    ];
                }
                self.reassembled.extend_from_slice(&data);
                self.last_sequence_number = seq;
                if !header.more_follows {
                    self.state = TransactionState::Completed;
                    let ack = self.encode_segment_ack(false, seq);
                    let data = core::mem::take(&mut self.reassembled);
                    return vec![
                        Action::SendPdu(ack),
                        Action::DeliverUpward(DeliveredApdu::ComplexAck {
                            service_choice: self.response_service_choice,
                            data,
                        }),
                        Action::Done,
                    ];
                }
                if seq == self.window_start.wrapping_add(self.window.max(1) - 1) {
                    self.window_start = seq.wrapping_add(1);
                    vec![
                        Action::SendPdu(self.encode_segment_ack(false, seq)),
                        Action::SetTimer(self.config.segment_timeout),
                    ]
                } else {
                    vec![Action::SetTimer(self.config.segment_timeout)]
                }
            }
            Event::TimerExpired => self.abort_in_place(AbortReason::TsmTimeout, false),
            _ => vec![],
        }
    }

    fn enter_segmented_confirmation(
        &mut self,
        header: ComplexAckHeader,
        data: Vec<u8>,
    ) -> Vec<Action> {
        self.window = header
            .proposed_window_size
            .unwrap_or(1)
            .min(self.proposed_window_size)
            .max(1);
        self.last_sequence_number = 0;
        self.window_start = 0;
        self.reassembled = data;
        self.response_service_choice = header.service_choice;
        self.state = TransactionState::SegmentedConfirmation;
        vec![
            Action::SendPdu(self.encode_segment_ack(false, 0)),
            Action::SetTimer(self.config.segment_timeout),
        ]
    }

    fn abort_in_place(&mut self, reason: AbortReason, send_to_peer: bool) -> Vec<Action> {
        log::debug!(
            "client transaction invoke_id={} aborting: {:?}",
            self.invoke_id,
            reason
        );
        self.state = TransactionState::Aborted;
        let abort = AbortPdu {
            server: false,
            invoke_id: self.invoke_id,
            reason: reason.to_u8(),
        };
        let mut actions = Vec::new();
        if send_to_peer {
            let mut buf = [0u8; 8];
            let mut w = Writer::new(&mut buf);
            if abort.encode(&mut w).is_ok() {
                actions.push(Action::SendPdu(w.as_written().to_vec()));
            }
        }
        actions.push(Action::DeliverUpward(DeliveredApdu::Abort(abort)));
        actions.push(Action::Done);
        actions
    }

    fn encode_segment_ack(&self, negative_ack: bool, sequence_number: u8) -> Vec<u8> {
        let ack = SegmentAck {
            negative_ack,
            sent_by_server: true,
            invoke_id: self.invoke_id,
            sequence_number,
            actual_window_size: self.window,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).expect("fixed-size segment ack");
        w.as_written().to_vec()
    }

    fn encode_unsegmented(&self) -> Vec<u8> {
        let header = ConfirmedRequestHeader {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: self.segmented_response_accepted,
            max_segments: self.max_segments_nibble,
            max_apdu: self.max_apdu_nibble,
            invoke_id: self.invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: self.service_choice,
        };
        self.encode_header_and_payload(&header, &self.data)
    }

    /// Sends up to `count` consecutive segments starting at `seq`. The
    /// first segment of the burst carries our original proposed window
    /// size; the rest carry the negotiated `window`. Marks
    /// `sent_all_segments` once the final segment of the APDU goes out.
    fn fill_window(&mut self, start_seq: u8, count: u8) -> Vec<Action> {
        let start_index = start_seq as usize;
        let remaining = self.segment_count.saturating_sub(start_index);
        let emit = remaining.min(count as usize);
        let mut actions = Vec::with_capacity(emit);
        for i in 0..emit {
            let seq = start_seq.wrapping_add(i as u8);
            let index = start_index + i;
            let is_last = index == self.segment_count - 1;
            let window_field = if i == 0 {
                self.proposed_window_size
            } else {
                self.window
            };
            let header = ConfirmedRequestHeader {
                segmented: true,
                more_follows: !is_last,
                segmented_response_accepted: self.segmented_response_accepted,
                max_segments: self.max_segments_nibble,
                max_apdu: self.max_apdu_nibble,
                invoke_id: self.invoke_id,
                sequence_number: Some(seq),
                proposed_window_size: Some(window_field),
                service_choice: self.service_choice,
            };
            let segment = self.segment_bytes(index).to_vec();
            let bytes = self.encode_header_and_payload(&header, &segment);
            actions.push(Action::SendPdu(bytes));
            if is_last {
                self.sent_all_segments = true;
            }
        }
        actions
    }

    fn segment_bytes(&self, index: usize) -> &[u8] {
        if self.data.is_empty() {
            return &self.data[..0];
        }
        let start = index * self.segment_size;
        let end = (start + self.segment_size).min(self.data.len());
        &self.data[start..end]
    }

    fn encode_header_and_payload(
        &self,
        header: &ConfirmedRequestHeader,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + payload.len()];
        let mut w = Writer::new(&mut buf);
        header.encode(&mut w).expect("buffer sized for header");
        w.write_all(payload).expect("buffer sized for payload");
        let n = w.position();
        buf.truncate(n);
        buf
    }
}
