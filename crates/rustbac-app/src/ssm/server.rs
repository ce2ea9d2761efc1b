//! The server-side segmentation state machine (spec.md §4.5.2): owns one
//! inbound confirmed request from one peer, from the first segment (or the
//! whole unsegmented PDU) through to COMPLETED or ABORTED.
//!
//! Naming mirrors `appservice.py`'s `ServerSSM`: actions that travel to the
//! application are `DeliverUpward`, actions that travel back out to the peer
//! on the wire are `SendPdu`. The two are not symmetric -- a request is
//! delivered upward at most once, a response may cross the wire in several
//! segments.

use super::{
    in_window, Action, ApplicationResponse, DeliveredApdu, Event, IncomingApdu, TransactionState,
};
use crate::config::{decode_max_segments_accepted, max_apdu_octets, SapConfig};
use crate::device_info::DeviceInfo;
use crate::error::AbortReason;
use rustbac_core::apdu::{AbortPdu, ComplexAckHeader, ConfirmedRequestHeader, SegmentAck};
use rustbac_core::encoding::writer::Writer;

/// One server transaction, created the moment a `ConfirmedRequest` PDU --
/// segmented or not -- arrives for an invoke ID not already in flight.
pub struct ServerSsm {
    state: TransactionState,
    invoke_id: u8,
    config: SapConfig,

    // What the request header told us about the requester's own receive
    // capabilities -- needed again when we build the response.
    peer_segmented_response_accepted: bool,
    peer_max_apdu_octets: u32,
    peer_max_segments_accepted: Option<u32>,

    // Request-side reassembly (only touched while `state` is
    // `SegmentedRequest`).
    request_service_choice: u8,
    request_window: u8,
    request_initial_sequence_number: u8,
    request_last_sequence_number: u8,
    reassembled: Vec<u8>,

    // Response-side segmentation (only touched from `SegmentedResponse`
    // onward).
    response_service_choice: u8,
    response_data: Vec<u8>,
    response_segment_size: usize,
    response_segment_count: usize,
    response_proposed_window_size: u8,
    response_window: u8,
    response_initial_sequence_number: u8,
    sent_all_segments: bool,
    segment_retry_count: u8,
}

impl ServerSsm {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// `idle()`: accepts the first (or only) `ConfirmedRequest` PDU for this
    /// transaction and returns the new server transaction plus whatever
    /// actions its creation already implies -- an immediate upward delivery
    /// for an unsegmented request, or the first `SegmentAck` for a segmented
    /// one.
    pub fn new(
        invoke_id: u8,
        header: ConfirmedRequestHeader,
        data: Vec<u8>,
        peer: Option<DeviceInfo>,
        config: SapConfig,
    ) -> (Self, Vec<Action>) {
        let header_max_apdu = max_apdu_octets(header.max_apdu);
        let peer_max_apdu_octets = peer
            .map(|p| p.max_apdu_length_accepted.min(header_max_apdu))
            .unwrap_or(header_max_apdu);
        let header_max_segments = decode_max_segments_accepted(header.max_segments);
        let peer_max_segments_accepted = peer
            .and_then(|p| p.max_segments_accepted.map(|n| n as u32))
            .or(header_max_segments);

        let mut ssm = Self {
            state: TransactionState::Idle,
            invoke_id,
            config,
            peer_segmented_response_accepted: header.segmented_response_accepted,
            peer_max_apdu_octets,
            peer_max_segments_accepted,
            request_service_choice: header.service_choice,
            request_window: config.proposed_window_size,
            request_initial_sequence_number: 0,
            request_last_sequence_number: 0,
            reassembled: Vec::new(),
            response_service_choice: 0,
            response_data: Vec::new(),
            response_segment_size: peer_max_apdu_octets.max(1) as usize,
            response_segment_count: 0,
            response_proposed_window_size: config.proposed_window_size,
            response_window: config.proposed_window_size,
            response_initial_sequence_number: 0,
            sent_all_segments: false,
            segment_retry_count: 0,
        };

        if !header.segmented {
            ssm.state = TransactionState::AwaitResponse;
            let actions = vec![
                Action::DeliverUpward(DeliveredApdu::ConfirmedRequest {
                    service_choice: header.service_choice,
                    data,
                }),
                Action::SetTimer(ssm.config.application_timeout),
            ];
            return (ssm, actions);
        }

        if !config.segmentation_supported.can_receive() {
            return ssm.abort_before_indication(AbortReason::SegmentationNotSupported);
        }

        ssm.request_window = header
            .proposed_window_size
            .unwrap_or(1)
            .min(config.proposed_window_size)
            .max(1);
        ssm.reassembled = data;
        ssm.request_last_sequence_number = 0;
        ssm.request_initial_sequence_number = 0;
        ssm.state = TransactionState::SegmentedRequest;
        let actions = vec![
            Action::SendPdu(ssm.encode_request_segment_ack(false, 0)),
            Action::SetTimer(ssm.config.segment_timeout),
        ];
        (ssm, actions)
    }

    /// Aborts before the application has ever seen this request: nothing to
    /// tell it, so the abort only goes to the peer.
    fn abort_before_indication(mut self, reason: AbortReason) -> (Self, Vec<Action>) {
        self.state = TransactionState::Aborted;
        let abort = AbortPdu {
            server: true,
            invoke_id: self.invoke_id,
            reason: reason.to_u8(),
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        let mut actions = Vec::new();
        if abort.encode(&mut w).is_ok() {
            actions.push(Action::SendPdu(w.as_written().to_vec()));
        }
        actions.push(Action::Done);
        (self, actions)
    }

    pub fn poll(&mut self, event: Event) -> Vec<Action> {
        if matches!(event, Event::Cancel) && !self.state.is_terminal() {
            return self.abort_in_place(AbortReason::TsmTimeout, true, false);
        }
        match self.state {
            TransactionState::SegmentedRequest => self.poll_segmented_request(event),
            TransactionState::AwaitResponse => self.poll_await_response(event),
            TransactionState::SegmentedResponse => self.poll_segmented_response(event),
            _ => vec![],
        }
    }

    fn poll_segmented_request(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduReceived(IncomingApdu::ConfirmedRequest(header, data)) => {
                if !header.segmented {
                    return self.abort_in_place(AbortReason::InvalidApduInThisState, true, true);
                }
                let seq = header.sequence_number.unwrap_or(0);
                let expected = self.request_last_sequence_number.wrapping_add(1);
                if seq != expected {
                    return vec![
                        Action::SendPdu(self.encode_request_segment_ack(
                            true,
                            self.request_initial_sequence_number,
                        )),
                        Action::SetTimer(self.config.segment_timeout),
                    ];
                }
                self.reassembled.extend_from_slice(&data);
                self.request_last_sequence_number = seq;
                if !header.more_follows {
                    self.state = TransactionState::AwaitResponse;
                    let service_choice = self.request_service_choice;
                    let payload = core::mem::take(&mut self.reassembled);
                    return vec![
                        Action::SendPdu(self.encode_request_segment_ack(false, seq)),
                        Action::DeliverUpward(DeliveredApdu::ConfirmedRequest {
                            service_choice,
                            data: payload,
                        }),
                        Action::SetTimer(self.config.application_timeout),
                    ];
                }
                if seq == self
                    .request_initial_sequence_number
                    .wrapping_add(self.request_window.max(1) - 1)
                {
                    self.request_initial_sequence_number = self.request_last_sequence_number;
                    vec![
                        Action::SendPdu(self.encode_request_segment_ack(false, seq)),
                        Action::SetTimer(self.config.segment_timeout),
                    ]
                } else {
                    vec![Action::SetTimer(self.config.segment_timeout)]
                }
            }
            Event::TimerExpired => self.abort_in_place(AbortReason::TsmTimeout, true, false),
            _ => self.abort_in_place(AbortReason::InvalidApduInThisState, true, true),
        }
    }

    fn poll_await_response(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduFromApplication(ApplicationResponse::Abort { reason }) => {
                self.state = TransactionState::Aborted;
                vec![Action::SendPdu(self.encode_abort(reason)), Action::Done]
            }
            Event::PduFromApplication(ApplicationResponse::SimpleAck) => {
                self.state = TransactionState::Completed;
                vec![Action::SendPdu(self.encode_simple_ack()), Action::Done]
            }
            Event::PduFromApplication(ApplicationResponse::Error {
                error_class,
                error_code,
            }) => {
                self.state = TransactionState::Completed;
                vec![
                    Action::SendPdu(self.encode_error(error_class, error_code)),
                    Action::Done,
                ]
            }
            Event::PduFromApplication(ApplicationResponse::Reject { reason }) => {
                self.state = TransactionState::Completed;
                vec![Action::SendPdu(self.encode_reject(reason)), Action::Done]
            }
            Event::PduFromApplication(ApplicationResponse::ComplexAck {
                service_choice,
                data,
            }) => self.begin_response(service_choice, data),
            Event::TimerExpired => {
                // The application never answered in time; report it
                // upward only, there is nothing useful to tell the peer.
                log::debug!(
                    "server transaction invoke_id={} timed out waiting for application response",
                    self.invoke_id
                );
                self.state = TransactionState::Aborted;
                let abort = AbortPdu {
                    server: true,
                    invoke_id: self.invoke_id,
                    reason: AbortReason::ApplicationExceededReplyTime.to_u8(),
                };
                vec![Action::DeliverUpward(DeliveredApdu::Abort(abort)), Action::Done]
            }
            _ => vec![],
        }
    }

    fn begin_response(&mut self, service_choice: u8, data: Vec<u8>) -> Vec<Action> {
        self.response_service_choice = service_choice;
        let segment_size = self.response_segment_size;
        let len = data.len();
        self.response_segment_count = if len == 0 { 1 } else { len.div_ceil(segment_size) };
        self.response_data = data;

        if self.response_segment_count > 1 {
            if !self.config.segmentation_supported.can_transmit() {
                return self.abort_in_place(AbortReason::SegmentationNotSupported, true, false);
            }
            if !self.peer_segmented_response_accepted {
                return self.abort_in_place(AbortReason::SegmentationNotSupported, true, false);
            }
            if let Some(max) = self.peer_max_segments_accepted {
                if self.response_segment_count > max as usize {
                    return self.abort_in_place(AbortReason::ApduTooLong, true, false);
                }
            }
        }

        if self.response_segment_count == 1 {
            self.state = TransactionState::Completed;
            let header = ComplexAckHeader {
                segmented: false,
                more_follows: false,
                invoke_id: self.invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice,
            };
            let payload = core::mem::take(&mut self.response_data);
            let bytes = self.encode_complex_ack(&header, &payload);
            vec![Action::SendPdu(bytes), Action::Done]
        } else {
            self.state = TransactionState::SegmentedResponse;
            let mut actions = self.fill_window(0, self.response_proposed_window_size);
            actions.push(Action::SetTimer(self.config.segment_timeout));
            actions
        }
    }

    fn poll_segmented_response(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::PduReceived(IncomingApdu::SegmentAck(ack)) => {
                self.response_window = ack.actual_window_size.max(1);
                if !in_window(
                    ack.sequence_number,
                    self.response_initial_sequence_number,
                    self.response_window,
                ) {
                    return vec![Action::SetTimer(self.config.segment_timeout)];
                }
                if self.sent_all_segments {
                    self.state = TransactionState::Completed;
                    return vec![Action::Done];
                }
                self.response_initial_sequence_number = ack.sequence_number.wrapping_add(1);
                self.segment_retry_count = 0;
                let mut actions =
                    self.fill_window(self.response_initial_sequence_number, self.response_window);
                actions.push(Action::SetTimer(self.config.segment_timeout));
                actions
            }
            Event::PduReceived(IncomingApdu::Abort(a)) => {
                self.state = TransactionState::Aborted;
                vec![Action::DeliverUpward(DeliveredApdu::Abort(a)), Action::Done]
            }
            Event::TimerExpired => {
                if self.segment_retry_count < self.config.number_of_apdu_retries {
                    self.segment_retry_count += 1;
                    log::debug!(
                        "server transaction invoke_id={} segment retry {}/{}",
                        self.invoke_id,
                        self.segment_retry_count,
                        self.config.number_of_apdu_retries
                    );
                    let mut actions = self.fill_window(
                        self.response_initial_sequence_number,
                        self.response_window,
                    );
                    actions.push(Action::SetTimer(self.config.segment_timeout));
                    actions
                } else {
                    log::debug!(
                        "server transaction invoke_id={} segment retries exhausted",
                        self.invoke_id
                    );
                    self.state = TransactionState::Aborted;
                    vec![Action::Done]
                }
            }
            _ => vec![],
        }
    }

    fn abort_in_place(&mut self, reason: AbortReason, send_to_peer: bool, deliver_upward: bool) -> Vec<Action> {
        log::debug!(
            "server transaction invoke_id={} aborting: {:?}",
            self.invoke_id,
            reason
        );
        self.state = TransactionState::Aborted;
        let mut actions = Vec::new();
        if send_to_peer {
            actions.push(Action::SendPdu(self.encode_abort(reason)));
        }
        if deliver_upward {
            let abort = AbortPdu {
                server: true,
                invoke_id: self.invoke_id,
                reason: reason.to_u8(),
            };
            actions.push(Action::DeliverUpward(DeliveredApdu::Abort(abort)));
        }
        actions.push(Action::Done);
        actions
    }

    fn fill_window(&mut self, start_seq: u8, count: u8) -> Vec<Action> {
        let start_index = start_seq as usize;
        let remaining = self.response_segment_count.saturating_sub(start_index);
        let emit = remaining.min(count as usize);
        let mut actions = Vec::with_capacity(emit);
        for i in 0..emit {
            let seq = start_seq.wrapping_add(i as u8);
            let index = start_index + i;
            let is_last = index == self.response_segment_count - 1;
            let window_field = if i == 0 {
                self.response_proposed_window_size
            } else {
                self.response_window
            };
            let header = ComplexAckHeader {
                segmented: true,
                more_follows: !is_last,
                invoke_id: self.invoke_id,
                sequence_number: Some(seq),
                proposed_window_size: Some(window_field),
                service_choice: self.response_service_choice,
            };
            let segment = self.response_segment_bytes(index).to_vec();
            let bytes = self.encode_complex_ack(&header, &segment);
            actions.push(Action::SendPdu(bytes));
            if is_last {
                self.sent_all_segments = true;
            }
        }
        actions
    }

    fn response_segment_bytes(&self, index: usize) -> &[u8] {
        if self.response_data.is_empty() {
            return &self.response_data[..0];
        }
        let start = index * self.response_segment_size;
        let end = (start + self.response_segment_size).min(self.response_data.len());
        &self.response_data[start..end]
    }

    fn encode_complex_ack(&self, header: &ComplexAckHeader, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 6 + payload.len()];
        let mut w = Writer::new(&mut buf);
        header.encode(&mut w).expect("buffer sized for header");
        w.write_all(payload).expect("buffer sized for payload");
        let n = w.position();
        buf.truncate(n);
        buf
    }

    fn encode_request_segment_ack(&self, negative_ack: bool, sequence_number: u8) -> Vec<u8> {
        let ack = SegmentAck {
            negative_ack,
            sent_by_server: true,
            invoke_id: self.invoke_id,
            sequence_number,
            actual_window_size: self.request_window,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).expect("fixed-size segment ack");
        w.as_written().to_vec()
    }

    fn encode_simple_ack(&self) -> Vec<u8> {
        use rustbac_core::apdu::SimpleAck;
        let ack = SimpleAck {
            invoke_id: self.invoke_id,
            service_choice: self.request_service_choice,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).expect("fixed-size simple ack");
        w.as_written().to_vec()
    }

    fn encode_error(&self, error_class: u32, error_code: u32) -> Vec<u8> {
        use rustbac_core::apdu::BacnetError;
        let err = BacnetError {
            invoke_id: self.invoke_id,
            service_choice: self.request_service_choice,
            error_class: Some(error_class),
            error_code: Some(error_code),
        };
        let mut buf = vec![0u8; 16];
        let mut w = Writer::new(&mut buf);
        err.encode(&mut w).expect("buffer sized for error");
        let n = w.position();
        buf.truncate(n);
        buf
    }

    fn encode_reject(&self, reason: u8) -> Vec<u8> {
        use rustbac_core::apdu::RejectPdu;
        let reject = RejectPdu {
            invoke_id: self.invoke_id,
            reason,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        reject.encode(&mut w).expect("fixed-size reject");
        w.as_written().to_vec()
    }

    fn encode_abort(&self, reason: AbortReason) -> Vec<u8> {
        let abort = AbortPdu {
            server: true,
            invoke_id: self.invoke_id,
            reason: reason.to_u8(),
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        abort.encode(&mut w).expect("fixed-size abort");
        w.as_written().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_header(segmented: bool, seq: Option<u8>, more: bool) -> ConfirmedRequestHeader {
        ConfirmedRequestHeader {
            segmented,
            more_follows: more,
            segmented_response_accepted: true,
            max_segments: 1,
            max_apdu: 4,
            invoke_id: 9,
            sequence_number: seq,
            proposed_window_size: if segmented { Some(2) } else { None },
            service_choice: 12,
        }
    }

    #[test]
    fn unsegmented_request_delivers_upward_immediately() {
        let (ssm, actions) = ServerSsm::new(
            9,
            request_header(false, None, false),
            vec![1, 2, 3],
            None,
            SapConfig::default(),
        );
        assert_eq!(ssm.state(), TransactionState::AwaitResponse);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::DeliverUpward(DeliveredApdu::ConfirmedRequest { .. })
        ));
    }

    #[test]
    fn unsegmented_request_simple_ack_completes() {
        let (mut ssm, _actions) = ServerSsm::new(
            9,
            request_header(false, None, false),
            vec![1, 2, 3],
            None,
            SapConfig::default(),
        );
        let actions = ssm.poll(Event::PduFromApplication(ApplicationResponse::SimpleAck));
        assert_eq!(ssm.state(), TransactionState::Completed);
        assert!(matches!(actions[0], Action::SendPdu(_)));
        assert!(matches!(actions[1], Action::Done));
    }

    /// S5: segments arriving out of order are negatively acked without
    /// advancing reassembly.
    #[test]
    fn out_of_order_segment_is_negatively_acked() {
        let (mut ssm, actions) = ServerSsm::new(
            9,
            request_header(true, Some(0), true),
            vec![1, 2, 3],
            None,
            SapConfig::default(),
        );
        assert_eq!(ssm.state(), TransactionState::SegmentedRequest);
        assert_eq!(actions.len(), 2);

        // Segment 2 arrives before segment 1: out of order.
        let out_of_order = ssm.poll(Event::PduReceived(IncomingApdu::ConfirmedRequest(
            request_header(true, Some(2), true),
            vec![7, 8, 9],
        )));
        assert_eq!(ssm.state(), TransactionState::SegmentedRequest);
        let Action::SendPdu(bytes) = &out_of_order[0] else {
            panic!("expected a resent SegmentAck");
        };
        let mut r = rustbac_core::encoding::reader::Reader::new(bytes);
        let ack = SegmentAck::decode(&mut r).unwrap();
        assert!(ack.negative_ack);
        assert_eq!(ack.sequence_number, 0);
    }

    #[test]
    fn segmented_request_reassembles_and_delivers_on_last_segment() {
        let (mut ssm, _actions) = ServerSsm::new(
            9,
            request_header(true, Some(0), true),
            vec![1, 2, 3],
            None,
            SapConfig::default(),
        );
        let actions = ssm.poll(Event::PduReceived(IncomingApdu::ConfirmedRequest(
            request_header(true, Some(1), false),
            vec![4, 5, 6],
        )));
        assert_eq!(ssm.state(), TransactionState::AwaitResponse);
        let Action::DeliverUpward(DeliveredApdu::ConfirmedRequest { data, .. }) = &actions[1]
        else {
            panic!("expected reassembled request");
        };
        assert_eq!(data, &vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn segmented_complex_ack_response_enters_segmented_response() {
        let (mut ssm, _actions) = ServerSsm::new(
            9,
            request_header(false, None, false),
            vec![],
            None,
            SapConfig::default(),
        );
        let actions = ssm.poll(Event::PduFromApplication(ApplicationResponse::ComplexAck {
            service_choice: 12,
            data: vec![0xAAu8; 3000],
        }));
        assert_eq!(ssm.state(), TransactionState::SegmentedResponse);
        assert!(actions.iter().any(|a| matches!(a, Action::SendPdu(_))));
    }

    #[test]
    fn application_timeout_without_response_aborts_upward_only() {
        let (mut ssm, _actions) = ServerSsm::new(
            9,
            request_header(false, None, false),
            vec![1],
            None,
            SapConfig::default(),
        );
        let actions = ssm.poll(Event::TimerExpired);
        assert_eq!(ssm.state(), TransactionState::Aborted);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::DeliverUpward(DeliveredApdu::Abort(_))
        ));
    }
}
