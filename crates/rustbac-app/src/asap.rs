//! The Application Service Access Point (spec.md §4.6): the one place that
//! owns every in-flight transaction, decides whether an incoming APDU
//! belongs to a `ClientSsm` or a `ServerSsm`, and allocates invoke IDs for
//! outgoing requests.
//!
//! Grounded in `appservice.py`'s `ApplicationServiceAccessPoint.confirmation`
//! for the dispatch rules -- in particular that `SegmentAck` and `Abort`
//! PDUs carry their own `server`/`sent_by_server` bit rather than being
//! routed by PDU type alone, since either table can be the continuation of
//! either direction of transfer.

use crate::config::SapConfig;
use crate::device_info::DeviceInfoCache;
use crate::error::AsapError;
use crate::ssm::client::ClientSsm;
use crate::ssm::server::ServerSsm;
use crate::ssm::{
    decode_incoming_apdu, Action, ApplicationResponse, DeliveredApdu, Event, IncomingApdu,
    OutgoingApdu,
};
use rustbac_core::address::Address;
use std::collections::HashMap;

type TxKey = (u8, Address);

/// The upward collaborator a binary wires in to actually act on delivered
/// APDUs: `indication` for a request arriving at a server, `confirmation`
/// for a reply arriving at a client. Mirrors `rustbac_datalink::DataLink`'s
/// async-trait-at-the-boundary idiom.
pub trait Application: Send + Sync {
    async fn indication(&self, peer: Address, invoke_id: u8, apdu: DeliveredApdu);

    async fn confirmation(&self, peer: Address, invoke_id: u8, apdu: DeliveredApdu);
}

/// Transaction bookkeeping for one node. Holds the live `ClientSsm`s and
/// `ServerSsm`s keyed by `(invoke id, peer)`, plus the shared device-info
/// cache and config both kinds of transaction are built from.
pub struct ApplicationServiceAccessPoint {
    client_transactions: HashMap<TxKey, ClientSsm>,
    server_transactions: HashMap<TxKey, ServerSsm>,
    device_info: DeviceInfoCache,
    config: SapConfig,
    next_invoke_id: u8,
}

impl ApplicationServiceAccessPoint {
    pub fn new(config: SapConfig) -> Self {
        Self {
            client_transactions: HashMap::new(),
            server_transactions: HashMap::new(),
            device_info: DeviceInfoCache::new(),
            config,
            next_invoke_id: 0,
        }
    }

    pub fn device_info(&self) -> &DeviceInfoCache {
        &self.device_info
    }

    pub fn device_info_mut(&mut self) -> &mut DeviceInfoCache {
        &mut self.device_info
    }

    /// `indication(APDU)` on the originating side: allocates an invoke ID
    /// not already active against `peer`, creates the `ClientSsm`, and
    /// returns the invoke ID plus whatever the new transaction already
    /// wants done.
    pub fn request(
        &mut self,
        peer: Address,
        request: OutgoingApdu,
    ) -> Result<(u8, Vec<Action>), AsapError> {
        let invoke_id = self.allocate_invoke_id(&peer)?;
        let peer_info = self.device_info.get(&peer);
        let (ssm, actions) = ClientSsm::new(invoke_id, request, peer_info, self.config);
        if !ssm.state().is_terminal() {
            self.client_transactions.insert((invoke_id, peer), ssm);
        }
        Ok((invoke_id, actions))
    }

    fn allocate_invoke_id(&mut self, peer: &Address) -> Result<u8, AsapError> {
        for _ in 0..=255u16 {
            let id = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            if !self.client_transactions.contains_key(&(id, peer.clone())) {
                return Ok(id);
            }
        }
        Err(AsapError::InvokeIdsExhausted)
    }

    /// `confirmation(PDU)`: decodes `bytes` and routes it to the matching
    /// transaction. A `ConfirmedRequest` either continues an in-progress
    /// `ServerSsm` or starts one; everything else is routed by its own
    /// `server`/`sent_by_server` bit, since a `SegmentAck`/`Abort` can
    /// belong to either table.
    pub fn indication(&mut self, peer: Address, bytes: &[u8]) -> Vec<Action> {
        let Ok(apdu) = decode_incoming_apdu(bytes) else {
            return vec![];
        };

        let IncomingApdu::ConfirmedRequest(header, data) = apdu else {
            let (invoke_id, to_client) = match &apdu {
                IncomingApdu::SimpleAck(a) => (a.invoke_id, true),
                IncomingApdu::ComplexAck(h, _) => (h.invoke_id, true),
                IncomingApdu::Error(e) => (e.invoke_id, true),
                IncomingApdu::Reject(r) => (r.invoke_id, true),
                IncomingApdu::SegmentAck(a) => (a.invoke_id, a.sent_by_server),
                IncomingApdu::Abort(a) => (a.invoke_id, a.server),
                IncomingApdu::ConfirmedRequest(..) => unreachable!(),
            };
            return if to_client {
                self.dispatch_client(peer, invoke_id, apdu)
            } else {
                self.dispatch_server(peer, invoke_id, apdu)
            };
        };

        let key = (header.invoke_id, peer.clone());
        if self.server_transactions.contains_key(&key) {
            return self.dispatch_server(
                peer,
                header.invoke_id,
                IncomingApdu::ConfirmedRequest(header, data),
            );
        }

        if header.segmented_response_accepted {
            self.device_info.note_segmented_response_accepted(&peer);
        }
        let peer_info = self.device_info.get(&peer);
        let (ssm, actions) =
            ServerSsm::new(header.invoke_id, header, data, peer_info, self.config);
        if !ssm.state().is_terminal() {
            self.server_transactions.insert(key, ssm);
        }
        actions
    }

    /// The application's answer to an already-indicated request.
    pub fn response(
        &mut self,
        peer: Address,
        invoke_id: u8,
        response: ApplicationResponse,
    ) -> Vec<Action> {
        let key = (invoke_id, peer);
        let Some(ssm) = self.server_transactions.get_mut(&key) else {
            return vec![];
        };
        let actions = ssm.poll(Event::PduFromApplication(response));
        if ssm.state().is_terminal() {
            self.server_transactions.remove(&key);
        }
        actions
    }

    pub fn client_timer_expired(&mut self, peer: Address, invoke_id: u8) -> Vec<Action> {
        self.dispatch_client(peer, invoke_id, Event::TimerExpired)
    }

    pub fn server_timer_expired(&mut self, peer: Address, invoke_id: u8) -> Vec<Action> {
        self.dispatch_server(peer, invoke_id, Event::TimerExpired)
    }

    pub fn cancel_client(&mut self, peer: Address, invoke_id: u8) -> Vec<Action> {
        self.dispatch_client(peer, invoke_id, Event::Cancel)
    }

    fn dispatch_client(
        &mut self,
        peer: Address,
        invoke_id: u8,
        event: impl Into<ClientEvent>,
    ) -> Vec<Action> {
        let key = (invoke_id, peer);
        let Some(ssm) = self.client_transactions.get_mut(&key) else {
            return vec![];
        };
        let actions = ssm.poll(event.into().0);
        if ssm.state().is_terminal() {
            self.client_transactions.remove(&key);
        }
        actions
    }

    fn dispatch_server(
        &mut self,
        peer: Address,
        invoke_id: u8,
        event: impl Into<ServerEvent>,
    ) -> Vec<Action> {
        let key = (invoke_id, peer);
        let Some(ssm) = self.server_transactions.get_mut(&key) else {
            return vec![];
        };
        let actions = ssm.poll(event.into().0);
        if ssm.state().is_terminal() {
            self.server_transactions.remove(&key);
        }
        actions
    }
}

/// Thin newtype so `dispatch_client`/`dispatch_server` can accept either a
/// raw `Event` or a decoded `IncomingApdu` without the caller wrapping it.
struct ClientEvent(Event);
struct ServerEvent(Event);

impl From<Event> for ClientEvent {
    fn from(e: Event) -> Self {
        Self(e)
    }
}
impl From<IncomingApdu> for ClientEvent {
    fn from(apdu: IncomingApdu) -> Self {
        Self(Event::PduReceived(apdu))
    }
}
impl From<Event> for ServerEvent {
    fn from(e: Event) -> Self {
        Self(e)
    }
}
impl From<IncomingApdu> for ServerEvent {
    fn from(apdu: IncomingApdu) -> Self {
        Self(Event::PduReceived(apdu))
    }
}
