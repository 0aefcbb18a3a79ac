//! One logical message stream multiplexed over a connection. Channel records
//! are owned by the connection core and only ever touched on the service
//! thread; user threads hold `ChannelHandle`s and talk to the record through
//! the command queue.

use crate::error::{Error, Result};
use crate::net::message::{Message, MessageFactory};
use crate::net::request::Slot;
use crate::net::serializer::Serializer;
use hashbrown::HashMap;
use photon::logging;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Context handed to a `Receiver` while it handles an inbound message.
/// Everything it offers executes on the service thread against the owning
/// connection.
pub trait ReceiverContext {
    fn channel_id(&self) -> i32;

    /// Request id of the message being handled, 0 for notifications.
    fn request_id(&self) -> i64;

    /// Queue a message back onto this channel. A `Response` is correlated to
    /// the request being handled automatically.
    fn respond(&mut self, message: Box<dyn Message>);

    /// Mint a back-channel on this connection and return its handoff URI,
    /// `channel:<id>#<protocol>`. The peer completes the open by accepting
    /// the URI.
    fn create_back_channel(
        &mut self,
        protocol: &str,
        receiver: Box<dyn Receiver>,
        serializer: &str,
    ) -> Result<String>;
}

/// Handler for unsolicited inbound messages (requests and notifications) on
/// one channel. Responses never reach the receiver; they complete pending
/// request slots instead.
pub trait Receiver: Send {
    fn on_message(&mut self, message: Box<dyn Message>, ctx: &mut dyn ReceiverContext);
}

pub(crate) struct PendingRequest {
    pub slot: Arc<Slot<Box<dyn Message>>>,
    pub deadline_at: Option<u64>,
}

pub(crate) struct Channel {
    pub id: i32,
    pub state: ChannelState,
    pub protocol: String,
    pub factory: Arc<dyn MessageFactory>,
    pub serializer: Arc<dyn Serializer>,
    pub receiver: Option<Box<dyn Receiver>>,
    /// Identity token presented when the channel was opened.
    pub principal: Option<Vec<u8>>,
    request_counter: i64,
    pending: HashMap<i64, PendingRequest>,
    /// Highest inbound request id seen; ids are issued monotonically per
    /// channel, so anything at or below this is a duplicate.
    inbound_high_water: i64,
    log: logging::Logger,
}

impl Channel {
    pub fn new(
        id: i32,
        state: ChannelState,
        protocol: &str,
        factory: Arc<dyn MessageFactory>,
        serializer: Arc<dyn Serializer>,
        receiver: Option<Box<dyn Receiver>>,
        principal: Option<Vec<u8>>,
        log: &logging::Logger,
    ) -> Channel {
        Channel {
            id,
            state,
            protocol: protocol.to_string(),
            factory,
            serializer,
            receiver,
            principal,
            request_counter: 0,
            pending: HashMap::new(),
            inbound_high_water: 0,
            log: log.new(logging::o!("channel_id" => id)),
        }
    }

    #[inline]
    pub fn next_request_id(&mut self) -> i64 {
        self.request_counter += 1;
        self.request_counter
    }

    /// Registers a pending request before its frame is handed to the
    /// transport, so the response can never race the registration.
    pub fn register_request(&mut self, request_id: i64, slot: Arc<Slot<Box<dyn Message>>>, deadline_at: Option<u64>) {
        let evicted = self.pending.insert(request_id, PendingRequest { slot, deadline_at });
        debug_assert!(evicted.is_none(), "request id reused while pending");
    }

    /// Detaches the pending slot matching an inbound response, if any.
    pub fn take_pending(&mut self, request_id: i64) -> Option<PendingRequest> {
        self.pending.remove(&request_id)
    }

    pub fn forget_pending(&mut self, request_id: i64) {
        self.pending.remove(&request_id);
    }

    /// Validates an inbound request id against the duplicate window.
    pub fn note_inbound_request(&mut self, request_id: i64) -> Result<()> {
        if request_id <= self.inbound_high_water {
            return Err(Error::Protocol(format!(
                "duplicate request id {} on channel {}",
                request_id, self.id
            )));
        }
        self.inbound_high_water = request_id;
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Fails every pending request. Called on channel close and connection
    /// close; the cause travels inside `ChannelClosed`.
    pub fn fail_pending(&mut self, cause: Option<Error>) {
        let count = self.pending.len();
        if count > 0 {
            logging::debug!(self.log, "failing pending requests"; "count" => count);
        }

        for (_, request) in self.pending.drain() {
            request.slot.fail(Error::ChannelClosed(cause.clone().map(Arc::new)));
        }
    }

    /// Fails requests whose deadline has passed with `Timeout`, leaving the
    /// channel itself open. No cancel is sent to the peer; a late response is
    /// dropped as spurious.
    pub fn sweep_deadlines(&mut self, now: u64) {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline_at.map(|at| now >= at).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect();

        for request_id in expired {
            if let Some(request) = self.pending.remove(&request_id) {
                logging::debug!(self.log, "request deadline passed"; "request_id" => request_id);
                request.slot.fail(Error::Timeout);
            }
        }
    }

    /// Earliest pending deadline, used to bound the service thread's wait.
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending
            .values()
            .filter_map(|request| request.deadline_at)
            .min()
    }

    pub fn close(&mut self, cause: Option<Error>) {
        if self.state == ChannelState::Closed {
            return;
        }

        logging::debug!(self.log, "channel closed";
                        "protocol" => &self.protocol,
                        "pending" => self.pending.len());

        self.state = ChannelState::Closed;
        self.fail_pending(cause);
        self.receiver = None;
    }
}
