//! The connection multiplexer. One `ConnectionCore` owns the transport, the
//! framing buffers and every channel record, and is driven exclusively by its
//! service thread: user threads hold cheap `ConnectionHandle` /
//! `ChannelHandle` clones and interact by posting commands and waiting on
//! one-shot slots. The gate brackets every client operation so a graceful
//! close never tears the connection out from under an operation in flight.

use crate::config::{ConnectionConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::net::buffer::Buffer;
use crate::net::channel::{Channel, ChannelState, Receiver, ReceiverContext};
use crate::net::codec::{Codec, Decoded, FactoryResolver, WireCodec};
use crate::net::control::{
    self, AcceptChannelRequest, AcceptChannelResponse, Control, ControlBody, ControlMessage,
    NotifyChannelClosed, NotifyConnectionClosed, OpenChannelRequest, OpenChannelResponse,
    OpenConnectionRequest, OpenConnectionResponse, PingRequest, PingResponse, RESULT_AUTH_FAILED,
    RESULT_OK, RESULT_REJECTED,
};
use crate::net::frame;
use crate::net::gate::Gate;
use crate::net::message::{Classification, Message, MessageFactory};
use crate::net::protocol::ProtocolSnapshot;
use crate::net::request::{Slot, Status};
use crate::net::serializer::{self, Serializer};
use crate::net::transport::Transport;
use crate::service::runtime::{ServiceRuntime, ServiceState};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use photon::logging;
use photon::time::{system_time_source, timestamp_millis, TimeSource};
use photon::Uuid;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// The reserved control channel.
pub const CHANNEL_ZERO: i32 = 0;

/// How long a graceful close waits for in-flight client operations to leave
/// the gate before falling back to the close-on-exit latch.
const GATE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Stall cap applied to the final flush when the close-notify budget is
/// unbounded, so a wedged transport cannot pin the service thread forever.
const CLOSE_FLUSH_STALL_MILLIS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Produces a fresh receiver for every channel opened against a registered
/// receiver name.
pub type ReceiverFactory = Box<dyn Fn() -> Box<dyn Receiver> + Send>;

/// Work items posted to the service thread.
pub enum Command {
    Send {
        channel_id: i32,
        message: Box<dyn Message>,
        slot: Option<Arc<Slot<Box<dyn Message>>>>,
    },
    OpenChannel {
        protocol: String,
        receiver_name: String,
        receiver: Option<Box<dyn Receiver>>,
        serializer: String,
        identity_token: Option<Vec<u8>>,
        reply: Arc<Slot<i32>>,
    },
    CreateChannel {
        protocol: String,
        receiver: Box<dyn Receiver>,
        serializer: String,
        reply: Arc<Slot<String>>,
    },
    AcceptChannel {
        uri: String,
        receiver: Option<Box<dyn Receiver>>,
        serializer: String,
        identity_token: Option<Vec<u8>>,
        reply: Arc<Slot<i32>>,
    },
    CloseChannel {
        channel_id: i32,
        notify: bool,
        cause: Option<Error>,
        reply: Option<Arc<Slot<()>>>,
    },
    CloseConnection {
        notify: bool,
        cause: Option<Error>,
        reply: Option<Arc<Slot<()>>>,
    },
    Ping {
        reply: Arc<Slot<()>>,
        timeout_millis: u64,
    },
}

/// Fails or completes the slots buried in a command that will never run.
pub(crate) fn fail_command(command: Command, cause: Error) {
    match command {
        Command::Send { slot, .. } => {
            if let Some(slot) = slot {
                slot.fail(cause);
            }
        }
        Command::OpenChannel { reply, .. } => {
            reply.fail(cause);
        }
        Command::CreateChannel { reply, .. } => {
            reply.fail(cause);
        }
        Command::AcceptChannel { reply, .. } => {
            reply.fail(cause);
        }
        Command::CloseChannel { reply, .. } => {
            if let Some(reply) = reply {
                reply.complete(());
            }
        }
        Command::CloseConnection { reply, .. } => {
            if let Some(reply) = reply {
                reply.complete(());
            }
        }
        Command::Ping { reply, .. } => {
            reply.fail(cause);
        }
    }
}

/// Byte and message counters, updated by the frame I/O paths.
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    responses_dropped: AtomicU64,
    reset_at: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub responses_dropped: u64,
    /// Wall-clock millis of the last reset.
    pub reset_at: u64,
}

impl ConnectionStats {
    fn new() -> ConnectionStats {
        ConnectionStats {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            reset_at: AtomicU64::new(timestamp_millis()),
        }
    }

    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.responses_dropped.store(0, Ordering::Relaxed);
        self.reset_at.store(timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            reset_at: self.reset_at.load(Ordering::Relaxed),
        }
    }
}

/// Connection state visible to user threads.
pub(crate) struct ConnectionShared {
    state: Mutex<ConnectionState>,
    state_cond: Condvar,
    gate: Gate,
    stats: ConnectionStats,
    open_channels: Mutex<HashSet<i32>>,
    local_id: Mutex<Option<Uuid>>,
    peer_id: Mutex<Option<Uuid>>,
}

impl ConnectionShared {
    fn new() -> ConnectionShared {
        ConnectionShared {
            state: Mutex::new(ConnectionState::Created),
            state_cond: Condvar::new(),
            gate: Gate::new(),
            stats: ConnectionStats::new(),
            open_channels: Mutex::new(HashSet::new()),
            local_id: Mutex::new(None),
            peer_id: Mutex::new(None),
        }
    }

    fn wait_closed(&self) {
        let mut state = self.state.lock().unwrap();
        while *state != ConnectionState::Closed {
            state = self.state_cond.wait(state).unwrap();
        }
    }
}

struct PendingChannel {
    channel: Channel,
    reply: Option<Arc<Slot<i32>>>,
}

enum ControlWait {
    OpenConnection,
    OpenChannel { channel_id: i32 },
    AcceptChannel { channel_id: i32 },
    /// Liveness ping issued by the timer.
    Ping,
    /// Ping issued through the public API.
    UserPing { reply: Arc<Slot<()>> },
}

struct CoreResolver<'a> {
    channels: &'a IndexMap<i32, Channel>,
    control_factory: &'a Arc<dyn MessageFactory>,
    control_serializer: &'a Arc<dyn Serializer>,
}

impl<'a> FactoryResolver for CoreResolver<'a> {
    fn resolve(&self, channel_id: i32) -> Option<(&dyn MessageFactory, &dyn Serializer)> {
        if channel_id == CHANNEL_ZERO {
            return Some((self.control_factory.as_ref(), self.control_serializer.as_ref()));
        }
        self.channels
            .get(&channel_id)
            .map(|channel| (channel.factory.as_ref(), channel.serializer.as_ref()))
    }
}

pub(crate) struct ConnectionCore {
    role: Role,
    config: ConnectionConfig,
    member_id: Uuid,
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    channels: IndexMap<i32, Channel>,
    pending_open: HashMap<i32, PendingChannel>,
    snapshot: ProtocolSnapshot,
    named_receivers: HashMap<String, ReceiverFactory>,
    control_factory: Arc<dyn MessageFactory>,
    control_serializer: Arc<dyn Serializer>,
    control_counter: i64,
    control_pending: HashMap<i64, (ControlWait, Option<u64>)>,
    ping_last: u64,
    ping_outstanding: Option<u64>,
    handshake_deadline: Option<u64>,
    state: ConnectionState,
    time: Arc<dyn TimeSource>,
    shared: Arc<ConnectionShared>,
    runtime: Arc<ServiceRuntime>,
    log: logging::Logger,
}

struct CoreReceiverContext<'a> {
    core: &'a mut ConnectionCore,
    channel_id: i32,
    request_id: i64,
    responses: Vec<Box<dyn Message>>,
}

impl<'a> ReceiverContext for CoreReceiverContext<'a> {
    fn channel_id(&self) -> i32 {
        self.channel_id
    }

    fn request_id(&self) -> i64 {
        self.request_id
    }

    fn respond(&mut self, mut message: Box<dyn Message>) {
        if message.classification() == Classification::Response && message.request_id() == 0 {
            message.set_request_id(self.request_id);
        }
        self.responses.push(message);
    }

    fn create_back_channel(
        &mut self,
        protocol: &str,
        receiver: Box<dyn Receiver>,
        serializer: &str,
    ) -> Result<String> {
        self.core.create_channel_record(protocol, receiver, serializer)
    }
}

impl ConnectionCore {
    fn new(
        role: Role,
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        snapshot: ProtocolSnapshot,
        named_receivers: HashMap<String, ReceiverFactory>,
        runtime: Arc<ServiceRuntime>,
        shared: Arc<ConnectionShared>,
    ) -> Result<ConnectionCore> {
        let control_factory = snapshot
            .get(control::PROTOCOL_NAME)
            .cloned()
            .ok_or_else(|| Error::Config("control protocol missing from registry".to_string()))?;
        let control_serializer = serializer::lookup(&runtime.config().serializer_name)?;
        let log = runtime.log().new(logging::o!(
            "role" => format!("{:?}", role),
            "endpoint" => transport.describe()
        ));

        Ok(ConnectionCore {
            role,
            config,
            member_id: photon::new_member_id(),
            transport,
            codec: Box::new(WireCodec),
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            channels: IndexMap::new(),
            pending_open: HashMap::new(),
            snapshot,
            named_receivers,
            control_factory,
            control_serializer,
            control_counter: 0,
            control_pending: HashMap::new(),
            ping_last: 0,
            ping_outstanding: None,
            handshake_deadline: None,
            state: ConnectionState::Created,
            time: system_time_source(),
            shared,
            runtime,
            log,
        })
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        *self.shared.state.lock().unwrap() = state;
        self.shared.state_cond.notify_all();
    }

    fn now(&self) -> u64 {
        self.time.monotonic_millis()
    }

    // ---- outbound plumbing -------------------------------------------------

    /// Encodes one message into the write buffer as a complete frame.
    fn transmit(&mut self, channel_id: i32, message: &dyn Message) -> Result<()> {
        let serializer = if channel_id == CHANNEL_ZERO {
            self.control_serializer.clone()
        } else {
            self.channels
                .get(&channel_id)
                .map(|channel| channel.serializer.clone())
                .ok_or_else(|| Error::channel_closed(None))?
        };

        let mut payload = Vec::new();
        self.codec.encode(channel_id, message, serializer.as_ref(), &mut payload)?;
        frame::write_frame(&mut self.write_buffer, &payload)?;
        self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        logging::trace!(self.log, "message queued";
                        "channel_id" => channel_id,
                        "type" => message.type_name(),
                        "request_id" => message.request_id());
        Ok(())
    }

    fn next_control_id(&mut self) -> i64 {
        self.control_counter += 1;
        self.control_counter
    }

    fn send_control_request<T: ControlBody>(
        &mut self,
        body: T,
        wait: ControlWait,
        deadline_at: Option<u64>,
    ) -> Result<()> {
        let request_id = self.next_control_id();
        self.control_pending.insert(request_id, (wait, deadline_at));

        let message = Control { request_id, body };
        match self.transmit(CHANNEL_ZERO, &message) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.control_pending.remove(&request_id);
                Err(err)
            }
        }
    }

    fn send_control<T: ControlBody>(&mut self, message: Control<T>) -> Result<()> {
        self.transmit(CHANNEL_ZERO, &message)
    }

    // ---- lifecycle ---------------------------------------------------------

    fn begin(&mut self) {
        self.set_state(ConnectionState::Opening);
        self.handshake_deadline = Some(self.now() + self.config.handshake_timeout_millis);

        if self.role == Role::Initiator {
            let body = OpenConnectionRequest {
                member_id: self.member_id,
                protocols: self.snapshot.announce(),
                identity_token: self.config.identity_token.clone().map(String::into_bytes),
                edition: self.config.edition.clone(),
            };

            logging::debug!(self.log, "sending open request"; "edition" => &self.config.edition);
            if let Err(err) = self.send_control_request(body, ControlWait::OpenConnection, None) {
                self.fail_open(err);
            }
        }
    }

    fn mark_open(&mut self, connection_id: Uuid, peer_id: Uuid) {
        self.handshake_deadline = None;
        *self.shared.local_id.lock().unwrap() = Some(connection_id);
        *self.shared.peer_id.lock().unwrap() = Some(peer_id);
        self.ping_last = self.now();
        self.set_state(ConnectionState::Open);
        self.shared.stats.reset();
        self.runtime.set_accepting(true);

        logging::info!(self.log, "connection open";
                       "connection_id" => connection_id.to_string(),
                       "peer_id" => peer_id.to_string());
    }

    fn fail_open(&mut self, cause: Error) {
        logging::warn!(self.log, "connection open failed"; "cause" => cause.to_string());
        self.runtime.record_failure(cause.clone());
        self.close_connection(false, Some(cause));
    }

    fn close_connection(&mut self, notify: bool, cause: Option<Error>) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }

        logging::info!(self.log, "closing connection";
                       "notify" => notify,
                       "cause" => cause.as_ref().map(|err| err.to_string()).unwrap_or_else(|| "none".to_string()),
                       "open_channels" => self.channels.len(),
                       "pending_channels" => self.pending_open.len());
        self.set_state(ConnectionState::Closing);

        // Every channel goes down with the connection, failing its pending
        // requests before anything touches the transport.
        let ids: Vec<i32> = self.channels.keys().copied().collect();
        for id in ids {
            if let Some(mut channel) = self.channels.shift_remove(&id) {
                channel.close(cause.clone());
            }
        }
        self.shared.open_channels.lock().unwrap().clear();

        for (_, pending) in self.pending_open.drain() {
            if let Some(reply) = pending.reply {
                reply.fail(Error::connection_closed(cause.clone()));
            }
        }

        let control_pending: Vec<(ControlWait, Option<u64>)> =
            self.control_pending.drain().map(|(_, entry)| entry).collect();
        for (wait, _) in control_pending {
            match wait {
                ControlWait::OpenConnection => {
                    self.runtime
                        .record_failure(cause.clone().unwrap_or(Error::NotReady));
                }
                ControlWait::UserPing { reply } => {
                    reply.fail(Error::connection_closed(cause.clone()));
                }
                _ => (),
            }
        }
        self.ping_outstanding = None;

        if notify {
            let body = NotifyConnectionClosed {
                cause: cause.as_ref().map(|err| err.to_string()),
            };
            drop(self.send_control(Control::new(body)));
        }

        self.final_flush();
        self.transport.shutdown();
        *self.shared.peer_id.lock().unwrap() = None;
        self.set_state(ConnectionState::Closed);
        self.runtime.set_accepting(false);

        logging::info!(self.log, "connection closed");
    }

    /// Drains the write buffer within the close-notify budget so the peer
    /// sees the close notification whenever the transport cooperates.
    fn final_flush(&mut self) {
        let budget = if self.config.close_notify_timeout_millis < 0 {
            CLOSE_FLUSH_STALL_MILLIS
        } else {
            self.config.close_notify_timeout_millis as u64
        };
        let deadline = Instant::now() + Duration::from_millis(budget);

        while !self.write_buffer.is_empty() {
            match self.write_buffer.egress(&mut self.transport) {
                Ok(count) => {
                    if count > 0 {
                        self.shared.stats.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
                    } else if Instant::now() >= deadline {
                        logging::warn!(self.log, "close notification not flushed";
                                       "unsent_bytes" => self.write_buffer.len());
                        return;
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(_) => return,
            }
        }
    }

    // ---- the service loop body --------------------------------------------

    fn next_wait(&self) -> Duration {
        let poll = Duration::from_millis(self.runtime.config().poll_interval_millis.max(1));
        let now = self.now();

        let mut next: Option<u64> = self.handshake_deadline;

        if self.state == ConnectionState::Open && self.config.ping_interval_millis > 0 {
            let due = match self.ping_outstanding {
                Some(deadline) => deadline,
                None => self.ping_last + self.config.ping_interval_millis,
            };
            next = Some(next.map_or(due, |at| at.min(due)));
        }

        for (_, (_, deadline)) in self.control_pending.iter() {
            if let Some(at) = deadline {
                next = Some(next.map_or(*at, |current| current.min(*at)));
            }
        }

        for channel in self.channels.values() {
            if let Some(at) = channel.next_deadline() {
                next = Some(next.map_or(at, |current| current.min(at)));
            }
        }

        match next {
            Some(at) if at <= now => Duration::from_millis(0),
            Some(at) => poll.min(Duration::from_millis(at - now)),
            None => poll,
        }
    }

    fn pump(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        match self.read_buffer.ingress(&mut self.transport) {
            Ok(count) => {
                if count > 0 {
                    self.shared.stats.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
                }
            }
            Err(err) => {
                logging::debug!(self.log, "transport read failed"; "kind" => format!("{:?}", err.kind()));
                let cause = Error::from(err);
                if self.state == ConnectionState::Opening {
                    self.fail_open(cause);
                } else {
                    self.close_connection(false, Some(cause));
                }
                return;
            }
        }

        loop {
            if self.state == ConnectionState::Closed {
                return;
            }

            match frame::read_frame(&mut self.read_buffer) {
                Ok(Some(payload)) => {
                    self.shared.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = self.handle_payload(&payload) {
                        logging::warn!(self.log, "failed processing inbound frame"; "cause" => err.to_string());
                        if self.state == ConnectionState::Opening {
                            self.fail_open(err);
                        } else {
                            self.close_connection(true, Some(err));
                        }
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.close_connection(true, Some(err));
                    return;
                }
            }
        }

        self.flush();
        self.run_timers();
    }

    fn flush(&mut self) {
        if self.write_buffer.is_empty() || self.state == ConnectionState::Closed {
            return;
        }

        match self.write_buffer.egress(&mut self.transport) {
            Ok(count) => {
                if count > 0 {
                    self.shared.stats.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
                }
            }
            Err(err) => {
                logging::debug!(self.log, "transport write failed"; "kind" => format!("{:?}", err.kind()));
                self.close_connection(false, Some(err.into()));
            }
        }
    }

    fn run_timers(&mut self) {
        let now = self.now();

        if self.state == ConnectionState::Opening {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    self.fail_open(Error::Timeout);
                    return;
                }
            }
        }

        if self.state == ConnectionState::Open && self.config.ping_interval_millis > 0 {
            match self.ping_outstanding {
                Some(deadline) if now >= deadline => {
                    logging::warn!(self.log, "ping unanswered; failing connection";
                                   "timeout_millis" => self.config.effective_ping_timeout());
                    self.close_connection(true, Some(Error::Timeout));
                    return;
                }
                None if now.saturating_sub(self.ping_last) >= self.config.ping_interval_millis => {
                    let deadline = now + self.config.effective_ping_timeout();
                    self.ping_last = now;
                    if self.send_control_request(PingRequest, ControlWait::Ping, None).is_ok() {
                        self.ping_outstanding = Some(deadline);
                    }
                }
                _ => (),
            }
        }

        let expired: Vec<i64> = self
            .control_pending
            .iter()
            .filter(|(_, (_, deadline))| deadline.map(|at| now >= at).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect();

        for request_id in expired {
            if let Some((wait, _)) = self.control_pending.remove(&request_id) {
                match wait {
                    ControlWait::OpenConnection => {
                        self.fail_open(Error::Timeout);
                        return;
                    }
                    ControlWait::OpenChannel { channel_id } | ControlWait::AcceptChannel { channel_id } => {
                        if let Some(pending) = self.pending_open.remove(&channel_id) {
                            if let Some(reply) = pending.reply {
                                reply.fail(Error::Timeout);
                            }
                        }
                    }
                    ControlWait::Ping => (),
                    ControlWait::UserPing { reply } => {
                        reply.fail(Error::Timeout);
                    }
                }
            }
        }

        for channel in self.channels.values_mut() {
            channel.sweep_deadlines(now);
        }
    }

    // ---- inbound routing ---------------------------------------------------

    fn handle_payload(&mut self, payload: &[u8]) -> Result<()> {
        let decoded = {
            let resolver = CoreResolver {
                channels: &self.channels,
                control_factory: &self.control_factory,
                control_serializer: &self.control_serializer,
            };
            self.codec.decode(payload, &resolver)?
        };

        match decoded {
            Decoded::Unroutable(channel_id) => {
                logging::warn!(self.log, "dropping frame for unroutable channel"; "channel_id" => channel_id);
                self.shared.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Decoded::Message(CHANNEL_ZERO, message) => self.handle_control(message),
            Decoded::Message(channel_id, message) => self.route_channel(channel_id, message),
        }
    }

    fn handle_control(&mut self, message: Box<dyn Message>) -> Result<()> {
        match control::classify(message)? {
            ControlMessage::OpenConnectionRequest(request_id, request) => {
                self.on_open_connection_request(request_id, request)
            }
            ControlMessage::OpenConnectionResponse(request_id, response) => {
                self.on_open_connection_response(request_id, response)
            }
            ControlMessage::OpenChannelRequest(request_id, request) => {
                self.on_open_channel_request(request_id, request)
            }
            ControlMessage::OpenChannelResponse(request_id, response) => {
                self.on_channel_reply(request_id, response.result, response.detail)
            }
            ControlMessage::AcceptChannelRequest(request_id, request) => {
                self.on_accept_channel_request(request_id, request)
            }
            ControlMessage::AcceptChannelResponse(request_id, response) => {
                self.on_channel_reply(request_id, response.result, response.detail)
            }
            ControlMessage::NotifyConnectionClosed(notify) => {
                logging::info!(self.log, "peer closed the connection";
                               "peer_cause" => notify.cause.as_deref().unwrap_or("none"));
                self.close_connection(false, Some(Error::connection_closed(None)));
                Ok(())
            }
            ControlMessage::PingRequest(request_id) => {
                self.send_control(Control::reply(request_id, PingResponse))
            }
            ControlMessage::PingResponse(request_id) => {
                match self.control_pending.remove(&request_id) {
                    Some((ControlWait::Ping, _)) => {
                        self.ping_outstanding = None;
                    }
                    Some((ControlWait::UserPing { reply }, _)) => {
                        reply.complete(());
                    }
                    Some(_) => return Err(Error::protocol("ping response for non-ping request")),
                    None => {
                        logging::debug!(self.log, "spurious ping response"; "request_id" => request_id);
                        self.shared.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }
            ControlMessage::NotifyChannelClosed(notify) => {
                if let Some(mut channel) = self.channels.shift_remove(&notify.channel_id) {
                    channel.close(notify.cause.map(Error::Protocol));
                    self.shared.open_channels.lock().unwrap().remove(&notify.channel_id);
                }
                Ok(())
            }
        }
    }

    fn on_open_connection_request(&mut self, request_id: i64, request: OpenConnectionRequest) -> Result<()> {
        if self.role != Role::Acceptor || self.state != ConnectionState::Opening {
            return Err(Error::protocol("unexpected open connection request"));
        }

        for (name, version) in &request.protocols {
            if !self.snapshot.supports(name, *version) {
                let detail = format!("unsupported protocol {} v{}", name, version);
                logging::warn!(self.log, "rejecting open request"; "detail" => &detail);
                let body = OpenConnectionResponse {
                    result: RESULT_REJECTED,
                    detail: detail.clone(),
                    connection_id: Uuid::nil(),
                    member_id: self.member_id,
                    protocols: Vec::new(),
                };
                drop(self.send_control(Control::reply(request_id, body)));
                self.fail_open(Error::Protocol(detail));
                return Ok(());
            }
        }

        if let Some(expected) = &self.config.identity_token {
            if request.identity_token.as_deref() != Some(expected.as_bytes()) {
                logging::warn!(self.log, "rejecting open request"; "detail" => "identity token mismatch");
                let body = OpenConnectionResponse {
                    result: RESULT_AUTH_FAILED,
                    detail: "identity token rejected".to_string(),
                    connection_id: Uuid::nil(),
                    member_id: self.member_id,
                    protocols: Vec::new(),
                };
                drop(self.send_control(Control::reply(request_id, body)));
                self.fail_open(Error::AuthFailed("identity token rejected".to_string()));
                return Ok(());
            }
        }

        let connection_id = photon::new_member_id();
        let body = OpenConnectionResponse {
            result: RESULT_OK,
            detail: String::new(),
            connection_id,
            member_id: self.member_id,
            protocols: request.protocols.clone(),
        };
        self.send_control(Control::reply(request_id, body))?;
        self.mark_open(connection_id, request.member_id);
        Ok(())
    }

    fn on_open_connection_response(&mut self, request_id: i64, response: OpenConnectionResponse) -> Result<()> {
        match self.control_pending.remove(&request_id) {
            Some((ControlWait::OpenConnection, _)) => (),
            _ => return Err(Error::protocol("unexpected open connection response")),
        }

        match response.result {
            RESULT_OK => {
                self.mark_open(response.connection_id, response.member_id);
                Ok(())
            }
            RESULT_AUTH_FAILED => {
                self.fail_open(Error::AuthFailed(response.detail));
                Ok(())
            }
            _ => {
                self.fail_open(Error::Protocol(response.detail));
                Ok(())
            }
        }
    }

    fn on_open_channel_request(&mut self, request_id: i64, request: OpenChannelRequest) -> Result<()> {
        let reject = |core: &mut ConnectionCore, result: u8, detail: String| {
            logging::warn!(core.log, "rejecting channel open"; "detail" => &detail);
            core.send_control(Control::reply(request_id, OpenChannelResponse { result, detail }))
        };

        if self.state != ConnectionState::Open {
            return reject(self, RESULT_REJECTED, "connection is not open".to_string());
        }

        // The requester mints from its own half of the id space.
        let expected_positive = self.role == Role::Acceptor;
        let id = request.channel_id;
        if id == 0 || (id > 0) != expected_positive {
            return Err(Error::Protocol(format!("channel id {} outside the peer id space", id)));
        }
        if self.channels.contains_key(&id) || self.pending_open.contains_key(&id) {
            return Err(Error::Protocol(format!("channel id {} already in use", id)));
        }

        let factory = match self.snapshot.get(&request.protocol) {
            Some(factory) => factory.clone(),
            None => {
                return reject(
                    self,
                    RESULT_REJECTED,
                    format!("unknown protocol \"{}\"", request.protocol),
                )
            }
        };

        let serializer = match serializer::lookup(&request.serializer) {
            Ok(serializer) => serializer,
            Err(_) => {
                return reject(
                    self,
                    RESULT_REJECTED,
                    format!("unknown serializer \"{}\"", request.serializer),
                )
            }
        };

        let receiver = match self.named_receivers.get(&request.receiver_name) {
            Some(make) => Some(make()),
            None => {
                return reject(
                    self,
                    RESULT_REJECTED,
                    format!("unknown receiver \"{}\"", request.receiver_name),
                )
            }
        };

        let channel = Channel::new(
            id,
            ChannelState::Open,
            &request.protocol,
            factory,
            serializer,
            receiver,
            request.identity_token,
            &self.log,
        );
        self.channels.insert(id, channel);
        self.shared.open_channels.lock().unwrap().insert(id);

        logging::debug!(self.log, "channel opened by peer";
                        "channel_id" => id,
                        "protocol" => &request.protocol,
                        "receiver" => &request.receiver_name);

        self.send_control(Control::reply(
            request_id,
            OpenChannelResponse {
                result: RESULT_OK,
                detail: String::new(),
            },
        ))
    }

    /// Shared completion path for open-channel and accept-channel responses.
    fn on_channel_reply(&mut self, request_id: i64, result: u8, detail: String) -> Result<()> {
        let channel_id = match self.control_pending.remove(&request_id) {
            Some((ControlWait::OpenChannel { channel_id }, _))
            | Some((ControlWait::AcceptChannel { channel_id }, _)) => channel_id,
            Some(_) => return Err(Error::protocol("channel reply for non-channel request")),
            None => {
                logging::debug!(self.log, "spurious channel reply"; "request_id" => request_id);
                self.shared.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let pending = match self.pending_open.remove(&channel_id) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        match result {
            RESULT_OK => {
                let id = pending.channel.id;
                self.promote(pending.channel);
                if let Some(reply) = pending.reply {
                    reply.complete(id);
                }
            }
            RESULT_AUTH_FAILED => {
                if let Some(reply) = pending.reply {
                    reply.fail(Error::AuthFailed(detail));
                }
            }
            _ => {
                if let Some(reply) = pending.reply {
                    reply.fail(Error::Protocol(detail));
                }
            }
        }
        Ok(())
    }

    fn on_accept_channel_request(&mut self, request_id: i64, request: AcceptChannelRequest) -> Result<()> {
        match self.pending_open.remove(&request.channel_id) {
            Some(pending) => {
                self.promote(pending.channel);
                if let Some(reply) = pending.reply {
                    // A created back-channel has no waiting reply, but be
                    // thorough in case an accept raced a local open.
                    reply.complete(request.channel_id);
                }
                self.send_control(Control::reply(
                    request_id,
                    AcceptChannelResponse {
                        result: RESULT_OK,
                        detail: String::new(),
                    },
                ))
            }
            None => self.send_control(Control::reply(
                request_id,
                AcceptChannelResponse {
                    result: RESULT_REJECTED,
                    detail: format!("unknown channel {}", request.channel_id),
                },
            )),
        }
    }

    fn promote(&mut self, mut channel: Channel) {
        channel.state = ChannelState::Open;
        let id = channel.id;
        self.channels.insert(id, channel);
        self.shared.open_channels.lock().unwrap().insert(id);
        logging::debug!(self.log, "channel open"; "channel_id" => id);
    }

    fn route_channel(&mut self, channel_id: i32, message: Box<dyn Message>) -> Result<()> {
        match message.classification() {
            Classification::Response => {
                let request_id = message.request_id();
                let delivered = self
                    .channels
                    .get_mut(&channel_id)
                    .and_then(|channel| channel.take_pending(request_id))
                    .map(|pending| pending.slot.complete(message))
                    .unwrap_or(false);

                if !delivered {
                    logging::debug!(self.log, "dropping spurious response";
                                    "channel_id" => channel_id,
                                    "request_id" => request_id);
                    self.shared.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Classification::Request | Classification::Notify => {
                if message.classification() == Classification::Request {
                    match self.channels.get_mut(&channel_id) {
                        Some(channel) => channel.note_inbound_request(message.request_id())?,
                        None => return Ok(()),
                    }
                }

                let receiver = self
                    .channels
                    .get_mut(&channel_id)
                    .and_then(|channel| channel.receiver.take());

                match receiver {
                    Some(mut receiver) => {
                        let request_id = message.request_id();
                        let responses = {
                            let mut ctx = CoreReceiverContext {
                                core: self,
                                channel_id,
                                request_id,
                                responses: Vec::new(),
                            };
                            receiver.on_message(message, &mut ctx);
                            ctx.responses
                        };

                        if let Some(channel) = self.channels.get_mut(&channel_id) {
                            channel.receiver = Some(receiver);
                        }

                        for response in responses {
                            self.transmit(channel_id, response.as_ref())?;
                        }
                        Ok(())
                    }
                    None => {
                        logging::warn!(self.log, "unsolicited message without a receiver; dropped";
                                       "channel_id" => channel_id,
                                       "type" => message.type_name());
                        Ok(())
                    }
                }
            }
        }
    }

    // ---- command application ----------------------------------------------

    fn apply(&mut self, command: Command) {
        let started = Instant::now();
        match command {
            Command::Send { channel_id, message, slot } => self.apply_send(channel_id, message, slot),
            Command::OpenChannel {
                protocol,
                receiver_name,
                receiver,
                serializer,
                identity_token,
                reply,
            } => self.apply_open_channel(protocol, receiver_name, receiver, serializer, identity_token, reply),
            Command::CreateChannel {
                protocol,
                receiver,
                serializer,
                reply,
            } => match self.create_channel_record(&protocol, receiver, &serializer) {
                Ok(uri) => {
                    reply.complete(uri);
                }
                Err(err) => {
                    reply.fail(err);
                }
            },
            Command::AcceptChannel {
                uri,
                receiver,
                serializer,
                identity_token,
                reply,
            } => self.apply_accept_channel(uri, receiver, serializer, identity_token, reply),
            Command::CloseChannel {
                channel_id,
                notify,
                cause,
                reply,
            } => {
                self.apply_close_channel(channel_id, notify, cause);
                if let Some(reply) = reply {
                    reply.complete(());
                }
            }
            Command::CloseConnection { notify, cause, reply } => {
                self.close_connection(notify, cause);
                if let Some(reply) = reply {
                    reply.complete(());
                }
            }
            Command::Ping { reply, timeout_millis } => {
                let deadline = Some(self.now() + timeout_millis);
                if let Err(err) = self.send_control_request(PingRequest, ControlWait::UserPing { reply: reply.clone() }, deadline)
                {
                    reply.fail(err);
                }
            }
        }

        let threshold = self.runtime.config().task_hung_threshold_millis;
        if threshold > 0 && started.elapsed() >= Duration::from_millis(threshold) {
            logging::warn!(self.log, "service task overran the hung threshold";
                           "elapsed_millis" => started.elapsed().as_millis() as u64,
                           "threshold_millis" => threshold);
        }
    }

    fn apply_send(
        &mut self,
        channel_id: i32,
        mut message: Box<dyn Message>,
        slot: Option<Arc<Slot<Box<dyn Message>>>>,
    ) {
        let open = self.state == ConnectionState::Open
            && self
                .channels
                .get(&channel_id)
                .map(|channel| channel.state == ChannelState::Open)
                .unwrap_or(false);

        if !open {
            if let Some(slot) = slot {
                slot.fail(Error::channel_closed(None));
            } else {
                logging::debug!(self.log, "dropping send for closed channel"; "channel_id" => channel_id);
            }
            return;
        }

        let mut registered = None;
        if message.classification() == Classification::Request {
            let slot = match slot {
                Some(ref slot) => slot.clone(),
                None => {
                    logging::warn!(self.log, "request posted without a status slot"; "channel_id" => channel_id);
                    return;
                }
            };

            let timeout = self.runtime.config().request_timeout_millis;
            let deadline_at = match timeout {
                0 => None,
                timeout => Some(self.now() + timeout),
            };

            let channel = self.channels.get_mut(&channel_id).expect("Channel checked open");
            let request_id = channel.next_request_id();
            message.set_request_id(request_id);
            channel.register_request(request_id, slot, deadline_at);
            registered = Some(request_id);
        }

        if let Err(err) = self.transmit(channel_id, message.as_ref()) {
            if let Some(request_id) = registered {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.forget_pending(request_id);
                }
            }
            if let Some(slot) = slot {
                slot.fail(err.clone());
            }
            // Codec failures are fatal at connection scope.
            self.close_connection(true, Some(err));
        }
    }

    fn apply_open_channel(
        &mut self,
        protocol: String,
        receiver_name: String,
        receiver: Option<Box<dyn Receiver>>,
        serializer_name: String,
        identity_token: Option<Vec<u8>>,
        reply: Arc<Slot<i32>>,
    ) {
        if self.state != ConnectionState::Open {
            reply.fail(Error::connection_closed(None));
            return;
        }

        let factory = match self.snapshot.get(&protocol) {
            Some(factory) => factory.clone(),
            None => {
                reply.fail(Error::Config(format!("unknown protocol \"{}\"", protocol)));
                return;
            }
        };
        let serializer = match serializer::lookup(&serializer_name) {
            Ok(serializer) => serializer,
            Err(err) => {
                reply.fail(err);
                return;
            }
        };

        let id = self.mint_channel_id();
        let channel = Channel::new(
            id,
            ChannelState::Opening,
            &protocol,
            factory,
            serializer,
            receiver,
            identity_token.clone(),
            &self.log,
        );
        self.insert_pending(PendingChannel {
            channel,
            reply: Some(reply.clone()),
        });

        let deadline_at = match self.runtime.config().request_timeout_millis {
            0 => None,
            timeout => Some(self.now() + timeout),
        };

        let body = OpenChannelRequest {
            channel_id: id,
            protocol,
            receiver_name,
            serializer: serializer_name,
            identity_token,
        };
        if let Err(err) = self.send_control_request(body, ControlWait::OpenChannel { channel_id: id }, deadline_at) {
            self.pending_open.remove(&id);
            reply.fail(err.clone());
            self.close_connection(true, Some(err));
        }
    }

    fn apply_accept_channel(
        &mut self,
        uri: String,
        receiver: Option<Box<dyn Receiver>>,
        serializer_name: String,
        identity_token: Option<Vec<u8>>,
        reply: Arc<Slot<i32>>,
    ) {
        if self.state != ConnectionState::Open {
            reply.fail(Error::connection_closed(None));
            return;
        }

        let (id, protocol) = match parse_channel_uri(&uri) {
            Ok(parsed) => parsed,
            Err(err) => {
                reply.fail(err);
                return;
            }
        };

        let factory = match self.snapshot.get(&protocol) {
            Some(factory) => factory.clone(),
            None => {
                reply.fail(Error::Config(format!("unknown protocol \"{}\"", protocol)));
                return;
            }
        };
        let serializer = match serializer::lookup(&serializer_name) {
            Ok(serializer) => serializer,
            Err(err) => {
                reply.fail(err);
                return;
            }
        };

        let channel = Channel::new(
            id,
            ChannelState::Opening,
            &protocol,
            factory,
            serializer,
            receiver,
            identity_token,
            &self.log,
        );
        self.insert_pending(PendingChannel {
            channel,
            reply: Some(reply.clone()),
        });

        let deadline_at = match self.runtime.config().request_timeout_millis {
            0 => None,
            timeout => Some(self.now() + timeout),
        };

        if let Err(err) =
            self.send_control_request(AcceptChannelRequest { channel_id: id }, ControlWait::AcceptChannel { channel_id: id }, deadline_at)
        {
            self.pending_open.remove(&id);
            reply.fail(err.clone());
            self.close_connection(true, Some(err));
        }
    }

    fn apply_close_channel(&mut self, channel_id: i32, notify: bool, cause: Option<Error>) {
        if let Some(mut channel) = self.channels.shift_remove(&channel_id) {
            channel.state = ChannelState::Closing;
            channel.close(cause.clone());
            self.shared.open_channels.lock().unwrap().remove(&channel_id);

            if notify && self.state == ConnectionState::Open {
                let body = NotifyChannelClosed {
                    channel_id,
                    cause: cause.as_ref().map(|err| err.to_string()),
                };
                drop(self.send_control(Control::new(body)));
            }
        } else if let Some(pending) = self.pending_open.remove(&channel_id) {
            if let Some(reply) = pending.reply {
                reply.fail(Error::channel_closed(cause.clone()));
            }
        }
    }

    // ---- channel bookkeeping ----------------------------------------------

    fn mint_channel_id(&mut self) -> i32 {
        let mut rng = rand::thread_rng();
        loop {
            let magnitude: i32 = rng.gen_range(1..=i32::max_value());
            let id = match self.role {
                Role::Initiator => magnitude,
                Role::Acceptor => -magnitude,
            };
            if !self.channels.contains_key(&id) && !self.pending_open.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert_pending(&mut self, pending: PendingChannel) {
        let id = pending.channel.id;
        self.pending_open.insert(id, pending);

        let limit = self.config.max_pending_channels;
        if self.pending_open.len() > limit {
            logging::warn!(self.log, "pending channel map above threshold";
                           "pending" => self.pending_open.len(),
                           "threshold" => limit);
        }
    }

    fn create_channel_record(
        &mut self,
        protocol: &str,
        receiver: Box<dyn Receiver>,
        serializer_name: &str,
    ) -> Result<String> {
        if self.state != ConnectionState::Open {
            return Err(Error::connection_closed(None));
        }

        let factory = self
            .snapshot
            .get(protocol)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown protocol \"{}\"", protocol)))?;
        let serializer = serializer::lookup(serializer_name)?;

        let id = self.mint_channel_id();
        let channel = Channel::new(
            id,
            ChannelState::Opening,
            protocol,
            factory,
            serializer,
            Some(receiver),
            None,
            &self.log,
        );
        self.insert_pending(PendingChannel { channel, reply: None });

        Ok(format!("channel:{}#{}", id, protocol))
    }
}

/// Parses a back-channel handoff URI of the form `channel:<id>#<protocol>`.
pub(crate) fn parse_channel_uri(uri: &str) -> Result<(i32, String)> {
    let rest = uri
        .strip_prefix("channel:")
        .ok_or_else(|| Error::Config(format!("malformed channel uri \"{}\"", uri)))?;

    let hash = rest
        .find('#')
        .ok_or_else(|| Error::Config(format!("channel uri missing protocol fragment \"{}\"", uri)))?;

    let id: i32 = rest[..hash]
        .parse()
        .map_err(|_| Error::Config(format!("malformed channel id in uri \"{}\"", uri)))?;
    let protocol = &rest[hash + 1..];

    if id == 0 || protocol.is_empty() {
        return Err(Error::Config(format!("malformed channel uri \"{}\"", uri)));
    }

    Ok((id, protocol.to_string()))
}

/// The service loop. Owns the core for the lifetime of the connection.
pub(crate) fn run(mut core: ConnectionCore) {
    let runtime = core.runtime.clone();
    runtime.advance_state(ServiceState::Started);
    core.begin();

    while core.state != ConnectionState::Closed {
        let wait = core.next_wait();
        if let Some(command) = runtime.next_command(wait) {
            core.apply(command);
            while let Some(command) = runtime.next_command(Duration::from_millis(0)) {
                core.apply(command);
            }
        }
        core.pump();
    }

    for command in runtime.drain_queue() {
        fail_command(command, Error::connection_closed(None));
    }
    runtime.advance_state(ServiceState::Stopping);
    runtime.advance_state(ServiceState::Stopped);
}

/// Cheap, cloneable user-side handle to a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    runtime: Arc<ServiceRuntime>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The connection id assigned by the acceptor during the open handshake.
    pub fn id(&self) -> Option<Uuid> {
        *self.shared.local_id.lock().unwrap()
    }

    pub fn peer_id(&self) -> Option<Uuid> {
        *self.shared.peer_id.lock().unwrap()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    /// Blocks until the service accepts client operations.
    pub fn wait_accepting_clients(&self, timeout: Option<Duration>) -> Result<()> {
        self.runtime.wait_accepting_clients(timeout)
    }

    fn default_wait(&self) -> Option<Duration> {
        match self.runtime.config().request_timeout_millis {
            0 => None,
            timeout => Some(Duration::from_millis(timeout)),
        }
    }

    fn enter(&self) -> Result<()> {
        if self.shared.gate.enter() {
            Ok(())
        } else {
            Err(Error::connection_closed(None))
        }
    }

    /// Opens a channel to a named receiver on the peer. The returned channel
    /// id is positive on the initiator and negative on the acceptor.
    pub fn open_channel(
        &self,
        protocol: &str,
        receiver_name: &str,
        receiver: Option<Box<dyn Receiver>>,
        identity_token: Option<Vec<u8>>,
    ) -> Result<ChannelHandle> {
        self.runtime.wait_accepting_clients(None)?;
        self.enter()?;

        let reply = Slot::new();
        let posted = self.runtime.post(Command::OpenChannel {
            protocol: protocol.to_string(),
            receiver_name: receiver_name.to_string(),
            receiver,
            serializer: self.runtime.config().serializer_name.clone(),
            identity_token,
            reply: reply.clone(),
        });
        self.shared.gate.exit();
        posted?;

        let id = reply.wait_take(self.default_wait())?;
        Ok(ChannelHandle {
            connection: self.clone(),
            id,
        })
    }

    /// Mints a back-channel served by `receiver` and returns its handoff URI.
    /// The channel opens once the peer accepts the URI.
    pub fn create_channel(&self, protocol: &str, receiver: Box<dyn Receiver>) -> Result<String> {
        self.enter()?;

        let reply = Slot::new();
        let posted = self.runtime.post(Command::CreateChannel {
            protocol: protocol.to_string(),
            receiver,
            serializer: self.runtime.config().serializer_name.clone(),
            reply: reply.clone(),
        });
        self.shared.gate.exit();
        posted?;

        reply.wait_take(self.default_wait())
    }

    /// Accepts a back-channel URI handed over by the peer.
    pub fn accept_channel(
        &self,
        uri: &str,
        receiver: Option<Box<dyn Receiver>>,
        identity_token: Option<Vec<u8>>,
    ) -> Result<ChannelHandle> {
        self.enter()?;

        let reply = Slot::new();
        let posted = self.runtime.post(Command::AcceptChannel {
            uri: uri.to_string(),
            receiver,
            serializer: self.runtime.config().serializer_name.clone(),
            identity_token,
            reply: reply.clone(),
        });
        self.shared.gate.exit();
        posted?;

        let id = reply.wait_take(self.default_wait())?;
        Ok(ChannelHandle {
            connection: self.clone(),
            id,
        })
    }

    /// Round-trips a ping on channel 0.
    pub fn ping(&self, timeout_millis: u64) -> Result<()> {
        self.enter()?;

        let reply = Slot::new();
        let posted = self.runtime.post(Command::Ping {
            reply: reply.clone(),
            timeout_millis,
        });
        self.shared.gate.exit();
        posted?;

        reply.wait_take(Some(Duration::from_millis(timeout_millis)))
    }

    /// Closes the connection.
    ///
    /// The gate is closed first so in-flight operations drain; if they do not
    /// drain within a bounded wait, the last one out performs the close. With
    /// `wait` the caller blocks until the connection reaches `Closed` and the
    /// service has stopped. A receiver running on the service thread must
    /// call this with `wait = false`.
    pub fn close(&self, notify: bool, cause: Option<Error>, wait: bool) {
        if self.state() == ConnectionState::Closed {
            if wait {
                self.runtime.join_and_stop_dispatcher();
            }
            return;
        }

        if self.runtime.is_service_thread() {
            drop(self.runtime.post(Command::CloseConnection {
                notify,
                cause,
                reply: None,
            }));
            return;
        }

        if self.shared.gate.close(GATE_CLOSE_TIMEOUT) {
            drop(self.runtime.post(Command::CloseConnection {
                notify,
                cause,
                reply: None,
            }));
        } else {
            let runtime = self.runtime.clone();
            self.shared.gate.close_on_exit(move || {
                drop(runtime.post(Command::CloseConnection {
                    notify,
                    cause,
                    reply: None,
                }));
            });
        }

        if wait {
            self.shared.wait_closed();
            self.runtime.wait_state(ServiceState::Stopped);
            self.runtime.join_and_stop_dispatcher();
        }
    }

    pub(crate) fn channel_handle(&self, id: i32) -> ChannelHandle {
        ChannelHandle {
            connection: self.clone(),
            id,
        }
    }
}

/// User-side handle to one channel.
#[derive(Clone)]
pub struct ChannelHandle {
    connection: ConnectionHandle,
    id: i32,
}

impl ChannelHandle {
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn is_open(&self) -> bool {
        self.connection.shared.open_channels.lock().unwrap().contains(&self.id)
    }

    fn checked_post(&self, message: Box<dyn Message>, slot: Option<Arc<Slot<Box<dyn Message>>>>) -> Result<()> {
        self.connection.enter()?;

        let result = if self.is_open() {
            self.connection.runtime.post(Command::Send {
                channel_id: self.id,
                message,
                slot,
            })
        } else {
            Err(Error::channel_closed(None))
        };

        self.connection.shared.gate.exit();
        result
    }

    /// Sends a request and returns the in-flight `Status`. The request id is
    /// assigned and registered on the service thread before the frame is
    /// handed to the transport.
    pub fn send(&self, message: Box<dyn Message>) -> Result<Status> {
        if message.classification() != Classification::Request {
            return Err(Error::Unsupported("send requires a request message"));
        }

        let slot = Slot::new();
        self.checked_post(message, Some(slot.clone()))?;
        Ok(Status::new(slot, self.connection.runtime.config().request_timeout_millis))
    }

    /// Sends a notification (or a pre-correlated response) without expecting
    /// a reply.
    pub fn post(&self, message: Box<dyn Message>) -> Result<()> {
        if message.classification() == Classification::Request {
            return Err(Error::Unsupported("post cannot carry a request message"));
        }
        self.checked_post(message, None)
    }

    /// The blocking request form: `send` followed by `Status::wait`.
    pub fn request(&self, message: Box<dyn Message>, timeout_millis: i64) -> Result<Box<dyn Message>> {
        self.send(message)?.wait(timeout_millis)
    }

    /// Closes this channel, failing its pending requests with
    /// `ChannelClosed(cause)`.
    pub fn close(&self, notify: bool, cause: Option<Error>) -> Result<()> {
        let reply = Slot::new();
        self.connection.runtime.post(Command::CloseChannel {
            channel_id: self.id,
            notify,
            cause,
            reply: Some(reply.clone()),
        })?;
        reply.wait_take(None)
    }
}

/// Options for establishing one peer endpoint.
pub struct PeerOptions {
    pub name: String,
    pub connection: ConnectionConfig,
    pub service: ServiceConfig,
}

impl PeerOptions {
    pub fn named(name: &str) -> PeerOptions {
        PeerOptions {
            name: name.to_string(),
            connection: ConnectionConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

fn launch<'a, L: Into<Option<&'a logging::Logger>>>(
    role: Role,
    transport: Box<dyn Transport>,
    options: PeerOptions,
    receivers: Vec<(String, ReceiverFactory)>,
    log: L,
) -> Result<ConnectionHandle> {
    let runtime = ServiceRuntime::new(&options.name, options.service, log);
    let shared = Arc::new(ConnectionShared::new());
    let snapshot = ProtocolSnapshot::acquire();

    let core = ConnectionCore::new(
        role,
        transport,
        options.connection,
        snapshot,
        receivers.into_iter().collect(),
        runtime.clone(),
        shared.clone(),
    )?;

    runtime.advance_state(ServiceState::Starting);
    runtime.dispatcher().start();

    let thread = thread::Builder::new()
        .name(format!("{}:service", options.name))
        .spawn(move || run(core))
        .map_err(Error::from)?;
    runtime.attach_thread(thread);

    let handle = ConnectionHandle { runtime: runtime.clone(), shared };

    match runtime.wait_started() {
        Ok(()) => Ok(handle),
        Err(err) => {
            handle.close(false, None, true);
            Err(err)
        }
    }
}

/// Opens a connection to a peer endpoint and blocks until the handshake
/// completes.
pub struct Initiator;

impl Initiator {
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        transport: Box<dyn Transport>,
        options: PeerOptions,
        receivers: Vec<(String, ReceiverFactory)>,
        log: L,
    ) -> Result<ConnectionHandle> {
        launch(Role::Initiator, transport, options, receivers, log)
    }
}

/// Accepts a single inbound connection on an established transport and blocks
/// until the peer's handshake completes.
pub struct Acceptor;

impl Acceptor {
    pub fn accept<'a, L: Into<Option<&'a logging::Logger>>>(
        transport: Box<dyn Transport>,
        options: PeerOptions,
        receivers: Vec<(String, ReceiverFactory)>,
        log: L,
    ) -> Result<ConnectionHandle> {
        launch(Role::Acceptor, transport, options, receivers, log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::downcast;
    use crate::net::protocol;
    use crate::net::serializer::BincodeSerializer;
    use crate::net::transport::{pipe, PipeTransport};
    use crate::net::wire::{WireReader, WireWriter};
    use crate::value::Value;
    use std::any::Any;

    const ECHO_PROTOCOL: &str = "EchoProtocol";

    // Test protocols must exist before any test seals the registry, and test
    // execution order is arbitrary, so registration happens at binary load.
    #[ctor::ctor]
    fn register_echo_protocol() {
        protocol::register(Arc::new(EchoFactory)).expect("Echo protocol must register before any connection opens");
    }

    struct EchoRequest {
        request_id: i64,
        payload: Value,
    }

    impl EchoRequest {
        fn boxed(payload: Value) -> Box<dyn Message> {
            Box::new(EchoRequest { request_id: 0, payload })
        }
    }

    impl Message for EchoRequest {
        fn type_id(&self) -> i32 {
            1
        }
        fn type_name(&self) -> &'static str {
            "EchoRequest"
        }
        fn classification(&self) -> Classification {
            Classification::Request
        }
        fn request_id(&self) -> i64 {
            self.request_id
        }
        fn set_request_id(&mut self, id: i64) {
            self.request_id = id;
        }
        fn encode_body(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
            writer.write_value(serializer, &self.payload)
        }
        fn decode_body(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
            self.payload = reader.read_value(serializer)?;
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    struct EchoResponse {
        request_id: i64,
        payload: Value,
    }

    impl Message for EchoResponse {
        fn type_id(&self) -> i32 {
            2
        }
        fn type_name(&self) -> &'static str {
            "EchoResponse"
        }
        fn classification(&self) -> Classification {
            Classification::Response
        }
        fn request_id(&self) -> i64 {
            self.request_id
        }
        fn set_request_id(&mut self, id: i64) {
            self.request_id = id;
        }
        fn encode_body(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
            writer.write_value(serializer, &self.payload)
        }
        fn decode_body(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
            self.payload = reader.read_value(serializer)?;
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    struct EchoFactory;

    impl MessageFactory for EchoFactory {
        fn protocol_name(&self) -> &str {
            ECHO_PROTOCOL
        }
        fn version(&self) -> i32 {
            1
        }
        fn create(&self, type_id: i32) -> Option<Box<dyn Message>> {
            match type_id {
                1 => Some(EchoRequest::boxed(Value::Null)),
                2 => Some(Box::new(EchoResponse {
                    request_id: 0,
                    payload: Value::Null,
                })),
                _ => None,
            }
        }
    }

    enum EchoMode {
        /// Echo every request.
        Echo,
        /// Swallow requests carrying `Null`, echo everything else.
        SilentOnNull,
        /// Hold requests and answer them all in reverse once `usize` arrive.
        HoldUntil(usize, Vec<(i64, Value)>),
        /// Mint a back-channel and return its URI as the response payload.
        BackChannel,
    }

    struct EchoReceiver {
        mode: EchoMode,
    }

    impl Receiver for EchoReceiver {
        fn on_message(&mut self, message: Box<dyn Message>, ctx: &mut dyn ReceiverContext) {
            let request = downcast::<EchoRequest>(message).expect("Echo channel only carries echo requests");

            match &mut self.mode {
                EchoMode::Echo => ctx.respond(Box::new(EchoResponse {
                    request_id: 0,
                    payload: request.payload,
                })),
                EchoMode::SilentOnNull => {
                    if request.payload != Value::Null {
                        ctx.respond(Box::new(EchoResponse {
                            request_id: 0,
                            payload: request.payload,
                        }));
                    }
                }
                EchoMode::HoldUntil(threshold, held) => {
                    held.push((request.request_id, request.payload));
                    if held.len() == *threshold {
                        for (request_id, payload) in held.drain(..).rev() {
                            ctx.respond(Box::new(EchoResponse { request_id, payload }));
                        }
                    }
                }
                EchoMode::BackChannel => {
                    let uri = ctx
                        .create_back_channel(ECHO_PROTOCOL, Box::new(EchoReceiver { mode: EchoMode::Echo }), "bincode")
                        .expect("back channel must mint");
                    ctx.respond(Box::new(EchoResponse {
                        request_id: 0,
                        payload: Value::String(uri),
                    }));
                }
            }
        }
    }

    fn echo_receivers(name: &str, mode: fn() -> EchoMode) -> Vec<(String, ReceiverFactory)> {
        vec![(
            name.to_string(),
            Box::new(move || Box::new(EchoReceiver { mode: mode() }) as Box<dyn Receiver>) as ReceiverFactory,
        )]
    }

    fn fast_service() -> ServiceConfig {
        ServiceConfig {
            poll_interval_millis: 2,
            request_timeout_millis: 5_000,
            ..ServiceConfig::default()
        }
    }

    fn loopback(
        name: &str,
        client_connection: ConnectionConfig,
        server_connection: ConnectionConfig,
        receivers: Vec<(String, ReceiverFactory)>,
    ) -> (ConnectionHandle, ConnectionHandle) {
        let (a, b) = pipe();

        let server_options = PeerOptions {
            name: format!("{}-server", name),
            connection: server_connection,
            service: fast_service(),
        };
        let accepting = thread::spawn(move || Acceptor::accept(Box::new(b), server_options, receivers, None));

        let client_options = PeerOptions {
            name: format!("{}-client", name),
            connection: client_connection,
            service: fast_service(),
        };
        let client = Initiator::connect(Box::new(a), client_options, Vec::new(), None)
            .expect("loopback connect must succeed");
        let server = accepting
            .join()
            .expect("acceptor thread must not panic")
            .expect("loopback accept must succeed");

        (client, server)
    }

    fn echo_payload(message: Box<dyn Message>) -> Value {
        downcast::<EchoResponse>(message).expect("response must be an echo").payload
    }

    #[test]
    fn test_parse_channel_uri() {
        assert_eq!(
            parse_channel_uri("channel:81#CacheServiceProtocol").unwrap(),
            (81, "CacheServiceProtocol".to_string())
        );
        assert_eq!(parse_channel_uri("channel:-4#P").unwrap(), (-4, "P".to_string()));

        for bad in &["81#P", "channel:81", "channel:zero#P", "channel:0#P", "channel:81#"] {
            assert!(parse_channel_uri(bad).is_err(), "{} must not parse", bad);
        }
    }

    #[test]
    fn test_open_ping_close() {
        let (client, server) = loopback(
            "open-ping-close",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            Vec::new(),
        );

        assert!(client.is_open());
        assert!(server.is_open());
        // Both sides agree on the acceptor-assigned connection id.
        assert!(client.id().is_some());
        assert_eq!(client.id(), server.id());
        assert!(client.peer_id().is_some());
        assert!(server.peer_id().is_some());

        client.ping(100).expect("ping must round-trip within its deadline");
        client.close(true, None, true);

        let stats = client.stats();
        assert_eq!(stats.messages_sent, 2, "ping request + close notification");
        assert_eq!(stats.messages_received, 1, "ping response");
        assert!(stats.bytes_sent > 0);
        assert_eq!(client.state(), ConnectionState::Closed);

        // The peer saw the notification and tore down on its own.
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.state() != ConnectionState::Closed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.state(), ConnectionState::Closed);
        server.close(false, None, true);
    }

    #[test]
    fn test_channel_open_and_echo() {
        let (client, server) = loopback(
            "echo",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("EchoReceiver", || EchoMode::Echo),
        );

        let channel = client
            .open_channel(ECHO_PROTOCOL, "EchoReceiver", None, None)
            .unwrap();
        assert!(channel.id() > 0, "initiator-minted ids are positive");
        assert!(channel.is_open());

        let response = channel.request(EchoRequest::boxed(Value::Int(42)), 2_000).unwrap();
        assert_eq!(echo_payload(response), Value::Int(42));

        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_unknown_receiver_name_rejected() {
        let (client, server) = loopback(
            "unknown-receiver",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("EchoReceiver", || EchoMode::Echo),
        );

        match client.open_channel(ECHO_PROTOCOL, "NoSuchReceiver", None, None) {
            Err(Error::Protocol(detail)) => assert!(detail.contains("NoSuchReceiver")),
            other => panic!("Unexpected result {:?}", other.is_ok()),
        }

        // The rejection leaves the connection itself healthy.
        assert!(client.is_open());
        client.ping(500).unwrap();

        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_responses_correlate_out_of_order() {
        let (client, server) = loopback(
            "out-of-order",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("HoldingReceiver", || EchoMode::HoldUntil(3, Vec::new())),
        );

        let channel = client
            .open_channel(ECHO_PROTOCOL, "HoldingReceiver", None, None)
            .unwrap();

        let statuses: Vec<Status> = (0..3)
            .map(|i| channel.send(EchoRequest::boxed(Value::Int(i))).unwrap())
            .collect();

        // Responses come back in reverse send order; each await still gets
        // the payload matching its own request id.
        for (i, status) in statuses.into_iter().enumerate() {
            let response = status.wait(2_000).unwrap();
            assert_eq!(echo_payload(response), Value::Int(i as i32));
        }

        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_request_timeout_leaves_channel_open() {
        let (client, server) = loopback(
            "timeout",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("PickyReceiver", || EchoMode::SilentOnNull),
        );

        let channel = client
            .open_channel(ECHO_PROTOCOL, "PickyReceiver", None, None)
            .unwrap();

        let status = channel.send(EchoRequest::boxed(Value::Null)).unwrap();
        let started = Instant::now();
        assert_eq!(status.wait(100).unwrap_err(), Error::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(100));

        // Cancelling the same slot afterwards is a no-op.
        let status = channel.send(EchoRequest::boxed(Value::Null)).unwrap();
        let waiter = {
            let channel = channel.clone();
            thread::spawn(move || channel.request(EchoRequest::boxed(Value::Int(7)), 2_000))
        };
        assert_eq!(echo_payload(waiter.join().unwrap().unwrap()), Value::Int(7));
        status.cancel();
        status.cancel();

        assert!(channel.is_open());
        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_channel_close_fails_pending_and_sends() {
        let (client, server) = loopback(
            "close-pending",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("PickyReceiver", || EchoMode::SilentOnNull),
        );

        let channel = client
            .open_channel(ECHO_PROTOCOL, "PickyReceiver", None, None)
            .unwrap();

        let statuses: Vec<Status> = (0..4)
            .map(|_| channel.send(EchoRequest::boxed(Value::Null)).unwrap())
            .collect();

        channel.close(true, Some(Error::Timeout)).unwrap();

        for status in statuses {
            assert_eq!(
                status.wait(2_000).unwrap_err(),
                Error::channel_closed(Some(Error::Timeout))
            );
        }

        match channel.send(EchoRequest::boxed(Value::Int(1))) {
            Err(Error::ChannelClosed(_)) => (),
            other => panic!("Unexpected result {:?}", other.is_ok()),
        }

        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_connection_close_fails_everything_in_bounded_time() {
        let (client, server) = loopback(
            "conn-close",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("PickyReceiver", || EchoMode::SilentOnNull),
        );

        let channel = client
            .open_channel(ECHO_PROTOCOL, "PickyReceiver", None, None)
            .unwrap();

        let statuses: Vec<Status> = (0..8)
            .map(|_| channel.send(EchoRequest::boxed(Value::Null)).unwrap())
            .collect();

        let churn: Vec<_> = (0..3)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || {
                    let mut denied = 0;
                    for _ in 0..200 {
                        if channel.send(EchoRequest::boxed(Value::Null)).is_err() {
                            denied += 1;
                        }
                    }
                    denied
                })
            })
            .collect();

        let started = Instant::now();
        client.close(true, None, true);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), ConnectionState::Closed);

        for status in statuses {
            match status.wait(2_000) {
                Err(Error::ChannelClosed(_)) => (),
                other => panic!("Unexpected result {:?}", other.is_ok()),
            }
        }

        for worker in churn {
            worker.join().unwrap();
        }

        match channel.send(EchoRequest::boxed(Value::Int(1))) {
            Err(Error::ChannelClosed(_)) | Err(Error::ConnectionClosed(_)) => (),
            other => panic!("Unexpected result {:?}", other.is_ok()),
        }

        server.close(false, None, true);
    }

    #[test]
    fn test_back_channel_handoff() {
        let (client, server) = loopback(
            "back-channel",
            ConnectionConfig::default(),
            ConnectionConfig::default(),
            echo_receivers("Minter", || EchoMode::BackChannel),
        );

        let front = client.open_channel(ECHO_PROTOCOL, "Minter", None, None).unwrap();

        let response = front.request(EchoRequest::boxed(Value::Int(0)), 2_000).unwrap();
        let uri = match echo_payload(response) {
            Value::String(uri) => uri,
            other => panic!("Unexpected payload {:?}", other),
        };
        assert!(uri.starts_with("channel:"));

        let back = client.accept_channel(&uri, None, None).unwrap();
        assert!(back.id() < 0, "acceptor-minted ids are negative");

        let response = back.request(EchoRequest::boxed(Value::from("ping")), 2_000).unwrap();
        assert_eq!(echo_payload(response), Value::from("ping"));

        client.close(true, None, true);
        server.close(false, None, true);
    }

    #[test]
    fn test_identity_token_rejected() {
        let (a, b) = pipe();

        let server_options = PeerOptions {
            name: "auth-server".to_string(),
            connection: ConnectionConfig {
                identity_token: Some("sesame".to_string()),
                ..ConnectionConfig::default()
            },
            service: fast_service(),
        };
        let accepting = thread::spawn(move || Acceptor::accept(Box::new(b), server_options, Vec::new(), None));

        let client_options = PeerOptions {
            name: "auth-client".to_string(),
            connection: ConnectionConfig {
                identity_token: Some("mellon".to_string()),
                ..ConnectionConfig::default()
            },
            service: fast_service(),
        };

        match Initiator::connect(Box::new(a), client_options, Vec::new(), None) {
            Err(Error::ServiceFailed(cause)) => match cause.as_ref() {
                Error::AuthFailed(_) => (),
                other => panic!("Unexpected cause {:?}", other),
            },
            other => panic!("Unexpected result {:?}", other.is_ok()),
        }

        assert!(accepting.join().unwrap().is_err());
    }

    #[test]
    fn test_identity_token_accepted() {
        let (a, b) = pipe();

        let server_options = PeerOptions {
            name: "auth-ok-server".to_string(),
            connection: ConnectionConfig {
                identity_token: Some("sesame".to_string()),
                ..ConnectionConfig::default()
            },
            service: fast_service(),
        };
        let accepting = thread::spawn(move || Acceptor::accept(Box::new(b), server_options, Vec::new(), None));

        let client_options = PeerOptions {
            name: "auth-ok-client".to_string(),
            connection: ConnectionConfig {
                identity_token: Some("sesame".to_string()),
                ..ConnectionConfig::default()
            },
            service: fast_service(),
        };

        let client = Initiator::connect(Box::new(a), client_options, Vec::new(), None).unwrap();
        let server = accepting.join().unwrap().unwrap();

        client.close(true, None, true);
        server.close(false, None, true);
    }

    /// A hand-driven peer speaking the wire protocol directly, used to force
    /// behaviors a real peer never exhibits, like ignoring pings.
    struct ManualPeer {
        transport: PipeTransport,
        read: Buffer,
        write: Buffer,
    }

    struct ManualResolver {
        control: control::ControlFactory,
        echo: EchoFactory,
        serializer: BincodeSerializer,
    }

    impl FactoryResolver for ManualResolver {
        fn resolve(&self, channel_id: i32) -> Option<(&dyn MessageFactory, &dyn Serializer)> {
            if channel_id == CHANNEL_ZERO {
                Some((&self.control, &self.serializer))
            } else {
                Some((&self.echo, &self.serializer))
            }
        }
    }

    impl ManualPeer {
        fn new(transport: PipeTransport) -> ManualPeer {
            ManualPeer {
                transport,
                read: Buffer::new(),
                write: Buffer::new(),
            }
        }

        fn poll_message(&mut self) -> Option<(i32, Box<dyn Message>)> {
            let resolver = ManualResolver {
                control: control::ControlFactory,
                echo: EchoFactory,
                serializer: BincodeSerializer,
            };

            loop {
                if let Some(payload) = frame::read_frame(&mut self.read).unwrap() {
                    match WireCodec.decode(&payload, &resolver).unwrap() {
                        Decoded::Message(channel_id, message) => return Some((channel_id, message)),
                        Decoded::Unroutable(_) => continue,
                    }
                }

                match self.read.ingress(&mut self.transport) {
                    Ok(0) => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(_) => (),
                    Err(_) => return None,
                }
            }
        }

        fn send(&mut self, channel_id: i32, message: &dyn Message) {
            let mut payload = Vec::new();
            WireCodec
                .encode(channel_id, message, &BincodeSerializer, &mut payload)
                .unwrap();
            frame::write_frame(&mut self.write, &payload).unwrap();
            self.write.egress(&mut self.transport).unwrap();
        }

        /// Answers the handshake and channel opens, swallows everything else.
        fn run_silent_after_handshake(mut self) {
            while let Some((channel_id, message)) = self.poll_message() {
                if channel_id != CHANNEL_ZERO {
                    continue;
                }

                match control::classify(message).unwrap() {
                    ControlMessage::OpenConnectionRequest(request_id, request) => {
                        let body = OpenConnectionResponse {
                            result: RESULT_OK,
                            detail: String::new(),
                            connection_id: photon::new_member_id(),
                            member_id: photon::new_member_id(),
                            protocols: request.protocols,
                        };
                        self.send(CHANNEL_ZERO, &Control::reply(request_id, body));
                    }
                    ControlMessage::OpenChannelRequest(request_id, _) => {
                        let body = OpenChannelResponse {
                            result: RESULT_OK,
                            detail: String::new(),
                        };
                        self.send(CHANNEL_ZERO, &Control::reply(request_id, body));
                    }
                    // Pings and everything else vanish into the void.
                    _ => (),
                }
            }
        }
    }

    #[test]
    fn test_unanswered_ping_fails_connection() {
        let (a, b) = pipe();

        let peer = thread::spawn(move || ManualPeer::new(b).run_silent_after_handshake());

        let client_options = PeerOptions {
            name: "ping-timeout-client".to_string(),
            connection: ConnectionConfig {
                ping_interval_millis: 40,
                ping_timeout_millis: 60,
                ..ConnectionConfig::default()
            },
            service: fast_service(),
        };
        let client = Initiator::connect(Box::new(a), client_options, Vec::new(), None).unwrap();

        let channel = client.open_channel(ECHO_PROTOCOL, "whatever", None, None).unwrap();
        let status = channel.send(EchoRequest::boxed(Value::Int(5))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while client.state() != ConnectionState::Closed && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.state(), ConnectionState::Closed);

        // The outstanding request failed along with the connection.
        match status.wait(1_000) {
            Err(Error::ChannelClosed(Some(cause))) => assert_eq!(*cause, Error::Timeout),
            other => panic!("Unexpected result {:?}", other.is_ok()),
        }

        client.close(false, None, true);
        peer.join().unwrap();
    }
}
