//! The reserved channel 0 protocol: connection open handshake, channel
//! open/accept, close notifications and ping liveness. Type ids are fixed and
//! never renumbered:
//!
//! | id | message                  |
//! |----|--------------------------|
//! | 1  | OpenConnectionRequest    |
//! | 2  | OpenConnectionResponse   |
//! | 3  | OpenChannelRequest       |
//! | 4  | OpenChannelResponse      |
//! | 5  | AcceptChannelRequest     |
//! | 6  | AcceptChannelResponse    |
//! | 7  | NotifyConnectionClosed   |
//! | 8  | PingRequest              |
//! | 9  | PingResponse             |
//! | 10 | NotifyChannelClosed      |

use crate::error::{Error, Result};
use crate::net::message::{downcast, Classification, Message, MessageFactory};
use crate::net::protocol;
use crate::net::serializer::Serializer;
use crate::net::wire::{WireReader, WireWriter};
use photon::Uuid;
use std::any::Any;
use std::sync::Arc;

pub const PROTOCOL_NAME: &str = "ControlProtocol";
pub const PROTOCOL_VERSION: i32 = 1;

/// Result codes carried by the handshake responses.
pub const RESULT_OK: u8 = 0;
pub const RESULT_REJECTED: u8 = 1;
pub const RESULT_AUTH_FAILED: u8 = 2;

/// Registers the control protocol. Safe to call repeatedly.
pub fn register_protocol() {
    protocol::register(Arc::new(ControlFactory)).expect("Control protocol must register first");
}

/// Type-specific payload of one control message. The shared `Control<T>`
/// wrapper supplies the `Message` plumbing.
pub trait ControlBody: Send + 'static {
    const TYPE_ID: i32;
    const NAME: &'static str;
    const CLASS: Classification;

    fn empty() -> Self
    where
        Self: Sized;

    fn write(&self, writer: &mut WireWriter) -> Result<()>;

    fn read(&mut self, reader: &mut WireReader) -> Result<()>;
}

/// A control message: correlation id plus typed body.
pub struct Control<T: ControlBody> {
    pub request_id: i64,
    pub body: T,
}

impl<T: ControlBody> Control<T> {
    #[inline]
    pub fn new(body: T) -> Control<T> {
        Control { request_id: 0, body }
    }

    /// A response pre-correlated to the request it answers.
    #[inline]
    pub fn reply(request_id: i64, body: T) -> Control<T> {
        Control { request_id, body }
    }

    fn empty() -> Control<T> {
        Control {
            request_id: 0,
            body: T::empty(),
        }
    }
}

impl<T: ControlBody> Message for Control<T> {
    fn type_id(&self) -> i32 {
        T::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        T::NAME
    }

    fn classification(&self) -> Classification {
        T::CLASS
    }

    fn request_id(&self) -> i64 {
        self.request_id
    }

    fn set_request_id(&mut self, id: i64) {
        self.request_id = id;
    }

    fn encode_body(&self, writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        self.body.write(writer)
    }

    fn decode_body(&mut self, reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        self.body.read(reader)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn write_uuid(writer: &mut WireWriter, uuid: &Uuid) {
    writer.write_bytes(uuid.as_bytes());
}

fn read_uuid(reader: &mut WireReader) -> Result<Uuid> {
    let bytes = reader.read_bytes()?;
    Uuid::from_slice(&bytes).map_err(|_| Error::protocol("malformed uuid"))
}

fn write_protocol_list(writer: &mut WireWriter, protocols: &[(String, i32)]) {
    writer.write_uvarint(protocols.len() as u64);
    for (name, version) in protocols {
        writer.write_string(name);
        writer.write_varint32(*version);
    }
}

fn read_protocol_list(reader: &mut WireReader) -> Result<Vec<(String, i32)>> {
    let count = reader.read_uvarint()? as usize;
    let mut protocols = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = reader.read_string()?;
        let version = reader.read_varint32()?;
        protocols.push((name, version));
    }
    Ok(protocols)
}

fn write_opt_string(writer: &mut WireWriter, text: &Option<String>) {
    match text {
        Some(text) => {
            writer.write_bool(true);
            writer.write_string(text);
        }
        None => writer.write_bool(false),
    }
}

fn read_opt_string(reader: &mut WireReader) -> Result<Option<String>> {
    if reader.read_bool()? {
        Ok(Some(reader.read_string()?))
    } else {
        Ok(None)
    }
}

/// Initiator -> acceptor, first message on the wire.
pub struct OpenConnectionRequest {
    pub member_id: Uuid,
    pub protocols: Vec<(String, i32)>,
    pub identity_token: Option<Vec<u8>>,
    pub edition: String,
}

impl ControlBody for OpenConnectionRequest {
    const TYPE_ID: i32 = 1;
    const NAME: &'static str = "OpenConnectionRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> OpenConnectionRequest {
        OpenConnectionRequest {
            member_id: Uuid::nil(),
            protocols: Vec::new(),
            identity_token: None,
            edition: String::new(),
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        write_uuid(writer, &self.member_id);
        write_protocol_list(writer, &self.protocols);
        writer.write_opt_bytes(&self.identity_token);
        writer.write_string(&self.edition);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.member_id = read_uuid(reader)?;
        self.protocols = read_protocol_list(reader)?;
        self.identity_token = reader.read_opt_bytes()?;
        self.edition = reader.read_string()?;
        Ok(())
    }
}

/// Acceptor -> initiator. On success carries the connection id the acceptor
/// assigned, the acceptor's member id and the agreed protocol versions.
pub struct OpenConnectionResponse {
    pub result: u8,
    pub detail: String,
    pub connection_id: Uuid,
    pub member_id: Uuid,
    pub protocols: Vec<(String, i32)>,
}

impl ControlBody for OpenConnectionResponse {
    const TYPE_ID: i32 = 2;
    const NAME: &'static str = "OpenConnectionResponse";
    const CLASS: Classification = Classification::Response;

    fn empty() -> OpenConnectionResponse {
        OpenConnectionResponse {
            result: RESULT_OK,
            detail: String::new(),
            connection_id: Uuid::nil(),
            member_id: Uuid::nil(),
            protocols: Vec::new(),
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_u8(self.result);
        writer.write_string(&self.detail);
        write_uuid(writer, &self.connection_id);
        write_uuid(writer, &self.member_id);
        write_protocol_list(writer, &self.protocols);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.result = reader.read_u8()?;
        self.detail = reader.read_string()?;
        self.connection_id = read_uuid(reader)?;
        self.member_id = read_uuid(reader)?;
        self.protocols = read_protocol_list(reader)?;
        Ok(())
    }
}

/// Opens a channel minted by the sender. The channel id comes out of the
/// sender's half of the id space.
pub struct OpenChannelRequest {
    pub channel_id: i32,
    pub protocol: String,
    pub receiver_name: String,
    pub serializer: String,
    pub identity_token: Option<Vec<u8>>,
}

impl ControlBody for OpenChannelRequest {
    const TYPE_ID: i32 = 3;
    const NAME: &'static str = "OpenChannelRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> OpenChannelRequest {
        OpenChannelRequest {
            channel_id: 0,
            protocol: String::new(),
            receiver_name: String::new(),
            serializer: String::new(),
            identity_token: None,
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_varint32(self.channel_id);
        writer.write_string(&self.protocol);
        writer.write_string(&self.receiver_name);
        writer.write_string(&self.serializer);
        writer.write_opt_bytes(&self.identity_token);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.channel_id = reader.read_varint32()?;
        self.protocol = reader.read_string()?;
        self.receiver_name = reader.read_string()?;
        self.serializer = reader.read_string()?;
        self.identity_token = reader.read_opt_bytes()?;
        Ok(())
    }
}

pub struct OpenChannelResponse {
    pub result: u8,
    pub detail: String,
}

impl ControlBody for OpenChannelResponse {
    const TYPE_ID: i32 = 4;
    const NAME: &'static str = "OpenChannelResponse";
    const CLASS: Classification = Classification::Response;

    fn empty() -> OpenChannelResponse {
        OpenChannelResponse {
            result: RESULT_OK,
            detail: String::new(),
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_u8(self.result);
        writer.write_string(&self.detail);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.result = reader.read_u8()?;
        self.detail = reader.read_string()?;
        Ok(())
    }
}

/// Accepts a back-channel minted by the peer and handed over by URI.
pub struct AcceptChannelRequest {
    pub channel_id: i32,
}

impl ControlBody for AcceptChannelRequest {
    const TYPE_ID: i32 = 5;
    const NAME: &'static str = "AcceptChannelRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> AcceptChannelRequest {
        AcceptChannelRequest { channel_id: 0 }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_varint32(self.channel_id);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.channel_id = reader.read_varint32()?;
        Ok(())
    }
}

pub struct AcceptChannelResponse {
    pub result: u8,
    pub detail: String,
}

impl ControlBody for AcceptChannelResponse {
    const TYPE_ID: i32 = 6;
    const NAME: &'static str = "AcceptChannelResponse";
    const CLASS: Classification = Classification::Response;

    fn empty() -> AcceptChannelResponse {
        AcceptChannelResponse {
            result: RESULT_OK,
            detail: String::new(),
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_u8(self.result);
        writer.write_string(&self.detail);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.result = reader.read_u8()?;
        self.detail = reader.read_string()?;
        Ok(())
    }
}

pub struct NotifyConnectionClosed {
    pub cause: Option<String>,
}

impl ControlBody for NotifyConnectionClosed {
    const TYPE_ID: i32 = 7;
    const NAME: &'static str = "NotifyConnectionClosed";
    const CLASS: Classification = Classification::Notify;

    fn empty() -> NotifyConnectionClosed {
        NotifyConnectionClosed { cause: None }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        write_opt_string(writer, &self.cause);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.cause = read_opt_string(reader)?;
        Ok(())
    }
}

pub struct PingRequest;

impl ControlBody for PingRequest {
    const TYPE_ID: i32 = 8;
    const NAME: &'static str = "PingRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> PingRequest {
        PingRequest
    }

    fn write(&self, _writer: &mut WireWriter) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut WireReader) -> Result<()> {
        Ok(())
    }
}

pub struct PingResponse;

impl ControlBody for PingResponse {
    const TYPE_ID: i32 = 9;
    const NAME: &'static str = "PingResponse";
    const CLASS: Classification = Classification::Response;

    fn empty() -> PingResponse {
        PingResponse
    }

    fn write(&self, _writer: &mut WireWriter) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut WireReader) -> Result<()> {
        Ok(())
    }
}

pub struct NotifyChannelClosed {
    pub channel_id: i32,
    pub cause: Option<String>,
}

impl ControlBody for NotifyChannelClosed {
    const TYPE_ID: i32 = 10;
    const NAME: &'static str = "NotifyChannelClosed";
    const CLASS: Classification = Classification::Notify;

    fn empty() -> NotifyChannelClosed {
        NotifyChannelClosed {
            channel_id: 0,
            cause: None,
        }
    }

    fn write(&self, writer: &mut WireWriter) -> Result<()> {
        writer.write_varint32(self.channel_id);
        write_opt_string(writer, &self.cause);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader) -> Result<()> {
        self.channel_id = reader.read_varint32()?;
        self.cause = read_opt_string(reader)?;
        Ok(())
    }
}

pub struct ControlFactory;

impl MessageFactory for ControlFactory {
    fn protocol_name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn version(&self) -> i32 {
        PROTOCOL_VERSION
    }

    fn create(&self, type_id: i32) -> Option<Box<dyn Message>> {
        match type_id {
            1 => Some(Box::new(Control::<OpenConnectionRequest>::empty())),
            2 => Some(Box::new(Control::<OpenConnectionResponse>::empty())),
            3 => Some(Box::new(Control::<OpenChannelRequest>::empty())),
            4 => Some(Box::new(Control::<OpenChannelResponse>::empty())),
            5 => Some(Box::new(Control::<AcceptChannelRequest>::empty())),
            6 => Some(Box::new(Control::<AcceptChannelResponse>::empty())),
            7 => Some(Box::new(Control::<NotifyConnectionClosed>::empty())),
            8 => Some(Box::new(Control::<PingRequest>::empty())),
            9 => Some(Box::new(Control::<PingResponse>::empty())),
            10 => Some(Box::new(Control::<NotifyChannelClosed>::empty())),
            _ => None,
        }
    }
}

/// Inbound control traffic, classified for the connection core.
pub enum ControlMessage {
    OpenConnectionRequest(i64, OpenConnectionRequest),
    OpenConnectionResponse(i64, OpenConnectionResponse),
    OpenChannelRequest(i64, OpenChannelRequest),
    OpenChannelResponse(i64, OpenChannelResponse),
    AcceptChannelRequest(i64, AcceptChannelRequest),
    AcceptChannelResponse(i64, AcceptChannelResponse),
    NotifyConnectionClosed(NotifyConnectionClosed),
    PingRequest(i64),
    PingResponse(i64),
    NotifyChannelClosed(NotifyChannelClosed),
}

/// Sorts a decoded channel 0 message into its concrete control form.
pub fn classify(message: Box<dyn Message>) -> Result<ControlMessage> {
    let type_id = Message::type_id(message.as_ref());
    let request_id = message.request_id();

    Ok(match type_id {
        1 => ControlMessage::OpenConnectionRequest(request_id, downcast::<Control<OpenConnectionRequest>>(message)?.body),
        2 => ControlMessage::OpenConnectionResponse(request_id, downcast::<Control<OpenConnectionResponse>>(message)?.body),
        3 => ControlMessage::OpenChannelRequest(request_id, downcast::<Control<OpenChannelRequest>>(message)?.body),
        4 => ControlMessage::OpenChannelResponse(request_id, downcast::<Control<OpenChannelResponse>>(message)?.body),
        5 => ControlMessage::AcceptChannelRequest(request_id, downcast::<Control<AcceptChannelRequest>>(message)?.body),
        6 => ControlMessage::AcceptChannelResponse(request_id, downcast::<Control<AcceptChannelResponse>>(message)?.body),
        7 => ControlMessage::NotifyConnectionClosed(downcast::<Control<NotifyConnectionClosed>>(message)?.body),
        8 => ControlMessage::PingRequest(request_id),
        9 => ControlMessage::PingResponse(request_id),
        10 => ControlMessage::NotifyChannelClosed(downcast::<Control<NotifyChannelClosed>>(message)?.body),
        other => return Err(Error::Protocol(format!("unknown control type id {}", other))),
    })
}
