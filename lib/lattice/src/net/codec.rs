//! Message <-> frame payload codec. The payload layout is fixed:
//! `varint32 channel_id, varint32 type_id, varint64 request_id, body`, with a
//! response carrying the negation of the request id it answers.

use crate::error::{Error, Result};
use crate::net::message::{Classification, Message, MessageFactory};
use crate::net::serializer::Serializer;
use crate::net::wire::{WireReader, WireWriter};

/// Resolves the factory and serializer for an inbound channel id. Implemented
/// by the connection core over its channel table.
pub trait FactoryResolver {
    fn resolve(&self, channel_id: i32) -> Option<(&dyn MessageFactory, &dyn Serializer)>;
}

/// Outcome of decoding one frame payload.
pub enum Decoded {
    Message(i32, Box<dyn Message>),
    /// The frame addressed a channel the resolver no longer knows — either the
    /// channel raced its own close or the peer is confused. Not fatal; the
    /// connection logs and drops it.
    Unroutable(i32),
}

pub trait Codec: Send {
    /// Encode one message into a frame payload.
    fn encode(
        &self,
        channel_id: i32,
        message: &dyn Message,
        serializer: &dyn Serializer,
        payload: &mut Vec<u8>,
    ) -> Result<()>;

    /// Decode one frame payload into the target channel id and a message.
    fn decode(&self, payload: &[u8], resolver: &dyn FactoryResolver) -> Result<Decoded>;
}

/// The default codec.
pub struct WireCodec;

impl Codec for WireCodec {
    fn encode(
        &self,
        channel_id: i32,
        message: &dyn Message,
        serializer: &dyn Serializer,
        payload: &mut Vec<u8>,
    ) -> Result<()> {
        let request_id = match message.classification() {
            Classification::Notify => 0,
            Classification::Request => message.request_id(),
            Classification::Response => -message.request_id(),
        };

        let mut writer = WireWriter::new(payload);
        writer.write_varint32(channel_id);
        writer.write_varint32(message.type_id());
        writer.write_varint64(request_id);
        message.encode_body(&mut writer, serializer)
    }

    fn decode(&self, payload: &[u8], resolver: &dyn FactoryResolver) -> Result<Decoded> {
        let mut reader = WireReader::new(payload);
        let channel_id = reader.read_varint32()?;
        let type_id = reader.read_varint32()?;
        let request_id = reader.read_varint64()?;

        let (factory, serializer) = match resolver.resolve(channel_id) {
            Some(resolved) => resolved,
            None => return Ok(Decoded::Unroutable(channel_id)),
        };

        let mut message = factory.create(type_id).ok_or_else(|| {
            Error::Protocol(format!(
                "unknown type id {} for protocol {} v{}",
                type_id,
                factory.protocol_name(),
                factory.version()
            ))
        })?;

        match message.classification() {
            Classification::Notify => {
                if request_id != 0 {
                    return Err(Error::Protocol(format!(
                        "notification {} carries request id {}",
                        message.type_name(),
                        request_id
                    )));
                }
            }
            Classification::Request => {
                if request_id <= 0 {
                    return Err(Error::Protocol(format!(
                        "request {} carries non-positive request id {}",
                        message.type_name(),
                        request_id
                    )));
                }
                message.set_request_id(request_id);
            }
            Classification::Response => {
                if request_id >= 0 {
                    return Err(Error::Protocol(format!(
                        "response {} carries non-negative request id {}",
                        message.type_name(),
                        request_id
                    )));
                }
                message.set_request_id(-request_id);
            }
        }

        message.decode_body(&mut reader, serializer)?;

        if reader.remaining() != 0 {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                message.type_name()
            )));
        }

        Ok(Decoded::Message(channel_id, message))
    }
}
