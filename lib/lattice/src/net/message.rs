use crate::error::{Error, Result};
use crate::net::serializer::Serializer;
use crate::net::wire::{WireReader, WireWriter};
use std::any::Any;

/// How a message participates in request/response correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Unsolicited one-way message; carries no request id.
    Notify,
    /// Expects exactly one response sharing its request id.
    Request,
    /// Completes the pending request with the same absolute request id.
    Response,
}

/// A typed protocol message. The type id is unique within the owning
/// protocol; the request id is assigned by the sending channel for requests
/// and mirrored (negated on the wire) by responses.
pub trait Message: Send {
    fn type_id(&self) -> i32;

    /// Stable name for logging.
    fn type_name(&self) -> &'static str;

    fn classification(&self) -> Classification;

    fn request_id(&self) -> i64 {
        0
    }

    fn set_request_id(&mut self, _id: i64) {}

    /// Serialize the type-specific fields. The header (channel, type and
    /// request ids) is written by the codec, never here.
    fn encode_body(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()>;

    /// Populate the type-specific fields of a factory-fresh message.
    fn decode_body(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl std::fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.type_name())
            .field("type_id", &self.type_id())
            .field("request_id", &self.request_id())
            .finish()
    }
}

/// Allocates empty messages for one version of one protocol.
pub trait MessageFactory: Send + Sync {
    fn protocol_name(&self) -> &str;

    fn version(&self) -> i32;

    /// Returns an empty message ready to decode its body, or `None` for an
    /// unknown type id.
    fn create(&self, type_id: i32) -> Option<Box<dyn Message>>;
}

/// Downcasts a received message to its concrete type.
pub fn downcast<T: Any>(message: Box<dyn Message>) -> Result<Box<T>> {
    let name = message.type_name();
    message
        .into_any()
        .downcast::<T>()
        .map_err(|_| Error::Protocol(format!("unexpected message type {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        marker: u8,
    }

    impl Message for Probe {
        fn type_id(&self) -> i32 {
            77
        }

        fn type_name(&self) -> &'static str {
            "Probe"
        }

        fn classification(&self) -> Classification {
            Classification::Notify
        }

        fn encode_body(&self, writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
            writer.write_u8(self.marker);
            Ok(())
        }

        fn decode_body(&mut self, reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
            self.marker = reader.read_u8()?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    #[test]
    fn test_downcast() {
        let message: Box<dyn Message> = Box::new(Probe { marker: 3 });
        let probe = downcast::<Probe>(message).unwrap();
        assert_eq!(probe.marker, 3);
    }

    #[test]
    fn test_downcast_wrong_type() {
        struct Other;
        let message: Box<dyn Message> = Box::new(Probe { marker: 0 });
        match downcast::<Other>(message) {
            Err(Error::Protocol(detail)) => assert!(detail.contains("Probe")),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }
}
