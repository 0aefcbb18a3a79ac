//! Message definitions for the remote cache and invocation services. Three
//! protocols share one shape: type 0 is the generic response, positive types
//! are requests, and the map-event notification rides the named-cache
//! protocol as type 20.

use crate::error::{Error, Result};
use crate::net::message::{Classification, Message, MessageFactory};
use crate::net::protocol;
use crate::net::serializer::Serializer;
use crate::net::wire::{WireReader, WireWriter};
use crate::value::Value;
use std::any::Any;
use std::sync::Arc;

pub const CACHE_SERVICE_PROTOCOL: &str = "CacheServiceProtocol";
pub const NAMED_CACHE_PROTOCOL: &str = "NamedCacheProtocol";
pub const INVOCATION_SERVICE_PROTOCOL: &str = "InvocationServiceProtocol";

pub const CACHE_SERVICE_RECEIVER: &str = "CacheServiceProxy";
pub const INVOCATION_SERVICE_RECEIVER: &str = "InvocationServiceProxy";

/// Query shapes carried by `QueryRequest`.
pub const QUERY_KEYS: u8 = 0;
pub const QUERY_ENTRIES: u8 = 1;
pub const QUERY_VALUES: u8 = 2;

/// Error kinds carried inside a failure `Response`.
const ERROR_GENERIC: u8 = 0;
const ERROR_UNSUPPORTED: u8 = 1;
const ERROR_TIMEOUT: u8 = 2;
const ERROR_SERIALIZATION: u8 = 3;
const ERROR_CONFIG: u8 = 4;

/// Registers all three protocols. Safe to call repeatedly; invoked implicitly
/// whenever a connection snapshots the registry.
pub fn register_protocols() {
    protocol::register(Arc::new(CacheServiceFactory)).expect("Cache service protocol must register first");
    protocol::register(Arc::new(NamedCacheFactory)).expect("Named cache protocol must register first");
    protocol::register(Arc::new(InvocationFactory)).expect("Invocation protocol must register first");
}

/// Type-specific payload of one service message; `Envelope<T>` supplies the
/// `Message` plumbing. Unlike the control protocol, bodies here carry user
/// values and therefore serialize through the channel serializer.
pub trait Body: Send + 'static {
    const TYPE_ID: i32;
    const NAME: &'static str;
    const CLASS: Classification;

    fn empty() -> Self
    where
        Self: Sized;

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()>;

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()>;
}

pub struct Envelope<T: Body> {
    pub request_id: i64,
    pub body: T,
}

impl<T: Body> Envelope<T> {
    #[inline]
    pub fn new(body: T) -> Envelope<T> {
        Envelope { request_id: 0, body }
    }

    #[inline]
    pub fn boxed(body: T) -> Box<dyn Message> {
        Box::new(Envelope::new(body))
    }

    fn empty() -> Envelope<T> {
        Envelope {
            request_id: 0,
            body: T::empty(),
        }
    }
}

impl<T: Body> Message for Envelope<T> {
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

    fn encode_body(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        self.body.write(writer, serializer)
    }

    fn decode_body(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.body.read(reader, serializer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---- wire helpers ----------------------------------------------------------

pub fn values_to_value(values: &[Value]) -> Value {
    Value::List(values.to_vec())
}

pub fn values_from_value(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(Error::Serialization(format!("expected a value list, got {}", other))),
    }
}

pub fn pairs_to_value(pairs: &[(Value, Value)]) -> Value {
    Value::List(
        pairs
            .iter()
            .map(|(key, value)| Value::List(vec![key.clone(), value.clone()]))
            .collect(),
    )
}

pub fn pairs_from_value(value: Value) -> Result<Vec<(Value, Value)>> {
    let items = values_from_value(value)?;
    let mut pairs = Vec::with_capacity(items.len());

    for item in items {
        match item {
            Value::List(mut pair) if pair.len() == 2 => {
                let value = pair.pop().expect("Pair length checked");
                let key = pair.pop().expect("Pair length checked");
                pairs.push((key, value));
            }
            other => return Err(Error::Serialization(format!("expected a key/value pair, got {}", other))),
        }
    }
    Ok(pairs)
}

/// Folds a local failure into the wire form carried by `Response`.
pub fn encode_error(error: &Error) -> (u8, String) {
    match error {
        Error::Unsupported(op) => (ERROR_UNSUPPORTED, (*op).to_string()),
        Error::Timeout => (ERROR_TIMEOUT, String::new()),
        Error::Serialization(detail) => (ERROR_SERIALIZATION, detail.clone()),
        Error::Config(detail) => (ERROR_CONFIG, detail.clone()),
        other => (ERROR_GENERIC, other.to_string()),
    }
}

/// Inverse of `encode_error`, surfacing the peer's failure verbatim.
pub fn decode_error(kind: u8, detail: String) -> Error {
    match kind {
        ERROR_UNSUPPORTED => Error::Unsupported("operation not supported by the peer"),
        ERROR_TIMEOUT => Error::Timeout,
        ERROR_SERIALIZATION => Error::Serialization(detail),
        ERROR_CONFIG => Error::Config(detail),
        _ => Error::Protocol(detail),
    }
}

// ---- shared response --------------------------------------------------------

/// Generic response closing any request on these protocols.
pub struct Response {
    pub failure: bool,
    pub error_kind: u8,
    pub error: String,
    pub result: Value,
}

impl Response {
    pub fn ok(result: Value) -> Response {
        Response {
            failure: false,
            error_kind: ERROR_GENERIC,
            error: String::new(),
            result,
        }
    }

    pub fn failed(error: &Error) -> Response {
        let (error_kind, detail) = encode_error(error);
        Response {
            failure: true,
            error_kind,
            error: detail,
            result: Value::Null,
        }
    }

    /// Unpacks into the caller-facing result.
    pub fn into_result(self) -> Result<Value> {
        if self.failure {
            Err(decode_error(self.error_kind, self.error))
        } else {
            Ok(self.result)
        }
    }
}

impl Body for Response {
    const TYPE_ID: i32 = 0;
    const NAME: &'static str = "Response";
    const CLASS: Classification = Classification::Response;

    fn empty() -> Response {
        Response::ok(Value::Null)
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_bool(self.failure);
        writer.write_u8(self.error_kind);
        writer.write_string(&self.error);
        writer.write_value(serializer, &self.result)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.failure = reader.read_bool()?;
        self.error_kind = reader.read_u8()?;
        self.error = reader.read_string()?;
        self.result = reader.read_value(serializer)?;
        Ok(())
    }
}

// ---- cache service protocol -------------------------------------------------

/// Asks the cache service proxy for a named cache; the response result is the
/// back-channel URI serving it.
pub struct EnsureCacheRequest {
    pub cache_name: String,
}

impl Body for EnsureCacheRequest {
    const TYPE_ID: i32 = 1;
    const NAME: &'static str = "EnsureCacheRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> EnsureCacheRequest {
        EnsureCacheRequest {
            cache_name: String::new(),
        }
    }

    fn write(&self, writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        writer.write_string(&self.cache_name);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        self.cache_name = reader.read_string()?;
        Ok(())
    }
}

pub struct CacheServiceFactory;

impl MessageFactory for CacheServiceFactory {
    fn protocol_name(&self) -> &str {
        CACHE_SERVICE_PROTOCOL
    }

    fn version(&self) -> i32 {
        1
    }

    fn create(&self, type_id: i32) -> Option<Box<dyn Message>> {
        match type_id {
            0 => Some(Box::new(Envelope::<Response>::empty())),
            1 => Some(Box::new(Envelope::<EnsureCacheRequest>::empty())),
            _ => None,
        }
    }
}

// ---- named cache protocol ---------------------------------------------------

pub struct GetRequest {
    pub key: Value,
}

impl Body for GetRequest {
    const TYPE_ID: i32 = 1;
    const NAME: &'static str = "GetRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> GetRequest {
        GetRequest { key: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct PutRequest {
    pub key: Value,
    pub value: Value,
    pub expiry_millis: i64,
    pub return_old: bool,
}

impl Body for PutRequest {
    const TYPE_ID: i32 = 2;
    const NAME: &'static str = "PutRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> PutRequest {
        PutRequest {
            key: Value::Null,
            value: Value::Null,
            expiry_millis: 0,
            return_old: false,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)?;
        writer.write_value(serializer, &self.value)?;
        writer.write_varint64(self.expiry_millis);
        writer.write_bool(self.return_old);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        self.value = reader.read_value(serializer)?;
        self.expiry_millis = reader.read_varint64()?;
        self.return_old = reader.read_bool()?;
        Ok(())
    }
}

pub struct RemoveRequest {
    pub key: Value,
}

impl Body for RemoveRequest {
    const TYPE_ID: i32 = 3;
    const NAME: &'static str = "RemoveRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> RemoveRequest {
        RemoveRequest { key: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct ContainsKeyRequest {
    pub key: Value,
}

impl Body for ContainsKeyRequest {
    const TYPE_ID: i32 = 4;
    const NAME: &'static str = "ContainsKeyRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> ContainsKeyRequest {
        ContainsKeyRequest { key: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct SizeRequest;

impl Body for SizeRequest {
    const TYPE_ID: i32 = 5;
    const NAME: &'static str = "SizeRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> SizeRequest {
        SizeRequest
    }

    fn write(&self, _writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }
}

pub struct ClearRequest;

impl Body for ClearRequest {
    const TYPE_ID: i32 = 6;
    const NAME: &'static str = "ClearRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> ClearRequest {
        ClearRequest
    }

    fn write(&self, _writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }
}

pub struct GetAllRequest {
    pub keys: Vec<Value>,
}

impl Body for GetAllRequest {
    const TYPE_ID: i32 = 7;
    const NAME: &'static str = "GetAllRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> GetAllRequest {
        GetAllRequest { keys: Vec::new() }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &values_to_value(&self.keys))
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.keys = values_from_value(reader.read_value(serializer)?)?;
        Ok(())
    }
}

pub struct PutAllRequest {
    pub entries: Vec<(Value, Value)>,
}

impl Body for PutAllRequest {
    const TYPE_ID: i32 = 8;
    const NAME: &'static str = "PutAllRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> PutAllRequest {
        PutAllRequest { entries: Vec::new() }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &pairs_to_value(&self.entries))
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.entries = pairs_from_value(reader.read_value(serializer)?)?;
        Ok(())
    }
}

/// Filtered key/entry/value query. The filter travels in its value encoding;
/// the optional comparator travels by registry name.
pub struct QueryRequest {
    pub shape: u8,
    pub filter: Value,
    pub comparator: Option<String>,
}

impl Body for QueryRequest {
    const TYPE_ID: i32 = 9;
    const NAME: &'static str = "QueryRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> QueryRequest {
        QueryRequest {
            shape: QUERY_KEYS,
            filter: Value::Null,
            comparator: None,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_u8(self.shape);
        writer.write_value(serializer, &self.filter)?;
        match &self.comparator {
            Some(name) => {
                writer.write_bool(true);
                writer.write_string(name);
            }
            None => writer.write_bool(false),
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.shape = reader.read_u8()?;
        self.filter = reader.read_value(serializer)?;
        self.comparator = if reader.read_bool()? {
            Some(reader.read_string()?)
        } else {
            None
        };
        Ok(())
    }
}

pub struct InvokeRequest {
    pub key: Value,
    pub processor: Value,
}

impl Body for InvokeRequest {
    const TYPE_ID: i32 = 10;
    const NAME: &'static str = "InvokeRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> InvokeRequest {
        InvokeRequest {
            key: Value::Null,
            processor: Value::Null,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)?;
        writer.write_value(serializer, &self.processor)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        self.processor = reader.read_value(serializer)?;
        Ok(())
    }
}

/// Processor fan-out over an explicit key set or a filter selection.
pub struct InvokeAllRequest {
    pub by_filter: bool,
    pub keys: Vec<Value>,
    pub filter: Value,
    pub processor: Value,
}

impl Body for InvokeAllRequest {
    const TYPE_ID: i32 = 11;
    const NAME: &'static str = "InvokeAllRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> InvokeAllRequest {
        InvokeAllRequest {
            by_filter: false,
            keys: Vec::new(),
            filter: Value::Null,
            processor: Value::Null,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_bool(self.by_filter);
        writer.write_value(serializer, &values_to_value(&self.keys))?;
        writer.write_value(serializer, &self.filter)?;
        writer.write_value(serializer, &self.processor)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.by_filter = reader.read_bool()?;
        self.keys = values_from_value(reader.read_value(serializer)?)?;
        self.filter = reader.read_value(serializer)?;
        self.processor = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct AggregateRequest {
    pub filter: Value,
    pub aggregator: Value,
}

impl Body for AggregateRequest {
    const TYPE_ID: i32 = 12;
    const NAME: &'static str = "AggregateRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> AggregateRequest {
        AggregateRequest {
            filter: Value::Null,
            aggregator: Value::Null,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.filter)?;
        writer.write_value(serializer, &self.aggregator)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.filter = reader.read_value(serializer)?;
        self.aggregator = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct AddIndexRequest {
    pub extractor: Value,
    pub ordered: bool,
    pub comparator: Option<String>,
}

impl Body for AddIndexRequest {
    const TYPE_ID: i32 = 13;
    const NAME: &'static str = "AddIndexRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> AddIndexRequest {
        AddIndexRequest {
            extractor: Value::Null,
            ordered: false,
            comparator: None,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.extractor)?;
        writer.write_bool(self.ordered);
        match &self.comparator {
            Some(name) => {
                writer.write_bool(true);
                writer.write_string(name);
            }
            None => writer.write_bool(false),
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.extractor = reader.read_value(serializer)?;
        self.ordered = reader.read_bool()?;
        self.comparator = if reader.read_bool()? {
            Some(reader.read_string()?)
        } else {
            None
        };
        Ok(())
    }
}

pub struct RemoveIndexRequest {
    pub extractor: Value,
}

impl Body for RemoveIndexRequest {
    const TYPE_ID: i32 = 14;
    const NAME: &'static str = "RemoveIndexRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> RemoveIndexRequest {
        RemoveIndexRequest { extractor: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.extractor)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.extractor = reader.read_value(serializer)?;
        Ok(())
    }
}

/// Subscribes the sending peer to map events for `scope`. The listener id is
/// client-assigned and echoed back inside no messages; it only scopes the
/// later remove.
pub struct AddListenerRequest {
    pub scope: Value,
    pub lite: bool,
    pub listener_id: u64,
}

impl Body for AddListenerRequest {
    const TYPE_ID: i32 = 15;
    const NAME: &'static str = "AddListenerRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> AddListenerRequest {
        AddListenerRequest {
            scope: Value::Null,
            lite: false,
            listener_id: 0,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.scope)?;
        writer.write_bool(self.lite);
        writer.write_uvarint(self.listener_id);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.scope = reader.read_value(serializer)?;
        self.lite = reader.read_bool()?;
        self.listener_id = reader.read_uvarint()?;
        Ok(())
    }
}

pub struct RemoveListenerRequest {
    pub listener_id: u64,
}

impl Body for RemoveListenerRequest {
    const TYPE_ID: i32 = 16;
    const NAME: &'static str = "RemoveListenerRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> RemoveListenerRequest {
        RemoveListenerRequest { listener_id: 0 }
    }

    fn write(&self, writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        writer.write_uvarint(self.listener_id);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        self.listener_id = reader.read_uvarint()?;
        Ok(())
    }
}

pub struct LockRequest {
    pub key: Value,
    pub wait_millis: i64,
}

impl Body for LockRequest {
    const TYPE_ID: i32 = 17;
    const NAME: &'static str = "LockRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> LockRequest {
        LockRequest {
            key: Value::Null,
            wait_millis: 0,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)?;
        writer.write_varint64(self.wait_millis);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        self.wait_millis = reader.read_varint64()?;
        Ok(())
    }
}

pub struct UnlockRequest {
    pub key: Value,
}

impl Body for UnlockRequest {
    const TYPE_ID: i32 = 18;
    const NAME: &'static str = "UnlockRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> UnlockRequest {
        UnlockRequest { key: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.key)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.key = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct TruncateRequest;

impl Body for TruncateRequest {
    const TYPE_ID: i32 = 19;
    const NAME: &'static str = "TruncateRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> TruncateRequest {
        TruncateRequest
    }

    fn write(&self, _writer: &mut WireWriter, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut WireReader, _serializer: &dyn Serializer) -> Result<()> {
        Ok(())
    }
}

/// Unsolicited cache event pushed from the proxy to subscribed clients.
pub struct MapEventMessage {
    pub kind: u8,
    pub cause: u8,
    pub key: Value,
    /// Option-list encodings; empty list means absent.
    pub old: Value,
    pub new: Value,
    pub lite: bool,
}

impl Body for MapEventMessage {
    const TYPE_ID: i32 = 20;
    const NAME: &'static str = "MapEventMessage";
    const CLASS: Classification = Classification::Notify;

    fn empty() -> MapEventMessage {
        MapEventMessage {
            kind: 0,
            cause: 0,
            key: Value::Null,
            old: Value::List(Vec::new()),
            new: Value::List(Vec::new()),
            lite: false,
        }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_u8(self.kind);
        writer.write_u8(self.cause);
        writer.write_value(serializer, &self.key)?;
        writer.write_value(serializer, &self.old)?;
        writer.write_value(serializer, &self.new)?;
        writer.write_bool(self.lite);
        Ok(())
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.kind = reader.read_u8()?;
        self.cause = reader.read_u8()?;
        self.key = reader.read_value(serializer)?;
        self.old = reader.read_value(serializer)?;
        self.new = reader.read_value(serializer)?;
        self.lite = reader.read_bool()?;
        Ok(())
    }
}

pub struct NamedCacheFactory;

impl MessageFactory for NamedCacheFactory {
    fn protocol_name(&self) -> &str {
        NAMED_CACHE_PROTOCOL
    }

    fn version(&self) -> i32 {
        1
    }

    fn create(&self, type_id: i32) -> Option<Box<dyn Message>> {
        match type_id {
            0 => Some(Box::new(Envelope::<Response>::empty())),
            1 => Some(Box::new(Envelope::<GetRequest>::empty())),
            2 => Some(Box::new(Envelope::<PutRequest>::empty())),
            3 => Some(Box::new(Envelope::<RemoveRequest>::empty())),
            4 => Some(Box::new(Envelope::<ContainsKeyRequest>::empty())),
            5 => Some(Box::new(Envelope::<SizeRequest>::empty())),
            6 => Some(Box::new(Envelope::<ClearRequest>::empty())),
            7 => Some(Box::new(Envelope::<GetAllRequest>::empty())),
            8 => Some(Box::new(Envelope::<PutAllRequest>::empty())),
            9 => Some(Box::new(Envelope::<QueryRequest>::empty())),
            10 => Some(Box::new(Envelope::<InvokeRequest>::empty())),
            11 => Some(Box::new(Envelope::<InvokeAllRequest>::empty())),
            12 => Some(Box::new(Envelope::<AggregateRequest>::empty())),
            13 => Some(Box::new(Envelope::<AddIndexRequest>::empty())),
            14 => Some(Box::new(Envelope::<RemoveIndexRequest>::empty())),
            15 => Some(Box::new(Envelope::<AddListenerRequest>::empty())),
            16 => Some(Box::new(Envelope::<RemoveListenerRequest>::empty())),
            17 => Some(Box::new(Envelope::<LockRequest>::empty())),
            18 => Some(Box::new(Envelope::<UnlockRequest>::empty())),
            19 => Some(Box::new(Envelope::<TruncateRequest>::empty())),
            20 => Some(Box::new(Envelope::<MapEventMessage>::empty())),
            _ => None,
        }
    }
}

// ---- invocation protocol ----------------------------------------------------

/// Executes a serialized task on the peer and returns its result.
pub struct InvocationRequest {
    pub task: Value,
}

impl Body for InvocationRequest {
    const TYPE_ID: i32 = 1;
    const NAME: &'static str = "InvocationRequest";
    const CLASS: Classification = Classification::Request;

    fn empty() -> InvocationRequest {
        InvocationRequest { task: Value::Null }
    }

    fn write(&self, writer: &mut WireWriter, serializer: &dyn Serializer) -> Result<()> {
        writer.write_value(serializer, &self.task)
    }

    fn read(&mut self, reader: &mut WireReader, serializer: &dyn Serializer) -> Result<()> {
        self.task = reader.read_value(serializer)?;
        Ok(())
    }
}

pub struct InvocationFactory;

impl MessageFactory for InvocationFactory {
    fn protocol_name(&self) -> &str {
        INVOCATION_SERVICE_PROTOCOL
    }

    fn version(&self) -> i32 {
        1
    }

    fn create(&self, type_id: i32) -> Option<Box<dyn Message>> {
        match type_id {
            0 => Some(Box::new(Envelope::<Response>::empty())),
            1 => Some(Box::new(Envelope::<InvocationRequest>::empty())),
            _ => None,
        }
    }
}
