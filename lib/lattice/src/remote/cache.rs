//! Remote cache facades: thin glue between the `NamedCache` surface and a
//! negotiated channel. No retries, no result massaging — the peer's answer
//! (or failure) is surfaced verbatim, and deadlines ride the request slot.

use crate::cache::listener::{CacheEvent, CacheListener, EventCause, EventKind, ListenerId, ListenerRegistry, ListenerScope};
use crate::cache::{Aggregator, Comparator, Extractor, Filter, NamedCache, Processor};
use crate::error::{Error, Result};
use crate::net::channel::{Receiver, ReceiverContext};
use crate::net::connection::{ChannelHandle, ConnectionHandle};
use crate::net::message::{downcast, Message};
use crate::remote::protocol::{
    pairs_from_value, values_from_value, AddIndexRequest, AddListenerRequest, AggregateRequest, Body,
    ClearRequest, ContainsKeyRequest, Envelope, EnsureCacheRequest, GetAllRequest, GetRequest,
    InvokeAllRequest, InvokeRequest, LockRequest, MapEventMessage, PutAllRequest, PutRequest,
    QueryRequest, RemoveIndexRequest, RemoveListenerRequest, RemoveRequest, Response, SizeRequest,
    TruncateRequest, UnlockRequest, CACHE_SERVICE_PROTOCOL, CACHE_SERVICE_RECEIVER, QUERY_ENTRIES,
    QUERY_KEYS, QUERY_VALUES,
};
use crate::value::Value;
use photon::logging;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Facade over the cache service channel. One instance per connection is the
/// norm; each `ensure_cache` negotiates a dedicated back-channel.
pub struct RemoteCacheService {
    connection: ConnectionHandle,
    channel: ChannelHandle,
    log: logging::Logger,
}

impl RemoteCacheService {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        connection: &ConnectionHandle,
        log: L,
    ) -> Result<RemoteCacheService> {
        let channel = connection.open_channel(CACHE_SERVICE_PROTOCOL, CACHE_SERVICE_RECEIVER, None, None)?;

        Ok(RemoteCacheService {
            connection: connection.clone(),
            channel,
            log: logging::child(log, logging::o!("facade" => "cache-service")),
        })
    }

    /// Obtains (creating if needed) the named cache on the grid. The proxy
    /// answers with a back-channel URI which is accepted here, yielding the
    /// channel all cache traffic rides on.
    pub fn ensure_cache(&self, name: &str) -> Result<RemoteNamedCache> {
        let response = self.channel.request(
            Envelope::boxed(EnsureCacheRequest {
                cache_name: name.to_string(),
            }),
            0,
        )?;
        let uri = match unwrap_response(response)? {
            Value::String(uri) => uri,
            other => {
                return Err(Error::Protocol(format!(
                    "ensure cache returned {} instead of a channel uri",
                    other
                )))
            }
        };

        logging::debug!(self.log, "cache ensured"; "cache" => name, "uri" => &uri);

        let state = Arc::new(RemoteCacheState {
            cache_name: name.to_string(),
            listeners: Mutex::new(ListenerRegistry::new()),
            connection: self.connection.clone(),
            log: self.log.new(logging::o!("cache" => name.to_string())),
        });

        let receiver = Box::new(CacheEventReceiver { state: state.clone() });
        let channel = self.connection.accept_channel(&uri, Some(receiver), None)?;

        Ok(RemoteNamedCache {
            state,
            channel,
        })
    }
}

struct RemoteCacheState {
    cache_name: String,
    listeners: Mutex<ListenerRegistry>,
    connection: ConnectionHandle,
    log: logging::Logger,
}

impl RemoteCacheState {
    /// Dispatches one decoded map event to the matching local registrations
    /// via the service's event dispatcher.
    fn deliver(&self, event: CacheEvent) {
        let matching = self.listeners.lock().unwrap().matching(&event);
        if matching.is_empty() {
            return;
        }

        let log = self.log.clone();
        self.connection.runtime().dispatcher().post(move || {
            for (listener, lite) in &matching {
                let delivered = if *lite { event.lightened() } else { event.clone() };
                if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&delivered))).is_err() {
                    logging::error!(log, "cache listener panicked; skipping to the next listener";
                                    "key" => delivered.key.to_string());
                }
            }
        });
    }
}

/// Receiver for the named-cache back channel: the only unsolicited traffic is
/// map events.
struct CacheEventReceiver {
    state: Arc<RemoteCacheState>,
}

impl Receiver for CacheEventReceiver {
    fn on_message(&mut self, message: Box<dyn Message>, _ctx: &mut dyn ReceiverContext) {
        if message.type_id() != MapEventMessage::TYPE_ID {
            logging::warn!(self.state.log, "unexpected unsolicited message on cache channel";
                           "type" => message.type_name());
            return;
        }

        let envelope = match downcast::<Envelope<MapEventMessage>>(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                logging::warn!(self.state.log, "undecodable map event"; "cause" => err.to_string());
                return;
            }
        };
        let raw = envelope.body;

        let (kind, cause) = match (EventKind::from_u8(raw.kind), EventCause::from_u8(raw.cause)) {
            (Ok(kind), Ok(cause)) => (kind, cause),
            _ => {
                logging::warn!(self.state.log, "map event with invalid kind or cause");
                return;
            }
        };

        self.state.deliver(CacheEvent {
            cache: self.state.cache_name.clone(),
            kind,
            key: raw.key,
            old: raw.old.into_option(),
            new: raw.new.into_option(),
            cause,
            lite: raw.lite,
        });
    }
}

fn unwrap_response(message: Box<dyn Message>) -> Result<Value> {
    downcast::<Envelope<Response>>(message)?.body.into_result()
}

/// A named cache living on the grid, addressed through its back channel.
pub struct RemoteNamedCache {
    state: Arc<RemoteCacheState>,
    channel: ChannelHandle,
}

impl RemoteNamedCache {
    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    fn call<T: Body>(&self, body: T) -> Result<Value> {
        let response = self.channel.request(Envelope::boxed(body), 0)?;
        unwrap_response(response)
    }

    fn call_bool(&self, result: Value) -> Result<bool> {
        match result {
            Value::Bool(flag) => Ok(flag),
            other => Err(Error::Protocol(format!("expected a boolean result, got {}", other))),
        }
    }
}

impl NamedCache for RemoteNamedCache {
    fn name(&self) -> &str {
        &self.state.cache_name
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        Ok(self.call(GetRequest { key: key.clone() })?.into_option())
    }

    fn put_with_expiry(&self, key: Value, value: Value, expiry_millis: i64) -> Result<Option<Value>> {
        let result = self.call(PutRequest {
            key,
            value,
            expiry_millis,
            return_old: true,
        })?;
        Ok(result.into_option())
    }

    fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        self.call(PutAllRequest { entries })?;
        Ok(())
    }

    fn get_all(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>> {
        pairs_from_value(self.call(GetAllRequest { keys: keys.to_vec() })?)
    }

    fn remove(&self, key: &Value) -> Result<Option<Value>> {
        Ok(self.call(RemoveRequest { key: key.clone() })?.into_option())
    }

    fn contains_key(&self, key: &Value) -> Result<bool> {
        let result = self.call(ContainsKeyRequest { key: key.clone() })?;
        self.call_bool(result)
    }

    fn len(&self) -> Result<usize> {
        match self.call(SizeRequest)? {
            Value::Long(len) if len >= 0 => Ok(len as usize),
            other => Err(Error::Protocol(format!("expected a size, got {}", other))),
        }
    }

    fn clear(&self) -> Result<()> {
        self.call(ClearRequest)?;
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        self.call(TruncateRequest)?;
        Ok(())
    }

    fn keys(&self, filter: &Filter) -> Result<Vec<Value>> {
        values_from_value(self.call(QueryRequest {
            shape: QUERY_KEYS,
            filter: filter.to_value(),
            comparator: None,
        })?)
    }

    fn entries(&self, filter: &Filter) -> Result<Vec<(Value, Value)>> {
        pairs_from_value(self.call(QueryRequest {
            shape: QUERY_ENTRIES,
            filter: filter.to_value(),
            comparator: None,
        })?)
    }

    fn values(&self, filter: &Filter, comparator: Option<&Comparator>) -> Result<Vec<Value>> {
        values_from_value(self.call(QueryRequest {
            shape: QUERY_VALUES,
            filter: filter.to_value(),
            comparator: comparator.map(|comparator| comparator.name().to_string()),
        })?)
    }

    fn invoke(&self, key: &Value, processor: &Processor) -> Result<Value> {
        self.call(InvokeRequest {
            key: key.clone(),
            processor: processor.to_value(),
        })
    }

    fn invoke_all_keys(&self, keys: &[Value], processor: &Processor) -> Result<Vec<(Value, Value)>> {
        pairs_from_value(self.call(InvokeAllRequest {
            by_filter: false,
            keys: keys.to_vec(),
            filter: Filter::Always.to_value(),
            processor: processor.to_value(),
        })?)
    }

    fn invoke_all(&self, filter: &Filter, processor: &Processor) -> Result<Vec<(Value, Value)>> {
        pairs_from_value(self.call(InvokeAllRequest {
            by_filter: true,
            keys: Vec::new(),
            filter: filter.to_value(),
            processor: processor.to_value(),
        })?)
    }

    fn aggregate(&self, filter: &Filter, aggregator: &Aggregator) -> Result<Value> {
        self.call(AggregateRequest {
            filter: filter.to_value(),
            aggregator: aggregator.to_value(),
        })
    }

    fn add_index(&self, extractor: &Extractor, ordered: bool, comparator: Option<Comparator>) -> Result<()> {
        self.call(AddIndexRequest {
            extractor: extractor.to_value(),
            ordered,
            comparator: comparator.map(|comparator| comparator.name().to_string()),
        })?;
        Ok(())
    }

    fn remove_index(&self, extractor: &Extractor) -> Result<()> {
        self.call(RemoveIndexRequest {
            extractor: extractor.to_value(),
        })?;
        Ok(())
    }

    fn add_listener(&self, scope: ListenerScope, listener: Arc<dyn CacheListener>, lite: bool) -> Result<ListenerId> {
        let id = self.state.listeners.lock().unwrap().add(scope.clone(), listener, lite);

        match self.call(AddListenerRequest {
            scope: scope.to_value(),
            lite,
            listener_id: id.0,
        }) {
            Ok(_) => Ok(id),
            Err(err) => {
                self.state.listeners.lock().unwrap().remove(id);
                Err(err)
            }
        }
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.state.listeners.lock().unwrap().remove(id);
        self.call(RemoveListenerRequest { listener_id: id.0 })?;
        Ok(())
    }

    fn lock(&self, key: &Value, wait_millis: i64) -> Result<bool> {
        let result = self.call(LockRequest {
            key: key.clone(),
            wait_millis,
        })?;
        self.call_bool(result)
    }

    fn unlock(&self, key: &Value) -> Result<()> {
        self.call(UnlockRequest { key: key.clone() })?;
        Ok(())
    }
}
