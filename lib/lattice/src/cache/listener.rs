//! Cache event model and listener registration. Delivery happens on the
//! event dispatcher thread in registration order; per-key event order follows
//! mutation commit order.

use crate::cache::filter::Filter;
use crate::error::{Error, Result};
use crate::value::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn to_u8(self) -> u8 {
        match self {
            EventKind::Inserted => 0,
            EventKind::Updated => 1,
            EventKind::Deleted => 2,
        }
    }

    pub fn from_u8(byte: u8) -> Result<EventKind> {
        match byte {
            0 => Ok(EventKind::Inserted),
            1 => Ok(EventKind::Updated),
            2 => Ok(EventKind::Deleted),
            other => Err(Error::Protocol(format!("invalid event kind {}", other))),
        }
    }
}

/// Why a deletion happened. Inserts and updates are always `Regular`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCause {
    Regular,
    Evicted,
    Expired,
}

impl EventCause {
    pub fn to_u8(self) -> u8 {
        match self {
            EventCause::Regular => 0,
            EventCause::Evicted => 1,
            EventCause::Expired => 2,
        }
    }

    pub fn from_u8(byte: u8) -> Result<EventCause> {
        match byte {
            0 => Ok(EventCause::Regular),
            1 => Ok(EventCause::Evicted),
            2 => Ok(EventCause::Expired),
            other => Err(Error::Protocol(format!("invalid event cause {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub cache: String,
    pub kind: EventKind,
    pub key: Value,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub cause: EventCause,
    /// True when the payloads were stripped for a lite listener.
    pub lite: bool,
}

impl CacheEvent {
    /// Copy of this event with the payloads dropped, as delivered to lite
    /// listeners.
    pub fn lightened(&self) -> CacheEvent {
        CacheEvent {
            cache: self.cache.clone(),
            kind: self.kind,
            key: self.key.clone(),
            old: None,
            new: None,
            cause: self.cause,
            lite: true,
        }
    }
}

pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

/// What a listener subscribes to.
#[derive(Debug, Clone)]
pub enum ListenerScope {
    All,
    Key(Value),
    Filter(Filter),
}

impl ListenerScope {
    /// A filter scope is evaluated against the event's new value, falling
    /// back to the old value for deletions.
    fn matches(&self, event: &CacheEvent) -> bool {
        match self {
            ListenerScope::All => true,
            ListenerScope::Key(key) => *key == event.key,
            ListenerScope::Filter(filter) => {
                let value = event.new.as_ref().or(event.old.as_ref());
                match value {
                    Some(value) => filter.evaluate(&event.key, value).unwrap_or(false),
                    None => false,
                }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ListenerScope::All => Value::List(vec![Value::from("all")]),
            ListenerScope::Key(key) => Value::List(vec![Value::from("key"), key.clone()]),
            ListenerScope::Filter(filter) => Value::List(vec![Value::from("filter"), filter.to_value()]),
        }
    }

    pub fn from_value(value: &Value) -> Result<ListenerScope> {
        let items = match value {
            Value::List(items) => items,
            _ => return Err(Error::Serialization("listener scope must be a tagged list".to_string())),
        };

        match items.first() {
            Some(Value::String(tag)) if tag == "all" => Ok(ListenerScope::All),
            Some(Value::String(tag)) if tag == "key" => match items.get(1) {
                Some(key) => Ok(ListenerScope::Key(key.clone())),
                None => Err(Error::Serialization("key scope missing its key".to_string())),
            },
            Some(Value::String(tag)) if tag == "filter" => match items.get(1) {
                Some(filter) => Ok(ListenerScope::Filter(Filter::from_value(filter)?)),
                None => Err(Error::Serialization("filter scope missing its filter".to_string())),
            },
            _ => Err(Error::Serialization("unknown listener scope tag".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

struct Registration {
    id: ListenerId,
    scope: ListenerScope,
    lite: bool,
    listener: Arc<dyn CacheListener>,
}

/// Listener registrations in registration order.
pub(crate) struct ListenerRegistry {
    next_id: u64,
    entries: Vec<Registration>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        ListenerRegistry {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, scope: ListenerScope, listener: Arc<dyn CacheListener>, lite: bool) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Registration {
            id,
            scope,
            lite,
            listener,
        });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Listeners interested in `event`, in registration order, with their
    /// lite flags.
    pub fn matching(&self, event: &CacheEvent) -> Vec<(Arc<dyn CacheListener>, bool)> {
        self.entries
            .iter()
            .filter(|entry| entry.scope.matches(event))
            .map(|entry| (entry.listener.clone(), entry.lite))
            .collect()
    }
}
