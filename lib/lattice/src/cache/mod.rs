//! The cache surface and the in-process cache engine. `NamedCache` is the
//! location-transparent contract: the local engine and the remote facade
//! implement identical observable semantics, so application code never cares
//! which one it holds.

pub mod aggregator;
pub mod external;
pub mod extractor;
pub mod filter;
pub mod index;
pub mod listener;
pub mod local;
pub mod lock;
pub mod processor;
pub mod eviction;

use crate::error::Result;
use crate::value::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub use crate::cache::aggregator::Aggregator;
pub use crate::cache::extractor::Extractor;
pub use crate::cache::filter::Filter;
pub use crate::cache::listener::{CacheEvent, CacheListener, EventCause, EventKind, ListenerId, ListenerScope};
pub use crate::cache::processor::{EntryView, Processor};

/// `expiry_millis` value selecting the cache-wide default.
pub const EXPIRY_DEFAULT: i64 = 0;
/// `expiry_millis` value disabling expiry for the entry.
pub const EXPIRY_NEVER: i64 = -1;

/// Named value ordering used by sorted queries and ordered indices. The name
/// travels on the wire; the function itself lives in the process (built-in
/// `natural`, or registered via `cache::external`).
#[derive(Clone)]
pub struct Comparator {
    name: String,
    compare: Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>,
}

impl Comparator {
    pub fn natural() -> Comparator {
        Comparator {
            name: "natural".to_string(),
            compare: Arc::new(Value::cmp_order),
        }
    }

    /// Resolves a registered external comparator by name.
    pub fn external(name: &str) -> Result<Comparator> {
        let compare = external::comparator(name)?;
        Ok(Comparator {
            name: name.to_string(),
            compare,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        (self.compare)(a, b)
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Comparator({})", self.name)
    }
}

/// The cache contract shared by the local engine and the remote facade.
pub trait NamedCache: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &Value) -> Result<Option<Value>>;

    /// Inserts or replaces, returning the previous value.
    fn put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.put_with_expiry(key, value, EXPIRY_DEFAULT)
    }

    fn put_with_expiry(&self, key: Value, value: Value, expiry_millis: i64) -> Result<Option<Value>>;

    fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()>;

    /// Returns the present entries among `keys`.
    fn get_all(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>>;

    fn remove(&self, key: &Value) -> Result<Option<Value>>;

    fn contains_key(&self, key: &Value) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn clear(&self) -> Result<()>;

    /// Removes every entry without raising events. Only the remote cache
    /// supports this.
    fn truncate(&self) -> Result<()>;

    fn keys(&self, filter: &Filter) -> Result<Vec<Value>>;

    fn entries(&self, filter: &Filter) -> Result<Vec<(Value, Value)>>;

    fn values(&self, filter: &Filter, comparator: Option<&Comparator>) -> Result<Vec<Value>>;

    /// Runs an entry processor against one key under its lock.
    fn invoke(&self, key: &Value, processor: &Processor) -> Result<Value>;

    fn invoke_all_keys(&self, keys: &[Value], processor: &Processor) -> Result<Vec<(Value, Value)>>;

    fn invoke_all(&self, filter: &Filter, processor: &Processor) -> Result<Vec<(Value, Value)>>;

    fn aggregate(&self, filter: &Filter, aggregator: &Aggregator) -> Result<Value>;

    fn add_index(&self, extractor: &Extractor, ordered: bool, comparator: Option<Comparator>) -> Result<()>;

    fn remove_index(&self, extractor: &Extractor) -> Result<()>;

    fn add_listener(&self, scope: ListenerScope, listener: Arc<dyn CacheListener>, lite: bool) -> Result<ListenerId>;

    fn remove_listener(&self, id: ListenerId) -> Result<()>;

    /// Acquires an exclusive lease on `key`. `wait_millis` of 0 returns
    /// immediately, negative waits indefinitely.
    fn lock(&self, key: &Value, wait_millis: i64) -> Result<bool>;

    /// Releases a lease. Silently does nothing if the caller is not the
    /// holder.
    fn unlock(&self, key: &Value) -> Result<()>;
}
