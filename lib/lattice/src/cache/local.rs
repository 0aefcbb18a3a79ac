//! The in-process cache engine. Its observable contracts — sizing, expiry,
//! eviction, listener semantics, index coherence, processors, aggregators,
//! locking — deliberately match the remote cache, so application code can
//! hold either behind `NamedCache` without caring which.

use crate::cache::aggregator::Aggregator;
use crate::cache::eviction::{EvictionCandidate, EvictionPolicy, UnitCalculator};
use crate::cache::extractor::Extractor;
use crate::cache::filter::Filter;
use crate::cache::index::CacheIndex;
use crate::cache::listener::{
    CacheEvent, CacheListener, EventCause, EventKind, ListenerId, ListenerRegistry, ListenerScope,
};
use crate::cache::lock::LockTable;
use crate::cache::processor::{EntryView, Processor};
use crate::cache::{Comparator, NamedCache, EXPIRY_DEFAULT};
use crate::config::{CacheConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::service::dispatcher::EventDispatcher;
use crate::value::Value;
use hashbrown::HashMap;
use photon::logging;
use photon::time::{system_time_source, timestamp_millis, TimeSource};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NEVER_EXPIRES: u64 = u64::max_value();

/// Hit/miss and churn counters, reset together.
pub struct CacheStatistics {
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
    expiries: AtomicU64,
    reset_at: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expiries: u64,
    pub reset_at: u64,
}

impl CacheStatistics {
    fn new() -> CacheStatistics {
        CacheStatistics {
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expiries: AtomicU64::new(0),
            reset_at: AtomicU64::new(timestamp_millis()),
        }
    }

    pub fn reset(&self) {
        self.gets.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.removes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expiries.store(0, Ordering::Relaxed);
        self.reset_at.store(timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expiries: self.expiries.load(Ordering::Relaxed),
            reset_at: self.reset_at.load(Ordering::Relaxed),
        }
    }
}

struct EntryData {
    value: Value,
    inserted_at: u64,
    last_access_at: u64,
    touch_count: u64,
    expires_at: u64,
    units: u64,
}

struct Store {
    entries: HashMap<Value, EntryData>,
    indexes: Vec<CacheIndex>,
    total_units: u64,
    high_units: u64,
    low_units: u64,
    default_expiry: u64,
    policy: EvictionPolicy,
    calculator: UnitCalculator,
    /// Earliest expiry deadline across live entries; sweeps are skipped until
    /// the clock reaches it.
    next_expiry: u64,
}

impl Store {
    fn expires_at(&self, now: u64, expiry_millis: i64) -> u64 {
        if expiry_millis == EXPIRY_DEFAULT {
            match self.default_expiry {
                0 => NEVER_EXPIRES,
                default => now + default,
            }
        } else if expiry_millis < 0 {
            NEVER_EXPIRES
        } else {
            now + expiry_millis as u64
        }
    }

    fn sweep_expired(&mut self, cache: &str, now: u64, events: &mut Vec<CacheEvent>) {
        if now < self.next_expiry {
            return;
        }

        let expired: Vec<Value> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.total_units -= entry.units;
                for index in &mut self.indexes {
                    index.delete(&key, &entry.value);
                }
                events.push(CacheEvent {
                    cache: cache.to_string(),
                    kind: EventKind::Deleted,
                    key,
                    old: Some(entry.value),
                    new: None,
                    cause: EventCause::Expired,
                    lite: false,
                });
            }
        }

        self.recompute_next_expiry();
    }

    fn recompute_next_expiry(&mut self) {
        self.next_expiry = self
            .entries
            .values()
            .map(|entry| entry.expires_at)
            .min()
            .unwrap_or(NEVER_EXPIRES);
    }

    fn apply_put(
        &mut self,
        cache: &str,
        key: Value,
        value: Value,
        now: u64,
        expires_at: u64,
        events: &mut Vec<CacheEvent>,
    ) -> Option<Value> {
        let units = self.calculator.units(&key, &value);

        let old = if let Some(entry) = self.entries.get_mut(&key) {
            let old = std::mem::replace(&mut entry.value, value.clone());
            let old_units = entry.units;
            entry.last_access_at = now;
            entry.touch_count += 1;
            entry.expires_at = expires_at;
            entry.units = units;
            self.total_units = self.total_units - old_units + units;
            Some(old)
        } else {
            self.entries.insert(
                key.clone(),
                EntryData {
                    value: value.clone(),
                    inserted_at: now,
                    last_access_at: now,
                    touch_count: 1,
                    expires_at,
                    units,
                },
            );
            self.total_units += units;
            None
        };

        for index in &mut self.indexes {
            if old.is_some() {
                index.update(&key, &value);
            } else {
                index.insert(&key, &value);
            }
        }

        if expires_at < self.next_expiry {
            self.next_expiry = expires_at;
        }

        events.push(CacheEvent {
            cache: cache.to_string(),
            kind: if old.is_some() { EventKind::Updated } else { EventKind::Inserted },
            key,
            old: old.clone(),
            new: Some(value),
            cause: EventCause::Regular,
            lite: false,
        });

        old
    }

    fn apply_remove(&mut self, cache: &str, key: &Value, events: &mut Vec<CacheEvent>) -> Option<Value> {
        let entry = self.entries.remove(key)?;
        self.total_units -= entry.units;

        for index in &mut self.indexes {
            index.delete(key, &entry.value);
        }

        events.push(CacheEvent {
            cache: cache.to_string(),
            kind: EventKind::Deleted,
            key: key.clone(),
            old: Some(entry.value.clone()),
            new: None,
            cause: EventCause::Regular,
            lite: false,
        });

        Some(entry.value)
    }

    /// Prunes lowest-scoring entries until the cache is back at or under its
    /// low-water mark. Runs synchronously inside the mutating call.
    fn shrink(&mut self, cache: &str, events: &mut Vec<CacheEvent>) {
        if self.high_units == 0 || self.total_units <= self.high_units {
            return;
        }

        let policy = &self.policy;
        let mut scored: Vec<(u64, Value)> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let candidate = EvictionCandidate {
                    key,
                    value: &entry.value,
                    inserted_at: entry.inserted_at,
                    last_access_at: entry.last_access_at,
                    touch_count: entry.touch_count,
                    units: entry.units,
                };
                (policy.score(&candidate), key.clone())
            })
            .collect();

        scored.sort_by(|(score_a, key_a), (score_b, key_b)| {
            score_a.cmp(score_b).then_with(|| key_a.cmp_order(key_b))
        });

        for (_, key) in scored {
            if self.total_units <= self.low_units {
                break;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.total_units -= entry.units;
                for index in &mut self.indexes {
                    index.delete(&key, &entry.value);
                }
                events.push(CacheEvent {
                    cache: cache.to_string(),
                    kind: EventKind::Deleted,
                    key,
                    old: Some(entry.value),
                    new: None,
                    cause: EventCause::Evicted,
                    lite: false,
                });
            }
        }

        self.recompute_next_expiry();
    }
}

struct CacheInner {
    name: String,
    store: Mutex<Store>,
    locks: LockTable,
    listeners: Mutex<ListenerRegistry>,
    dispatcher: EventDispatcher,
    stats: CacheStatistics,
    time: Arc<dyn TimeSource>,
    log: logging::Logger,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.dispatcher.shutdown(Duration::from_secs(1));
    }
}

/// A single-process named cache.
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
}

impl LocalCache {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        config: CacheConfig,
        log: L,
    ) -> Result<LocalCache> {
        let policy = EvictionPolicy::parse(&config.eviction_policy)?;
        let calculator = UnitCalculator::parse(&config.unit_calculator)?;
        Ok(Self::assemble(name, config, policy, calculator, system_time_source(), log))
    }

    /// Full-control constructor: explicit policy, calculator and time source.
    pub fn with_parts<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        config: CacheConfig,
        policy: EvictionPolicy,
        calculator: UnitCalculator,
        time: Arc<dyn TimeSource>,
        log: L,
    ) -> LocalCache {
        Self::assemble(name, config, policy, calculator, time, log)
    }

    fn assemble<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        config: CacheConfig,
        policy: EvictionPolicy,
        calculator: UnitCalculator,
        time: Arc<dyn TimeSource>,
        log: L,
    ) -> LocalCache {
        let log = logging::child(log, logging::o!("cache" => name.to_string()));
        let service_defaults = ServiceConfig::default();
        let dispatcher = EventDispatcher::new(
            name,
            service_defaults.clogged_count,
            service_defaults.clogged_delay_millis,
            &log,
        );
        dispatcher.start();

        LocalCache {
            inner: Arc::new(CacheInner {
                name: name.to_string(),
                store: Mutex::new(Store {
                    entries: HashMap::new(),
                    indexes: Vec::new(),
                    total_units: 0,
                    high_units: config.high_units,
                    low_units: config.low_units(),
                    default_expiry: config.expiry_millis,
                    policy,
                    calculator,
                    next_expiry: NEVER_EXPIRES,
                }),
                locks: LockTable::new(),
                listeners: Mutex::new(ListenerRegistry::new()),
                dispatcher,
                stats: CacheStatistics::new(),
                time,
                log,
            }),
        }
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    /// Current total unit cost of live entries.
    pub fn total_units(&self) -> u64 {
        self.inner.store.lock().unwrap().total_units
    }

    /// Acquires the all-entries lock.
    pub fn lock_all(&self, wait_millis: i64) -> bool {
        self.inner.locks.lock_all(wait_millis)
    }

    pub fn unlock_all(&self) {
        self.inner.locks.unlock_all()
    }

    /// Builds a conditional index: entries rejected by `filter` stay out of
    /// the index and mark it partial.
    pub fn add_filtered_index(&self, extractor: &Extractor, filter: Filter, ordered: bool) -> Result<()> {
        let mut store = self.inner.store.lock().unwrap();
        store.indexes.retain(|index| index.extractor() != extractor);

        let mut index = CacheIndex::conditional(extractor.clone(), filter, ordered);
        for (key, entry) in store.entries.iter() {
            index.insert(key, &entry.value);
        }
        store.indexes.push(index);
        Ok(())
    }

    /// Inverse-map contents for one indexed value, primarily for assertions
    /// and diagnostics.
    pub fn index_inverse(&self, extractor: &Extractor, value: &Value) -> Option<Vec<Value>> {
        let store = self.inner.store.lock().unwrap();
        store
            .indexes
            .iter()
            .find(|index| index.extractor() == extractor)
            .map(|index| {
                index
                    .keys_equal(value)
                    .map(|keys| keys.iter().cloned().collect())
                    .unwrap_or_default()
            })
    }

    pub fn is_index_partial(&self, extractor: &Extractor) -> Option<bool> {
        let store = self.inner.store.lock().unwrap();
        store
            .indexes
            .iter()
            .find(|index| index.extractor() == extractor)
            .map(CacheIndex::is_partial)
    }

    /// Removes everything without raising events. Backs the remote truncate;
    /// the local `truncate` contract itself is unsupported.
    pub(crate) fn wipe(&self) {
        let mut store = self.inner.store.lock().unwrap();
        store.entries.clear();
        store.total_units = 0;
        store.next_expiry = NEVER_EXPIRES;
        for index in &mut store.indexes {
            index.clear();
        }
    }

    fn now(&self) -> u64 {
        self.inner.time.monotonic_millis()
    }

    /// Counts churn and hands events to the dispatcher. Mutation locks are
    /// already released by the time this runs.
    fn finish(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }

        for event in &events {
            if event.kind == EventKind::Deleted {
                match event.cause {
                    EventCause::Evicted => {
                        self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    EventCause::Expired => {
                        self.inner.stats.expiries.fetch_add(1, Ordering::Relaxed);
                    }
                    EventCause::Regular => (),
                }
            }
        }

        let registry = self.inner.listeners.lock().unwrap();
        if registry.is_empty() {
            return;
        }

        for event in events {
            let matching = registry.matching(&event);
            if matching.is_empty() {
                continue;
            }

            let log = self.inner.log.clone();
            self.inner.dispatcher.post(move || {
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

    fn query_entries(&self, filter: &Filter) -> Result<Vec<(Value, Value)>> {
        let mut events = Vec::new();
        let result = {
            let mut store = self.inner.store.lock().unwrap();
            store.sweep_expired(&self.inner.name, self.now(), &mut events);

            match filter.index_lookup(&store.indexes) {
                Some(candidates) => candidates
                    .into_iter()
                    .filter_map(|key| {
                        store
                            .entries
                            .get(&key)
                            .map(|entry| (key.clone(), entry.value.clone()))
                    })
                    .collect(),
                None => {
                    let mut selected = Vec::new();
                    for (key, entry) in store.entries.iter() {
                        if filter.evaluate(key, &entry.value)? {
                            selected.push((key.clone(), entry.value.clone()));
                        }
                    }
                    selected
                }
            }
        };
        self.finish(events);
        Ok(result)
    }
}

impl NamedCache for LocalCache {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        let mut events = Vec::new();
        let result = {
            let mut store = self.inner.store.lock().unwrap();
            let now = self.now();
            store.sweep_expired(&self.inner.name, now, &mut events);

            store.entries.get_mut(key).map(|entry| {
                entry.last_access_at = now;
                entry.touch_count += 1;
                entry.value.clone()
            })
        };

        self.inner.stats.gets.fetch_add(1, Ordering::Relaxed);
        if result.is_some() {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.finish(events);
        Ok(result)
    }

    fn put_with_expiry(&self, key: Value, value: Value, expiry_millis: i64) -> Result<Option<Value>> {
        self.inner.locks.guard_mutation();

        let mut events = Vec::new();
        let old = {
            let mut store = self.inner.store.lock().unwrap();
            let now = self.now();
            store.sweep_expired(&self.inner.name, now, &mut events);

            let expires_at = store.expires_at(now, expiry_millis);
            let old = store.apply_put(&self.inner.name, key, value, now, expires_at, &mut events);
            store.shrink(&self.inner.name, &mut events);
            old
        };

        self.inner.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.finish(events);
        Ok(old)
    }

    fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.put_with_expiry(key, value, EXPIRY_DEFAULT)?;
        }
        Ok(())
    }

    fn get_all(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>> {
        let mut present = Vec::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                present.push((key.clone(), value));
            }
        }
        Ok(present)
    }

    fn remove(&self, key: &Value) -> Result<Option<Value>> {
        self.inner.locks.guard_mutation();

        let mut events = Vec::new();
        let old = {
            let mut store = self.inner.store.lock().unwrap();
            store.sweep_expired(&self.inner.name, self.now(), &mut events);
            store.apply_remove(&self.inner.name, key, &mut events)
        };

        self.inner.stats.removes.fetch_add(1, Ordering::Relaxed);
        self.finish(events);
        Ok(old)
    }

    fn contains_key(&self, key: &Value) -> Result<bool> {
        let mut events = Vec::new();
        let present = {
            let mut store = self.inner.store.lock().unwrap();
            store.sweep_expired(&self.inner.name, self.now(), &mut events);
            store.entries.contains_key(key)
        };
        self.finish(events);
        Ok(present)
    }

    fn len(&self) -> Result<usize> {
        let mut events = Vec::new();
        let len = {
            let mut store = self.inner.store.lock().unwrap();
            store.sweep_expired(&self.inner.name, self.now(), &mut events);
            store.entries.len()
        };
        self.finish(events);
        Ok(len)
    }

    fn clear(&self) -> Result<()> {
        self.inner.locks.guard_mutation();

        let mut events = Vec::new();
        {
            let mut store = self.inner.store.lock().unwrap();
            let keys: Vec<Value> = store.entries.keys().cloned().collect();
            for key in keys {
                store.apply_remove(&self.inner.name, &key, &mut events);
            }
            store.next_expiry = NEVER_EXPIRES;
        }

        self.finish(events);
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        Err(Error::Unsupported("truncate on a local cache"))
    }

    fn keys(&self, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self.query_entries(filter)?.into_iter().map(|(key, _)| key).collect())
    }

    fn entries(&self, filter: &Filter) -> Result<Vec<(Value, Value)>> {
        self.query_entries(filter)
    }

    fn values(&self, filter: &Filter, comparator: Option<&Comparator>) -> Result<Vec<Value>> {
        let mut values: Vec<Value> = self
            .query_entries(filter)?
            .into_iter()
            .map(|(_, value)| value)
            .collect();

        match comparator {
            Some(comparator) => values.sort_by(|a, b| comparator.compare(a, b)),
            None => values.sort_by(Value::cmp_order),
        }
        Ok(values)
    }

    fn invoke(&self, key: &Value, processor: &Processor) -> Result<Value> {
        self.inner.locks.lock_key(key, -1);
        let result = self.invoke_under_lock(key, processor);
        self.inner.locks.unlock_key(key);
        result
    }

    fn invoke_all_keys(&self, keys: &[Value], processor: &Processor) -> Result<Vec<(Value, Value)>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push((key.clone(), self.invoke(key, processor)?));
        }
        Ok(results)
    }

    fn invoke_all(&self, filter: &Filter, processor: &Processor) -> Result<Vec<(Value, Value)>> {
        let keys = self.keys(filter)?;
        self.invoke_all_keys(&keys, processor)
    }

    fn aggregate(&self, filter: &Filter, aggregator: &Aggregator) -> Result<Value> {
        let entries = self.query_entries(filter)?;

        let mut accumulator = aggregator.begin();
        accumulator.init(true);
        for (_, value) in &entries {
            accumulator.process(value, true)?;
        }
        accumulator.finalize(true)
    }

    fn add_index(&self, extractor: &Extractor, ordered: bool, comparator: Option<Comparator>) -> Result<()> {
        let mut store = self.inner.store.lock().unwrap();
        store.indexes.retain(|index| index.extractor() != extractor);

        let mut index = CacheIndex::new(extractor.clone(), ordered, comparator);
        for (key, entry) in store.entries.iter() {
            index.insert(key, &entry.value);
        }
        store.indexes.push(index);
        Ok(())
    }

    fn remove_index(&self, extractor: &Extractor) -> Result<()> {
        let mut store = self.inner.store.lock().unwrap();
        store.indexes.retain(|index| index.extractor() != extractor);
        Ok(())
    }

    fn add_listener(&self, scope: ListenerScope, listener: Arc<dyn CacheListener>, lite: bool) -> Result<ListenerId> {
        Ok(self.inner.listeners.lock().unwrap().add(scope, listener, lite))
    }

    fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.inner.listeners.lock().unwrap().remove(id);
        Ok(())
    }

    fn lock(&self, key: &Value, wait_millis: i64) -> Result<bool> {
        Ok(self.inner.locks.lock_key(key, wait_millis))
    }

    fn unlock(&self, key: &Value) -> Result<()> {
        self.inner.locks.unlock_key(key);
        Ok(())
    }
}

impl LocalCache {
    /// Runs the processor with the key lease already held: materialize the
    /// entry view, run user code without any engine lock, then commit the net
    /// effect through the regular mutation paths so sizing, indices and
    /// events all apply.
    fn invoke_under_lock(&self, key: &Value, processor: &Processor) -> Result<Value> {
        let mut events = Vec::new();
        let current = {
            let mut store = self.inner.store.lock().unwrap();
            store.sweep_expired(&self.inner.name, self.now(), &mut events);
            store.entries.get(key).map(|entry| entry.value.clone())
        };
        self.finish(events);

        let was_present = current.is_some();
        let mut view = EntryView::new(key.clone(), current);
        let result = processor.apply(&mut view)?;
        let (value, mutated) = view.into_effect();

        if mutated {
            match value {
                Some(value) => {
                    self.put_with_expiry(key.clone(), value, EXPIRY_DEFAULT)?;
                }
                None => {
                    if was_present {
                        self.remove(key)?;
                    }
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::external;
    use crate::cache::EXPIRY_NEVER;
    use photon::time::ManualTimeSource;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::thread;
    use std::time::Instant;

    struct Recorder {
        events: Mutex<Vec<CacheEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<CacheEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Polls until at least `count` events arrived from the dispatcher.
        fn await_events(&self, count: usize) -> Vec<CacheEvent> {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                if Instant::now() >= deadline {
                    panic!("Expected {} events, saw {:?}", count, events);
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    impl CacheListener for Recorder {
        fn on_event(&self, event: &CacheEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn sized_lru(high_units: u64, prune_level: f64, time: Arc<ManualTimeSource>) -> LocalCache {
        LocalCache::with_parts(
            "sized",
            CacheConfig {
                high_units,
                prune_level,
                eviction_policy: "lru".to_string(),
                ..CacheConfig::default()
            },
            EvictionPolicy::Lru,
            UnitCalculator::Fixed,
            time,
            None,
        )
    }

    fn plain(name: &str) -> LocalCache {
        LocalCache::new(name, CacheConfig::default(), None).unwrap()
    }

    fn sorted_keys(cache: &LocalCache) -> Vec<Value> {
        let mut keys = cache.keys(&Filter::Always).unwrap();
        keys.sort_by(Value::cmp_order);
        keys
    }

    #[test]
    fn test_basic_crud() {
        let cache = plain("crud");

        assert_eq!(cache.put(Value::from("a"), Value::Int(1)).unwrap(), None);
        assert_eq!(
            cache.put(Value::from("a"), Value::Int(2)).unwrap(),
            Some(Value::Int(1))
        );
        assert_eq!(cache.get(&Value::from("a")).unwrap(), Some(Value::Int(2)));
        assert!(cache.contains_key(&Value::from("a")).unwrap());
        assert_eq!(cache.len().unwrap(), 1);

        assert_eq!(cache.remove(&Value::from("a")).unwrap(), Some(Value::Int(2)));
        assert_eq!(cache.get(&Value::from("a")).unwrap(), None);
        assert_eq!(cache.remove(&Value::from("a")).unwrap(), None);
    }

    #[test]
    fn test_bulk_operations() {
        let cache = plain("bulk");

        cache
            .put_all(vec![
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
                (Value::from("c"), Value::Int(3)),
            ])
            .unwrap();

        let present = cache
            .get_all(&[Value::from("a"), Value::from("nope"), Value::from("c")])
            .unwrap();
        assert_eq!(
            present,
            vec![(Value::from("a"), Value::Int(1)), (Value::from("c"), Value::Int(3))]
        );

        cache.clear().unwrap();
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_truncate_unsupported() {
        let cache = plain("truncate");
        assert_eq!(cache.truncate().unwrap_err(), Error::Unsupported("truncate on a local cache"));
    }

    // Scenario: highUnits=3, pruneLevel=1.0, LRU; inserting a..d evicts a.
    #[test]
    fn test_lru_eviction_at_capacity() {
        let time = ManualTimeSource::new(0);
        let cache = sized_lru(3, 1.0, time.clone());

        let recorder = Recorder::new();
        cache.add_listener(ListenerScope::All, recorder.clone(), false).unwrap();

        for (name, number) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            cache.put(Value::from(name), Value::Int(number)).unwrap();
            time.advance(1);
        }

        assert_eq!(
            sorted_keys(&cache),
            vec![Value::from("b"), Value::from("c"), Value::from("d")]
        );
        assert_eq!(cache.total_units(), 3);

        let events = recorder.await_events(5);
        let evicted: Vec<&CacheEvent> = events
            .iter()
            .filter(|event| event.cause == EventCause::Evicted)
            .collect();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].kind, EventKind::Deleted);
        assert_eq!(evicted[0].key, Value::from("a"));
        assert_eq!(evicted[0].old, Some(Value::Int(1)));
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_lru_respects_recent_access() {
        let time = ManualTimeSource::new(0);
        let cache = sized_lru(3, 1.0, time.clone());

        for name in ["a", "b", "c"] {
            cache.put(Value::from(name), Value::Int(0)).unwrap();
            time.advance(1);
        }

        // Touching "a" makes "b" the eviction candidate.
        cache.get(&Value::from("a")).unwrap();
        time.advance(1);
        cache.put(Value::from("d"), Value::Int(0)).unwrap();

        assert_eq!(
            sorted_keys(&cache),
            vec![Value::from("a"), Value::from("c"), Value::from("d")]
        );
    }

    // Property: total units never exceed high water; a prune pass lands at or
    // under floor(high * prune_level).
    #[test]
    fn test_eviction_bound_invariant() {
        let time = ManualTimeSource::new(0);
        let cache = sized_lru(10, 0.75, time.clone());

        let mut previous = 0;
        let mut pruned = false;
        for i in 0..50 {
            cache.put(Value::Int(i), Value::Int(i)).unwrap();
            time.advance(1);

            let total = cache.total_units();
            assert!(total <= 10, "total {} exceeded high units after insert {}", total, i);
            if previous == 10 {
                // Breaching the high water prunes straight down to low units.
                assert_eq!(total, 7, "prune pass must land at floor(10 * 0.75)");
                pruned = true;
            }
            previous = total;
        }
        assert!(pruned);
    }

    #[test]
    fn test_binary_units_evict_large_entries() {
        let time = ManualTimeSource::new(0);
        let cache = LocalCache::with_parts(
            "binary",
            CacheConfig {
                high_units: 400,
                prune_level: 0.5,
                ..CacheConfig::default()
            },
            EvictionPolicy::Lru,
            UnitCalculator::Binary,
            time.clone(),
            None,
        );

        for i in 0..10 {
            cache
                .put(Value::Int(i), Value::Bytes(vec![0u8; 100]))
                .unwrap();
            time.advance(1);
        }

        assert!(cache.total_units() <= 400);
        assert!(cache.len().unwrap() < 10);
    }

    #[test]
    fn test_external_eviction_policy() {
        let time = ManualTimeSource::new(0);
        // Evict the largest Int key first, whatever the access pattern.
        let policy = EvictionPolicy::external(
            "largest-key-first",
            Arc::new(|candidate| match candidate.key {
                Value::Int(i) => u64::max_value() - *i as u64,
                _ => u64::max_value(),
            }),
        );
        let cache = LocalCache::with_parts(
            "external-policy",
            CacheConfig {
                high_units: 3,
                prune_level: 1.0,
                ..CacheConfig::default()
            },
            policy,
            UnitCalculator::Fixed,
            time.clone(),
            None,
        );

        for i in 1..=4 {
            cache.put(Value::Int(i), Value::Int(0)).unwrap();
            time.advance(1);
        }

        assert_eq!(
            sorted_keys(&cache),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    // Scenario: expiry=50ms; read at 30ms sees the value, read at 100ms sees
    // absence and an expiry event.
    #[test]
    fn test_expiry() {
        let time = ManualTimeSource::new(0);
        let cache = LocalCache::with_parts(
            "expiring",
            CacheConfig::default(),
            EvictionPolicy::Hybrid,
            UnitCalculator::Fixed,
            time.clone(),
            None,
        );

        let recorder = Recorder::new();
        cache.add_listener(ListenerScope::All, recorder.clone(), false).unwrap();

        cache
            .put_with_expiry(Value::from("x"), Value::Int(42), 50)
            .unwrap();

        time.set(30);
        assert_eq!(cache.get(&Value::from("x")).unwrap(), Some(Value::Int(42)));

        time.set(100);
        assert_eq!(cache.get(&Value::from("x")).unwrap(), None);

        let events = recorder.await_events(2);
        let expired = &events[1];
        assert_eq!(expired.kind, EventKind::Deleted);
        assert_eq!(expired.cause, EventCause::Expired);
        assert_eq!(expired.key, Value::from("x"));
        assert_eq!(expired.old, Some(Value::Int(42)));
        assert_eq!(cache.statistics().expiries, 1);
    }

    #[test]
    fn test_default_expiry_and_never() {
        let time = ManualTimeSource::new(0);
        let cache = LocalCache::with_parts(
            "default-expiry",
            CacheConfig {
                expiry_millis: 50,
                ..CacheConfig::default()
            },
            EvictionPolicy::Hybrid,
            UnitCalculator::Fixed,
            time.clone(),
            None,
        );

        cache.put(Value::from("default"), Value::Int(1)).unwrap();
        cache
            .put_with_expiry(Value::from("pinned"), Value::Int(2), EXPIRY_NEVER)
            .unwrap();
        cache
            .put_with_expiry(Value::from("long"), Value::Int(3), 500)
            .unwrap();

        time.set(100);
        assert_eq!(cache.get(&Value::from("default")).unwrap(), None);
        assert_eq!(cache.get(&Value::from("pinned")).unwrap(), Some(Value::Int(2)));
        assert_eq!(cache.get(&Value::from("long")).unwrap(), Some(Value::Int(3)));

        time.set(1_000);
        assert_eq!(cache.get(&Value::from("long")).unwrap(), None);
        assert_eq!(cache.get(&Value::from("pinned")).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn test_expired_entries_invisible_to_queries_and_len() {
        let time = ManualTimeSource::new(0);
        let cache = LocalCache::with_parts(
            "expiry-queries",
            CacheConfig::default(),
            EvictionPolicy::Hybrid,
            UnitCalculator::Fixed,
            time.clone(),
            None,
        );

        cache.put_with_expiry(Value::from("a"), Value::Int(1), 10).unwrap();
        cache.put(Value::from("b"), Value::Int(2)).unwrap();

        time.set(50);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.keys(&Filter::Always).unwrap(), vec![Value::from("b")]);
        assert!(!cache.contains_key(&Value::from("a")).unwrap());
    }

    // Scenario: identity index; keys(value == 2) via the index, kept coherent
    // across removal.
    #[test]
    fn test_filtered_query_with_index() {
        let cache = plain("indexed");

        cache
            .put_all(vec![
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
                (Value::from("c"), Value::Int(3)),
                (Value::from("d"), Value::Int(2)),
            ])
            .unwrap();

        cache.add_index(&Extractor::Identity, false, None).unwrap();

        let filter = Filter::value_equals(Value::Int(2));
        let mut keys = cache.keys(&filter).unwrap();
        keys.sort_by(Value::cmp_order);
        assert_eq!(keys, vec![Value::from("b"), Value::from("d")]);

        cache.remove(&Value::from("b")).unwrap();

        assert_eq!(cache.keys(&filter).unwrap(), vec![Value::from("d")]);
        assert_eq!(
            cache.index_inverse(&Extractor::Identity, &Value::Int(2)).unwrap(),
            vec![Value::from("d")]
        );
    }

    #[test]
    fn test_index_query_matches_scan_under_random_churn() {
        let cache = plain("churn");
        cache.add_index(&Extractor::Identity, false, None).unwrap();

        let mut rng = StdRng::seed_from_u64(12);
        let mut shadow: HashMap<i32, i32> = HashMap::new();

        for _ in 0..500 {
            let key = rng.gen_range(0..20);
            if rng.gen_bool(0.3) {
                cache.remove(&Value::Int(key)).unwrap();
                shadow.remove(&key);
            } else {
                let value = rng.gen_range(0..5);
                cache.put(Value::Int(key), Value::Int(value)).unwrap();
                shadow.insert(key, value);
            }
        }

        for value in 0..5 {
            let mut expected: Vec<Value> = shadow
                .iter()
                .filter(|(_, v)| **v == value)
                .map(|(k, _)| Value::Int(*k))
                .collect();
            expected.sort_by(Value::cmp_order);

            let mut indexed = cache
                .index_inverse(&Extractor::Identity, &Value::Int(value))
                .unwrap();
            indexed.sort_by(Value::cmp_order);
            assert_eq!(indexed, expected, "inverse set diverged for value {}", value);

            let mut queried = cache.keys(&Filter::value_equals(Value::Int(value))).unwrap();
            queried.sort_by(Value::cmp_order);
            assert_eq!(queried, expected, "query diverged for value {}", value);
        }
    }

    #[test]
    fn test_conditional_index_is_ignored_by_planner() {
        let cache = plain("conditional");

        cache.put(Value::from("a"), Value::Int(1)).unwrap();
        cache.put(Value::from("b"), Value::Int(2)).unwrap();

        cache
            .add_filtered_index(&Extractor::Identity, Filter::value_equals(Value::Int(2)), false)
            .unwrap();
        assert_eq!(cache.is_index_partial(&Extractor::Identity), Some(true));

        // The partial index cannot answer this; the scan still can.
        let keys = cache.keys(&Filter::value_equals(Value::Int(1))).unwrap();
        assert_eq!(keys, vec![Value::from("a")]);
    }

    #[test]
    fn test_values_sorted() {
        let cache = plain("sorted");
        cache
            .put_all(vec![
                (Value::from("a"), Value::Int(3)),
                (Value::from("b"), Value::Int(1)),
                (Value::from("c"), Value::Int(2)),
            ])
            .unwrap();

        assert_eq!(
            cache.values(&Filter::Always, None).unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );

        external::register_comparator("descending", Arc::new(|a, b| b.cmp_order(a)));
        let reverse = Comparator::external("descending").unwrap();
        assert_eq!(
            cache.values(&Filter::Always, Some(&reverse)).unwrap(),
            vec![Value::Int(3), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn test_listener_modes_and_lite() {
        let cache = plain("listeners");

        let global = Recorder::new();
        let keyed = Recorder::new();
        let filtered = Recorder::new();
        let lite = Recorder::new();

        cache.add_listener(ListenerScope::All, global.clone(), false).unwrap();
        cache
            .add_listener(ListenerScope::Key(Value::from("a")), keyed.clone(), false)
            .unwrap();
        cache
            .add_listener(
                ListenerScope::Filter(Filter::value_equals(Value::Int(2))),
                filtered.clone(),
                false,
            )
            .unwrap();
        cache.add_listener(ListenerScope::All, lite.clone(), true).unwrap();

        cache.put(Value::from("a"), Value::Int(1)).unwrap();
        cache.put(Value::from("b"), Value::Int(2)).unwrap();
        cache.remove(&Value::from("a")).unwrap();

        let global_events = global.await_events(3);
        assert_eq!(global_events.len(), 3);
        assert_eq!(global_events[0].kind, EventKind::Inserted);
        assert_eq!(global_events[0].new, Some(Value::Int(1)));
        assert_eq!(global_events[2].kind, EventKind::Deleted);
        assert_eq!(global_events[2].old, Some(Value::Int(1)));

        let keyed_events = keyed.await_events(2);
        assert!(keyed_events.iter().all(|event| event.key == Value::from("a")));

        let filtered_events = filtered.await_events(1);
        assert_eq!(filtered_events.len(), 1);
        assert_eq!(filtered_events[0].key, Value::from("b"));

        let lite_events = lite.await_events(3);
        assert!(lite_events.iter().all(|event| event.lite && event.old.is_none() && event.new.is_none()));
    }

    // Property: events for one key arrive in mutation commit order.
    #[test]
    fn test_listener_ordering_per_key() {
        let cache = plain("ordering");
        let recorder = Recorder::new();
        cache
            .add_listener(ListenerScope::Key(Value::from("k")), recorder.clone(), false)
            .unwrap();

        for i in 0..50 {
            cache.put(Value::from("k"), Value::Int(i)).unwrap();
        }

        let events = recorder.await_events(50);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.new, Some(Value::Int(i as i32)));
            if i == 0 {
                assert_eq!(event.kind, EventKind::Inserted);
            } else {
                assert_eq!(event.kind, EventKind::Updated);
                assert_eq!(event.old, Some(Value::Int(i as i32 - 1)));
            }
        }
    }

    #[test]
    fn test_listener_panic_does_not_starve_others() {
        let cache = plain("panicky");

        struct Grenade;
        impl CacheListener for Grenade {
            fn on_event(&self, _event: &CacheEvent) {
                panic!("listener bug");
            }
        }

        let survivor = Recorder::new();
        cache.add_listener(ListenerScope::All, Arc::new(Grenade), false).unwrap();
        cache.add_listener(ListenerScope::All, survivor.clone(), false).unwrap();

        cache.put(Value::from("a"), Value::Int(1)).unwrap();

        let events = survivor.await_events(1);
        assert_eq!(events[0].kind, EventKind::Inserted);
    }

    #[test]
    fn test_remove_listener_stops_delivery() {
        let cache = plain("deregister");
        let recorder = Recorder::new();
        let id = cache.add_listener(ListenerScope::All, recorder.clone(), false).unwrap();

        cache.put(Value::from("a"), Value::Int(1)).unwrap();
        recorder.await_events(1);

        cache.remove_listener(id).unwrap();
        cache.put(Value::from("b"), Value::Int(2)).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_invoke_processors() {
        let cache = plain("invoke");

        // Increment on an absent key starts from zero.
        assert_eq!(
            cache.invoke(&Value::from("n"), &Processor::increment(5)).unwrap(),
            Value::Long(5)
        );
        assert_eq!(
            cache.invoke(&Value::from("n"), &Processor::increment(-2)).unwrap(),
            Value::Long(3)
        );
        assert_eq!(cache.get(&Value::from("n")).unwrap(), Some(Value::Long(3)));

        // Put returns the old value as an option-list.
        let old = cache
            .invoke(&Value::from("n"), &Processor::put(Value::Long(10)))
            .unwrap();
        assert_eq!(old.into_option(), Some(Value::Long(3)));

        // Remove through a processor really removes.
        cache.invoke(&Value::from("n"), &Processor::Remove).unwrap();
        assert_eq!(cache.get(&Value::from("n")).unwrap(), None);
    }

    #[test]
    fn test_invoke_fires_single_event_after_commit() {
        let cache = plain("invoke-events");
        let recorder = Recorder::new();
        cache.add_listener(ListenerScope::All, recorder.clone(), false).unwrap();

        cache
            .invoke(&Value::from("k"), &Processor::put(Value::Int(1)))
            .unwrap();

        let events = recorder.await_events(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Inserted);
        assert_eq!(events[0].new, Some(Value::Int(1)));
    }

    #[test]
    fn test_invoke_all_with_filter() {
        let cache = plain("invoke-all");
        cache
            .put_all(vec![
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
                (Value::from("c"), Value::Int(2)),
            ])
            .unwrap();

        let results = cache
            .invoke_all(&Filter::value_equals(Value::Int(2)), &Processor::increment(10))
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| *result == Value::Long(12)));
        assert_eq!(cache.get(&Value::from("a")).unwrap(), Some(Value::Int(1)));
        assert_eq!(cache.get(&Value::from("b")).unwrap(), Some(Value::Long(12)));
    }

    #[test]
    fn test_aggregate() {
        let cache = plain("aggregate");
        cache
            .put_all(vec![
                (Value::from("a"), Value::Int(1)),
                (Value::from("b"), Value::Int(2)),
                (Value::from("c"), Value::Int(3)),
                (Value::from("d"), Value::Int(10)),
            ])
            .unwrap();

        assert_eq!(
            cache.aggregate(&Filter::Always, &Aggregator::Count).unwrap(),
            Value::Long(4)
        );
        assert_eq!(
            cache
                .aggregate(&Filter::Always, &Aggregator::LongSum(Extractor::Identity))
                .unwrap(),
            Value::Long(16)
        );

        let small = Filter::value_equals(Value::Int(10)).negate();
        assert_eq!(
            cache
                .aggregate(&small, &Aggregator::DoubleAverage(Extractor::Identity))
                .unwrap(),
            Value::Double(2.0)
        );
    }

    #[test]
    fn test_lock_surface() {
        let cache = plain("locks");
        let key = Value::from("k");

        assert!(cache.lock(&key, 0).unwrap());

        {
            let cache = cache.clone();
            let key = key.clone();
            let contender = thread::spawn(move || cache.lock(&key, 0).unwrap());
            assert!(!contender.join().unwrap());
        }

        // A non-holder unlock is silent and changes nothing.
        {
            let cache = cache.clone();
            let key = key.clone();
            let meddler = thread::spawn(move || {
                cache.unlock(&key).unwrap();
                cache.lock(&key, 0).unwrap()
            });
            assert!(!meddler.join().unwrap());
        }

        cache.unlock(&key).unwrap();
        {
            let cache = cache.clone();
            let contender = thread::spawn(move || cache.lock(&Value::from("k"), 0).unwrap());
            assert!(contender.join().unwrap());
        }
    }

    #[test]
    fn test_global_lock_blocks_mutation() {
        let cache = plain("global-lock");
        assert!(cache.lock_all(0));

        let blocked = {
            let cache = cache.clone();
            thread::spawn(move || {
                let started = Instant::now();
                cache.put(Value::from("k"), Value::Int(1)).unwrap();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(60));
        cache.unlock_all();

        assert!(blocked.join().unwrap() >= Duration::from_millis(40));
        assert_eq!(cache.get(&Value::from("k")).unwrap(), Some(Value::Int(1)));
    }

    #[test]
    fn test_statistics() {
        let cache = plain("stats");

        cache.put(Value::from("a"), Value::Int(1)).unwrap();
        cache.get(&Value::from("a")).unwrap();
        cache.get(&Value::from("missing")).unwrap();
        cache.remove(&Value::from("a")).unwrap();

        let stats = cache.statistics();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.removes, 1);

        cache.reset_statistics();
        assert_eq!(cache.statistics().gets, 0);
    }

    #[test]
    fn test_wipe_clears_without_events() {
        let cache = plain("wipe");
        let recorder = Recorder::new();

        cache.put(Value::from("a"), Value::Int(1)).unwrap();
        cache.add_index(&Extractor::Identity, false, None).unwrap();
        cache.add_listener(ListenerScope::All, recorder.clone(), false).unwrap();

        cache.wipe();

        assert_eq!(cache.len().unwrap(), 0);
        assert_eq!(cache.total_units(), 0);
        assert_eq!(
            cache.index_inverse(&Extractor::Identity, &Value::Int(1)).unwrap(),
            Vec::<Value>::new()
        );

        thread::sleep(Duration::from_millis(50));
        assert!(recorder.events().is_empty());
    }
}
