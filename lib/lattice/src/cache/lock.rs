//! Per-key lock leases for the local cache. A lease is owned by the
//! acquiring thread and is reentrant by its owner; a single all-entries lock
//! conflicts with every per-key lease and blocks mutation by non-holders.

use crate::value::Value;
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
struct Lease {
    owner: ThreadId,
    count: u32,
}

struct LockState {
    global: Option<Lease>,
    keys: HashMap<Value, Lease>,
}

pub(crate) struct LockTable {
    state: Mutex<LockState>,
    cond: Condvar,
}

enum WaitBudget {
    Immediate,
    Until(Instant),
    Forever,
}

impl WaitBudget {
    fn new(wait_millis: i64) -> WaitBudget {
        if wait_millis == 0 {
            WaitBudget::Immediate
        } else if wait_millis < 0 {
            WaitBudget::Forever
        } else {
            WaitBudget::Until(Instant::now() + Duration::from_millis(wait_millis as u64))
        }
    }
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable {
            state: Mutex::new(LockState {
                global: None,
                keys: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires an exclusive lease on `key`. `wait_millis` of 0 tries once,
    /// negative waits indefinitely. Reentrant by owner.
    pub fn lock_key(&self, key: &Value, wait_millis: i64) -> bool {
        let me = thread::current().id();
        let budget = WaitBudget::new(wait_millis);
        let mut state = self.state.lock().unwrap();

        loop {
            let global_conflict = state.global.map(|lease| lease.owner != me).unwrap_or(false);
            let key_conflict = state
                .keys
                .get(key)
                .map(|lease| lease.owner != me)
                .unwrap_or(false);

            if !global_conflict && !key_conflict {
                state
                    .keys
                    .entry(key.clone())
                    .and_modify(|lease| lease.count += 1)
                    .or_insert(Lease { owner: me, count: 1 });
                return true;
            }

            state = match budget {
                WaitBudget::Immediate => return false,
                WaitBudget::Forever => self.cond.wait(state).unwrap(),
                WaitBudget::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.cond.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Releases one hold on `key`. Silently does nothing if the caller is
    /// not the holder.
    pub fn unlock_key(&self, key: &Value) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some(lease) = state.keys.get_mut(key) {
            if lease.owner != me {
                return;
            }
            lease.count -= 1;
            if lease.count == 0 {
                state.keys.remove(key);
            }
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Acquires the all-entries lock: no other thread may hold the global
    /// lock or any per-key lease.
    pub fn lock_all(&self, wait_millis: i64) -> bool {
        let me = thread::current().id();
        let budget = WaitBudget::new(wait_millis);
        let mut state = self.state.lock().unwrap();

        loop {
            let global_conflict = state.global.map(|lease| lease.owner != me).unwrap_or(false);
            let key_conflict = state.keys.values().any(|lease| lease.owner != me);

            if !global_conflict && !key_conflict {
                match &mut state.global {
                    Some(lease) => lease.count += 1,
                    slot => *slot = Some(Lease { owner: me, count: 1 }),
                }
                return true;
            }

            state = match budget {
                WaitBudget::Immediate => return false,
                WaitBudget::Forever => self.cond.wait(state).unwrap(),
                WaitBudget::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.cond.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    pub fn unlock_all(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        if let Some(lease) = &mut state.global {
            if lease.owner != me {
                return;
            }
            lease.count -= 1;
            if lease.count == 0 {
                state.global = None;
            }
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Blocks while the all-entries lock is held by another thread. Mutations
    /// call this before touching the store.
    pub fn guard_mutation(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        while state.global.map(|lease| lease.owner != me).unwrap_or(false) {
            state = self.cond.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentrant_by_owner() {
        let table = LockTable::new();
        let key = Value::from("k");

        assert!(table.lock_key(&key, 0));
        assert!(table.lock_key(&key, 0));
        table.unlock_key(&key);

        // Still held once; another thread cannot take it.
        let table = Arc::new(table);
        let contender = {
            let table = table.clone();
            let key = key.clone();
            thread::spawn(move || table.lock_key(&key, 0))
        };
        assert!(!contender.join().unwrap());

        table.unlock_key(&key);
        let contender = {
            let table = table.clone();
            let key = key.clone();
            thread::spawn(move || table.lock_key(&key, 0))
        };
        assert!(contender.join().unwrap());
    }

    #[test]
    fn test_unlock_by_non_holder_is_silent() {
        let table = Arc::new(LockTable::new());
        let key = Value::from("k");

        assert!(table.lock_key(&key, 0));

        let meddler = {
            let table = table.clone();
            let key = key.clone();
            thread::spawn(move || {
                table.unlock_key(&key);
                table.lock_key(&key, 0)
            })
        };
        // The foreign unlock did not release our lease.
        assert!(!meddler.join().unwrap());
    }

    #[test]
    fn test_timed_wait_succeeds_when_released() {
        let table = Arc::new(LockTable::new());
        let key = Value::from("k");
        assert!(table.lock_key(&key, 0));

        let waiter = {
            let table = table.clone();
            let key = key.clone();
            thread::spawn(move || table.lock_key(&key, 2_000))
        };

        thread::sleep(Duration::from_millis(30));
        table.unlock_key(&key);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_timed_wait_expires() {
        let table = Arc::new(LockTable::new());
        let key = Value::from("k");
        assert!(table.lock_key(&key, 0));

        let waiter = {
            let table = table.clone();
            let key = key.clone();
            thread::spawn(move || table.lock_key(&key, 50))
        };
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_global_conflicts_with_key_leases() {
        let table = Arc::new(LockTable::new());
        let key = Value::from("k");
        assert!(table.lock_key(&key, 0));

        {
            let table = table.clone();
            let blocked = thread::spawn(move || table.lock_all(0));
            assert!(!blocked.join().unwrap());
        }

        table.unlock_key(&key);
        assert!(table.lock_all(0));

        {
            let table = table.clone();
            let blocked = thread::spawn(move || table.lock_key(&Value::from("other"), 0));
            assert!(!blocked.join().unwrap());
        }

        // The global holder itself may still take per-key leases.
        assert!(table.lock_key(&key, 0));
        table.unlock_key(&key);
        table.unlock_all();
    }

    #[test]
    fn test_guard_mutation_waits_for_global() {
        let table = Arc::new(LockTable::new());
        assert!(table.lock_all(0));

        let waited = {
            let table = table.clone();
            thread::spawn(move || {
                let started = Instant::now();
                table.guard_mutation();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        table.unlock_all();

        assert!(waited.join().unwrap() >= Duration::from_millis(40));
    }
}
