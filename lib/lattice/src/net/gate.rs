//! The connection gate: a barrier admitting any number of concurrent client
//! operations ("enterers") while open, closeable by a single closer that
//! waits for the enterers to drain. With all connection state owned by the
//! service thread the gate is not needed for memory safety; it survives as
//! the graceful-shutdown coordinator so close never yanks the connection out
//! from under an operation that already started.

use hashbrown::HashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Per-thread re-entry counts, keyed by gate id. A thread already inside
    // may re-enter a closing gate, so nested operations never self-deadlock.
    static ENTRIES: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

struct GateState {
    closed: bool,
    enterers: usize,
    exit_action: Option<Box<dyn FnOnce() + Send>>,
}

pub struct Gate {
    id: u64,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Gate {
        Gate {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GateState {
                closed: false,
                enterers: 0,
                exit_action: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn local_count(&self) -> usize {
        ENTRIES.with(|entries| entries.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn adjust_local(&self, delta: isize) {
        ENTRIES.with(|entries| {
            let mut entries = entries.borrow_mut();
            let count = entries.entry(self.id).or_insert(0);
            *count = (*count as isize + delta) as usize;
            if *count == 0 {
                entries.remove(&self.id);
            }
        });
    }

    /// Enter the gate. Returns false if the gate is closed or closing and the
    /// calling thread is not already inside.
    pub fn enter(&self) -> bool {
        let reentrant = self.local_count() > 0;
        let mut state = self.state.lock().unwrap();

        if state.closed && !reentrant {
            return false;
        }

        state.enterers += 1;
        drop(state);
        self.adjust_local(1);
        true
    }

    /// Exit the gate. The last enterer out runs any pending close-on-exit
    /// action after reopening the gate on behalf of the closer.
    pub fn exit(&self) {
        if self.local_count() == 0 {
            panic!("Gate exit without a matching enter");
        }

        self.adjust_local(-1);

        let action = {
            let mut state = self.state.lock().unwrap();
            state.enterers = state
                .enterers
                .checked_sub(1)
                .expect("Gate enterer count must match exits");

            if state.enterers == 0 {
                self.cond.notify_all();
                if state.exit_action.is_some() {
                    state.closed = false;
                    state.exit_action.take()
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(action) = action {
            action();
        }
    }

    /// Close the gate: stop admitting new enterers, then wait up to `timeout`
    /// for current enterers to drain. Returns true once drained; on false the
    /// gate stays shut but enterers are still inside — follow up with
    /// `close_on_exit` or `reopen`.
    ///
    /// A thread currently inside the gate must not call this with a blocking
    /// timeout against its own connection; the enter count it holds would
    /// never drain.
    pub fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        state.closed = true;

        while state.enterers > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
        }

        true
    }

    /// Arrange for `action` to run as soon as the gate drains. If it is
    /// already drained the action runs on the calling thread immediately;
    /// otherwise the last exiting enterer runs it after reopening the gate.
    pub fn close_on_exit<F: FnOnce() + Send + 'static>(&self, action: F) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;

        if state.enterers == 0 {
            drop(state);
            action();
        } else {
            state.exit_action = Some(Box::new(action));
        }
    }

    /// Reopen a closed gate.
    pub fn reopen(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = false;
        state.exit_action = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_enter_exit() {
        let gate = Gate::new();
        assert!(gate.enter());
        assert!(gate.enter());
        gate.exit();
        gate.exit();
        assert!(gate.close(Duration::from_millis(10)));
    }

    #[test]
    fn test_closed_gate_rejects_new_enterers() {
        let gate = Gate::new();
        assert!(gate.close(Duration::from_millis(1)));
        assert!(!gate.enter());

        gate.reopen();
        assert!(gate.enter());
        gate.exit();
    }

    #[test]
    fn test_reentry_through_closing_gate() {
        let gate = Gate::new();
        assert!(gate.enter());

        // Close cannot finish while we are inside...
        assert!(!gate.close(Duration::from_millis(10)));
        // ...but the thread already inside may still re-enter.
        assert!(gate.enter());
        gate.exit();
        gate.exit();

        assert!(gate.close(Duration::from_millis(10)));
    }

    #[test]
    fn test_close_waits_for_drain() {
        let gate = Arc::new(Gate::new());
        assert!(gate.enter());

        let closer = {
            let gate = gate.clone();
            thread::spawn(move || gate.close(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(30));
        gate.exit();

        assert!(closer.join().unwrap());
        assert!(!gate.enter());
    }

    #[test]
    fn test_close_on_exit_runs_in_last_enterer() {
        let gate = Arc::new(Gate::new());
        let fired = Arc::new(AtomicUsize::new(0));

        assert!(gate.enter());
        assert!(gate.enter());

        {
            let fired = fired.clone();
            gate.close_on_exit(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!gate.enter());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        gate.exit();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        gate.exit();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The last exit reopened the gate on behalf of the closer.
        assert!(gate.enter());
        gate.exit();
    }

    #[test]
    fn test_close_on_exit_immediate_when_drained() {
        let gate = Gate::new();
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            gate.close_on_exit(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(gate.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_liveness_under_churn() {
        let gate = Arc::new(Gate::new());
        let stop = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut denied = 0usize;
                    while stop.load(Ordering::SeqCst) == 0 {
                        if gate.enter() {
                            gate.exit();
                        } else {
                            denied += 1;
                        }
                    }
                    denied
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        // The close completes in bounded time even under constant churn.
        assert!(gate.close(Duration::from_secs(10)));

        // Nothing gets past enter once the close has gone through.
        assert!(!gate.enter());

        stop.store(1, Ordering::SeqCst);
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "Gate exit without a matching enter")]
    fn test_unbalanced_exit_panics() {
        let gate = Gate::new();
        gate.exit();
    }
}
