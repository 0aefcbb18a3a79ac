//! One-shot rendezvous slots for request/response correlation. A slot settles
//! exactly once — whichever of receive, timeout, cancellation or close gets
//! there first wins, and every later attempt is a no-op.

use crate::error::{Error, Result};
use crate::net::message::Message;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

enum SlotState<T> {
    Pending,
    Completed(T),
    Failed(Error),
    Cancelled,
    Consumed,
}

pub struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

impl<T> Slot<T> {
    pub fn new() -> Arc<Slot<T>> {
        Arc::new(Slot {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
        })
    }

    /// Settle with a value. Returns false if the slot was already settled.
    pub fn complete(&self, value: T) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Pending => {
                *state = SlotState::Completed(value);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Settle with a failure. Returns false if the slot was already settled.
    pub fn fail(&self, error: Error) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Pending => {
                *state = SlotState::Failed(error);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Cancel a pending slot. A response arriving later is dropped by the
    /// channel as spurious. No-op once settled.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Pending => {
                *state = SlotState::Cancelled;
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), SlotState::Pending)
    }

    /// Block until the slot settles or `timeout` elapses, then take the
    /// outcome. A timed-out wait fails the slot with `Timeout` (unless a
    /// result raced in first, which then wins). Cancellation surfaces as
    /// `Timeout` as well: the caller gave up on the response either way.
    pub fn wait_take(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap();

        loop {
            match std::mem::replace(&mut *state, SlotState::Pending) {
                SlotState::Pending => (),
                SlotState::Completed(value) => {
                    *state = SlotState::Consumed;
                    return Ok(value);
                }
                SlotState::Failed(error) => {
                    *state = SlotState::Failed(error.clone());
                    return Err(error);
                }
                SlotState::Cancelled => {
                    *state = SlotState::Cancelled;
                    return Err(Error::Timeout);
                }
                SlotState::Consumed => {
                    *state = SlotState::Consumed;
                    return Err(Error::protocol("response already consumed"));
                }
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *state = SlotState::Failed(Error::Timeout);
                        self.cond.notify_all();
                        return Err(Error::Timeout);
                    }
                    self.cond.wait_timeout(state, deadline - now).unwrap().0
                }
                None => self.cond.wait(state).unwrap(),
            };
        }
    }
}

/// Handle to an in-flight request, returned by `Channel::send`.
pub struct Status {
    slot: Arc<Slot<Box<dyn Message>>>,
    default_timeout_millis: u64,
}

impl Status {
    pub(crate) fn new(slot: Arc<Slot<Box<dyn Message>>>, default_timeout_millis: u64) -> Status {
        Status {
            slot,
            default_timeout_millis,
        }
    }

    /// Block until the response arrives or the deadline passes.
    ///
    /// `timeout_millis` of 0 applies the service default; a negative value
    /// waits without a deadline.
    pub fn wait(self, timeout_millis: i64) -> Result<Box<dyn Message>> {
        let effective = if timeout_millis == 0 {
            match self.default_timeout_millis {
                0 => None,
                default => Some(default),
            }
        } else if timeout_millis < 0 {
            None
        } else {
            Some(timeout_millis as u64)
        };

        self.slot.wait_take(effective.map(Duration::from_millis))
    }

    /// Abandon the request. The channel drops a late response on the floor.
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.slot.is_settled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_then_wait() {
        let slot = Slot::new();
        assert!(slot.complete(7));
        assert_eq!(slot.wait_take(None).unwrap(), 7);
    }

    #[test]
    fn test_at_most_one_settlement() {
        let slot = Slot::new();
        assert!(slot.complete(1));
        assert!(!slot.complete(2));
        assert!(!slot.fail(Error::Timeout));
        assert!(!slot.cancel());
        assert_eq!(slot.wait_take(None).unwrap(), 1);
    }

    #[test]
    fn test_wait_timeout_fails_slot() {
        let slot: Arc<Slot<u32>> = Slot::new();
        let result = slot.wait_take(Some(Duration::from_millis(20)));
        assert_eq!(result.unwrap_err(), Error::Timeout);

        // The loser of the race is a no-op.
        assert!(!slot.complete(5));
    }

    #[test]
    fn test_cancel_then_wait() {
        let slot: Arc<Slot<u32>> = Slot::new();
        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert_eq!(slot.wait_take(None).unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_wait_wakes_on_cross_thread_complete() {
        let slot = Slot::new();
        let remote = slot.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete("done");
        });

        assert_eq!(slot.wait_take(Some(Duration::from_secs(5))).unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_settlement_race_is_single_winner() {
        for _ in 0..100 {
            let slot: Arc<Slot<u32>> = Slot::new();
            let contenders: Vec<_> = (0..4)
                .map(|i| {
                    let slot = slot.clone();
                    thread::spawn(move || match i {
                        0 => slot.complete(10) as u32,
                        1 => slot.fail(Error::Timeout) as u32,
                        2 => slot.cancel() as u32,
                        _ => slot.fail(Error::channel_closed(None)) as u32,
                    })
                })
                .collect();

            let winners: u32 = contenders.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_failed_slot_observed_repeatedly() {
        let slot: Arc<Slot<u32>> = Slot::new();
        slot.fail(Error::channel_closed(Some(Error::Timeout)));

        assert_eq!(
            slot.wait_take(None).unwrap_err(),
            Error::channel_closed(Some(Error::Timeout))
        );
        assert_eq!(
            slot.wait_take(None).unwrap_err(),
            Error::channel_closed(Some(Error::Timeout))
        );
    }
}
