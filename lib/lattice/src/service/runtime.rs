//! Service lifecycle and the command queue drained by the service thread.
//! The state variable only ever advances:
//! `Initial -> Starting -> Started -> Stopping -> Stopped`; every transition
//! is broadcast on the lifecycle condvar and echoed to lifecycle listeners
//! from the dispatcher thread.

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::net::connection::Command;
use crate::service::dispatcher::EventDispatcher;
use photon::logging;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

pub type LifecycleListener = Arc<dyn Fn(ServiceState) + Send + Sync>;

struct Lifecycle {
    state: ServiceState,
    accepting: bool,
    failure: Option<Error>,
}

pub struct ServiceRuntime {
    name: String,
    config: ServiceConfig,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_cond: Condvar,
    lifecycle_listeners: Mutex<Vec<LifecycleListener>>,
    queue: Mutex<VecDeque<Command>>,
    queue_cond: Condvar,
    dispatcher: EventDispatcher,
    service_thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: logging::Logger,
}

impl ServiceRuntime {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        config: ServiceConfig,
        log: L,
    ) -> Arc<ServiceRuntime> {
        let log = logging::child(log, logging::o!("service" => name.to_string()));
        let dispatcher = EventDispatcher::new(name, config.clogged_count, config.clogged_delay_millis, &log);

        Arc::new(ServiceRuntime {
            name: name.to_string(),
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: ServiceState::Initial,
                accepting: false,
                failure: None,
            }),
            lifecycle_cond: Condvar::new(),
            lifecycle_listeners: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            dispatcher,
            service_thread: Mutex::new(None),
            log,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[inline]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }

    pub(crate) fn attach_thread(&self, handle: thread::JoinHandle<()>) {
        *self.service_thread.lock().unwrap() = Some(handle);
    }

    pub(crate) fn is_service_thread(&self) -> bool {
        self.service_thread
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    /// Enqueue a command for the service thread. Fails once the service has
    /// begun stopping so a caller never parks on a queue nobody drains.
    pub fn post(&self, command: Command) -> Result<()> {
        if self.state() >= ServiceState::Stopping {
            return Err(Error::connection_closed(None));
        }

        let mut queue = self.queue.lock().unwrap();
        queue.push_back(command);
        self.queue_cond.notify_one();
        Ok(())
    }

    /// Dequeue the next command, waiting at most `max_wait`.
    pub(crate) fn next_command(&self, max_wait: Duration) -> Option<Command> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self.queue_cond.wait_timeout(queue, max_wait).unwrap();
            queue = guard;
        }
        queue.pop_front()
    }

    /// Take everything still queued; used by the service thread on its way
    /// out to fail stragglers instead of leaving their slots pending forever.
    pub(crate) fn drain_queue(&self) -> Vec<Command> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.lock().unwrap().state
    }

    pub fn is_accepting(&self) -> bool {
        self.lifecycle.lock().unwrap().accepting
    }

    /// Advance the service state. Transitions are monotone; an attempt to move
    /// backwards is a bug in the caller and is ignored with a warning.
    pub(crate) fn advance_state(&self, next: ServiceState) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if next < lifecycle.state {
            logging::warn!(self.log, "ignoring backwards state transition";
                           "from" => format!("{:?}", lifecycle.state),
                           "to" => format!("{:?}", next));
            return;
        }
        if next == lifecycle.state {
            return;
        }

        logging::debug!(self.log, "service state changed";
                        "from" => format!("{:?}", lifecycle.state),
                        "to" => format!("{:?}", next));
        lifecycle.state = next;
        if next >= ServiceState::Stopping {
            lifecycle.accepting = false;
        }
        drop(lifecycle);
        self.lifecycle_cond.notify_all();

        let listeners = self.lifecycle_listeners.lock().unwrap().clone();
        if !listeners.is_empty() {
            self.dispatcher.post(move || {
                for listener in &listeners {
                    listener(next);
                }
            });
        }
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.accepting = accepting;
        drop(lifecycle);
        self.lifecycle_cond.notify_all();
    }

    pub(crate) fn record_failure(&self, error: Error) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.failure.is_none() {
            lifecycle.failure = Some(error);
        }
        drop(lifecycle);
        self.lifecycle_cond.notify_all();
    }

    pub fn add_lifecycle_listener(&self, listener: LifecycleListener) {
        self.lifecycle_listeners.lock().unwrap().push(listener);
    }

    /// The public barrier: block until the service accepts clients.
    pub fn wait_accepting_clients(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| std::time::Instant::now() + timeout);
        let mut lifecycle = self.lifecycle.lock().unwrap();

        loop {
            if let Some(failure) = &lifecycle.failure {
                return Err(Error::ServiceFailed(Arc::new(failure.clone())));
            }
            if lifecycle.accepting {
                return Ok(());
            }
            if lifecycle.state >= ServiceState::Stopping {
                return Err(Error::NotReady);
            }

            lifecycle = match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(Error::NotReady);
                    }
                    self.lifecycle_cond.wait_timeout(lifecycle, deadline - now).unwrap().0
                }
                None => self.lifecycle_cond.wait(lifecycle).unwrap(),
            };
        }
    }

    /// Startup handshake: block until the service is started and accepting,
    /// or a start failure was recorded.
    pub(crate) fn wait_started(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();

        loop {
            if let Some(failure) = &lifecycle.failure {
                return Err(Error::ServiceFailed(Arc::new(failure.clone())));
            }
            if lifecycle.state == ServiceState::Started && lifecycle.accepting {
                return Ok(());
            }
            if lifecycle.state >= ServiceState::Stopping {
                return Err(Error::ServiceFailed(Arc::new(Error::NotReady)));
            }

            lifecycle = self.lifecycle_cond.wait(lifecycle).unwrap();
        }
    }

    /// Block until the service reaches `target` or beyond.
    pub fn wait_state(&self, target: ServiceState) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        while lifecycle.state < target {
            lifecycle = self.lifecycle_cond.wait(lifecycle).unwrap();
        }
    }

    /// Final teardown from a caller thread: wait for the service thread to
    /// finish, then stop the dispatcher last, giving it a second to drain.
    pub(crate) fn join_and_stop_dispatcher(&self) {
        if !self.is_service_thread() {
            if let Some(handle) = self.service_thread.lock().unwrap().take() {
                drop(handle.join());
            }
        }
        self.dispatcher.shutdown(Duration::from_secs(1));
    }
}
