//! The event dispatcher thread. All listener callbacks — cache events,
//! service lifecycle events — run here, one at a time, in FIFO order.
//! Listener panics are logged and never kill the thread. Producers that
//! outrun the listeners are throttled once the queue clogs.

use photon::logging;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

struct DispatcherShared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    running: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
    clogged_count: usize,
    clogged_delay: Duration,
    thread_id: Mutex<Option<thread::ThreadId>>,
    log: logging::Logger,
}

pub struct EventDispatcher {
    name: String,
    shared: Arc<DispatcherShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        clogged_count: usize,
        clogged_delay_millis: u64,
        log: L,
    ) -> EventDispatcher {
        EventDispatcher {
            name: name.to_string(),
            shared: Arc::new(DispatcherShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                drain_deadline: Mutex::new(None),
                clogged_count,
                clogged_delay: Duration::from_millis(clogged_delay_millis),
                thread_id: Mutex::new(None),
                log: logging::child(log, logging::o!("thread" => format!("{}:events", name))),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Launch the dispatcher thread. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();

        let joiner = thread::Builder::new()
            .name(format!("{}:events", self.name))
            .spawn(move || {
                *shared.thread_id.lock().unwrap() = Some(thread::current().id());
                logging::debug!(shared.log, "event dispatcher started");
                run(&shared);
                logging::debug!(shared.log, "event dispatcher stopped");
            })
            .expect("Error spawning event dispatcher thread");

        *handle = Some(joiner);
    }

    /// Queue a task for the dispatcher thread. A posting thread other than the
    /// dispatcher itself is paused in `clogged_delay` steps while the queue
    /// sits above the clogged threshold. Tasks posted after shutdown are
    /// dropped.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        let shared = &self.shared;

        if !shared.running.load(Ordering::SeqCst) {
            logging::debug!(shared.log, "event dropped after dispatcher shutdown");
            return;
        }

        let own_thread = *shared.thread_id.lock().unwrap() == Some(thread::current().id());
        if !own_thread {
            while shared.running.load(Ordering::SeqCst)
                && self.queue_len() >= shared.clogged_count
            {
                thread::sleep(shared.clogged_delay);
            }
        }

        let mut queue = shared.queue.lock().unwrap();
        queue.push_back(Box::new(task));
        shared.cond.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Stop the dispatcher, giving it `drain` time to work off the backlog.
    pub fn shutdown(&self, drain: Duration) {
        {
            let mut deadline = self.shared.drain_deadline.lock().unwrap();
            *deadline = Some(Instant::now() + drain);
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                drop(handle.join());
            }
        }
    }
}

fn run(shared: &DispatcherShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break None;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };

        let task = match task {
            Some(task) => task,
            None => return,
        };

        // Past the drain deadline the rest of the backlog is abandoned.
        if !shared.running.load(Ordering::SeqCst) {
            let expired = shared
                .drain_deadline
                .lock()
                .unwrap()
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false);
            if expired {
                let abandoned = shared.queue.lock().unwrap().len() + 1;
                logging::warn!(shared.log, "drain deadline passed"; "abandoned_events" => abandoned);
                return;
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            logging::error!(shared.log, "listener panicked; dispatcher continues");
        }
    }
}
