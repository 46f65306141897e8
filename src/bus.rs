//! Publish/subscribe event bus with a single dispatch thread.
//!
//! Ordering: one FIFO queue for every kind. Handlers for an event all run,
//! in registration order, on the dispatch thread before the next event is
//! dequeued. Events published from inside a handler go to the tail of the
//! queue and are never dispatched re-entrantly.
//!
//! The queue is unbounded; a producer that outpaces the handlers grows it
//! without limit.
//!
//! Handlers should capture a [`Publisher`] rather than an [`EventBus`]
//! clone: the bus owns its handlers, so a handler holding the bus keeps it
//! alive forever.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use crate::events::{Event, EventKind};
use crate::logging::{log, log_handler_failure, obj, v_str, Domain, Level};

type HandlerFn = dyn FnMut(&Event) -> Result<()> + Send;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusConfig {
    /// Upper bound on how long the idle loop waits before re-checking shutdown.
    pub tick: Duration,
    /// How long `stop()` waits for the dispatch thread to exit.
    pub stop_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub published: u64,
    pub dispatched: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dispatched: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    /// `dispatched` is read before `published`; since `published` never
    /// trails `dispatched`, equal values mean nothing was in flight.
    fn snapshot(&self) -> DispatchStats {
        let dispatched = self.dispatched.load(Ordering::SeqCst);
        DispatchStats {
            published: self.published.load(Ordering::SeqCst),
            dispatched,
            handler_invocations: self.handler_invocations.load(Ordering::SeqCst),
            handler_failures: self.handler_failures.load(Ordering::SeqCst),
        }
    }
}

struct Subscription {
    name: String,
    // Only ever locked by the dispatch thread.
    handler: Mutex<Box<HandlerFn>>,
}

impl Subscription {
    fn invoke(&self, event: &Event) -> std::result::Result<(), String> {
        let mut guard = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        let handler: &mut HandlerFn = &mut **guard;
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

/// State shared with the dispatch thread.
struct Shared {
    cfg: BusConfig,
    handlers: RwLock<HashMap<EventKind, Vec<Arc<Subscription>>>>,
    counters: Arc<Counters>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    dispatch_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn subscribers(&self, kind: EventKind) -> Vec<Arc<Subscription>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&kind).cloned().unwrap_or_default()
    }

    /// Counted as dispatched only after every handler has returned, so
    /// anything a handler publishes is already counted as published.
    fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe without deadlocking; new
        // subscriptions take effect from the next event.
        let subscribers = self.subscribers(kind);
        for sub in subscribers {
            self.counters.handler_invocations.fetch_add(1, Ordering::SeqCst);
            if let Err(reason) = sub.invoke(event) {
                self.counters.handler_failures.fetch_add(1, Ordering::SeqCst);
                log_handler_failure(kind.as_str(), &sub.name, event.ticker(), &reason);
            }
        }
        self.counters.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dispatch_thread(&self) -> bool {
        let current = thread::current().id();
        *self.dispatch_thread.lock().unwrap_or_else(PoisonError::into_inner) == Some(current)
    }

    fn set_dispatch_thread(&self, id: Option<ThreadId>) {
        *self.dispatch_thread.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

/// Cheap, cloneable handle for putting events on the queue.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Event>,
    counters: Arc<Counters>,
}

impl Publisher {
    /// Enqueue at the tail. Never blocks; callable from any thread,
    /// including from inside a handler.
    pub fn publish(&self, event: impl Into<Event>) -> Result<()> {
        // Counted before the send so `dispatched` can never overtake it.
        self.counters.published.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.tx.send(event.into()) {
            self.counters.published.fetch_sub(1, Ordering::SeqCst);
            bail!("event queue closed, dropped {} event", err.0.kind());
        }
        Ok(())
    }
}

enum Lifecycle {
    /// `None` only if the dispatch thread died without handing the queue back.
    Idle(Option<mpsc::UnboundedReceiver<Event>>),
    /// Stays here after a shutdown request until the loop's queue is
    /// collected by `stop()` or the next `start()`.
    Running {
        done: std_mpsc::Receiver<mpsc::UnboundedReceiver<Event>>,
        thread: JoinHandle<()>,
    },
}

/// Explicitly constructed broker; clones share the same queue and handlers.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    publisher: Publisher,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl EventBus {
    pub fn new(cfg: BusConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        Self {
            shared: Arc::new(Shared {
                cfg,
                handlers: RwLock::new(HashMap::new()),
                counters: Arc::clone(&counters),
                running: AtomicBool::new(false),
                shutdown: watch::channel(false).0,
                dispatch_thread: Mutex::new(None),
            }),
            publisher: Publisher { tx, counters },
            lifecycle: Arc::new(Mutex::new(Lifecycle::Idle(Some(rx)))),
        }
    }

    /// Register `handler` for `kind`. Handlers for one kind run in
    /// registration order. Safe before or after `start()`; a subscription
    /// made while an event is being dispatched applies from the next event.
    pub fn subscribe<F>(&self, kind: EventKind, name: impl Into<String>, handler: F)
    where
        F: FnMut(&Event) -> Result<()> + Send + 'static,
    {
        let sub = Arc::new(Subscription {
            name: name.into(),
            handler: Mutex::new(Box::new(handler)),
        });
        let mut handlers = self.shared.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(kind).or_default().push(sub);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.shared.subscribers(kind).len()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn publish(&self, event: impl Into<Event>) -> Result<()> {
        self.publisher.publish(event)
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    /// True when every published event has been fully handled. Handlers
    /// publish before they return, so a drained bus stays drained until an
    /// outside producer publishes again.
    pub fn is_drained(&self) -> bool {
        let stats = self.shared.counters.snapshot();
        stats.dispatched == stats.published
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the dispatch thread. A second call while running is a no-op.
    /// Events queued before `start()` are delivered once it runs. A loop
    /// that was asked to stop but not yet collected is collected first.
    pub fn start(&self) -> Result<()> {
        if self.shared.on_dispatch_thread() {
            if self.is_running() {
                return Ok(());
            }
            bail!("dispatch loop cannot restart itself from one of its handlers");
        }
        let mut lifecycle = self.lock_lifecycle();
        if matches!(*lifecycle, Lifecycle::Running { .. }) {
            if self.is_running() {
                return Ok(());
            }
            self.collect(&mut lifecycle)?;
        }
        let Lifecycle::Idle(rx) = &mut *lifecycle else {
            bail!("dispatch loop still registered after collection");
        };
        let rx = rx
            .take()
            .ok_or_else(|| anyhow!("event queue was lost when the dispatch thread died"))?;

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt,
            Err(err) => {
                *lifecycle = Lifecycle::Idle(Some(rx));
                return Err(err).context("building dispatch runtime");
            }
        };

        self.shared.shutdown.send_replace(false);
        let shutdown_rx = self.shared.shutdown.subscribe();
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        let shared = Arc::clone(&self.shared);
        self.shared.running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new().name("event-bus".to_string()).spawn(move || {
            shared.set_dispatch_thread(Some(thread::current().id()));
            let rx = dispatch_loop(&shared, runtime, rx, shutdown_rx);
            shared.set_dispatch_thread(None);
            shared.running.store(false, Ordering::SeqCst);
            let _ = done_tx.send(rx);
        });
        let thread = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                *lifecycle = Lifecycle::Idle(None);
                return Err(err).context("spawning dispatch thread");
            }
        };

        log(Level::Info, Domain::Bus, "bus_started", obj(&[("msg", v_str("dispatch loop running"))]));
        *lifecycle = Lifecycle::Running { done: done_rx, thread };
        Ok(())
    }

    /// Ask the dispatch loop to exit and wait up to `stop_timeout` for it.
    /// A no-op when not running. Events still queued are discarded.
    ///
    /// Called from a handler, this only signals shutdown and never touches
    /// the lifecycle lock; the loop exits once that handler returns.
    pub fn stop(&self) -> Result<()> {
        if self.shared.on_dispatch_thread() {
            self.shared.request_shutdown();
            return Ok(());
        }
        let mut lifecycle = self.lock_lifecycle();
        if matches!(*lifecycle, Lifecycle::Idle(_)) {
            return Ok(());
        }
        self.shared.request_shutdown();
        self.collect(&mut lifecycle)
    }

    /// Wait for a loop that has been told to shut down and take its queue
    /// back. On timeout the state is left as is so a later call can retry.
    fn collect(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let Lifecycle::Running { done, .. } = &*lifecycle else {
            return Ok(());
        };
        let timeout = self.shared.cfg.stop_timeout;
        match done.recv_timeout(timeout) {
            Ok(rx) => {
                if let Lifecycle::Running { thread, .. } =
                    std::mem::replace(lifecycle, Lifecycle::Idle(Some(rx)))
                {
                    let _ = thread.join();
                }
                log(Level::Info, Domain::Bus, "bus_stopped", obj(&[("msg", v_str("dispatch loop exited"))]));
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                log(
                    Level::Error,
                    Domain::Bus,
                    "bus_stop_timeout",
                    obj(&[
                        ("msg", v_str("dispatch thread did not exit in time; a handler may be wedged")),
                        ("timeout_ms", json!(timeout.as_millis() as u64)),
                    ]),
                );
                bail!("dispatch thread did not exit within {:?}", timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Lifecycle::Running { thread, .. } = std::mem::replace(lifecycle, Lifecycle::Idle(None)) {
                    let _ = thread.join();
                }
                bail!("dispatch thread exited without returning its queue")
            }
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn dispatch_loop(
    shared: &Shared,
    runtime: Runtime,
    mut rx: mpsc::UnboundedReceiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<Event> {
    let tick = shared.cfg.tick;
    runtime.block_on(async {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = rx.recv() => match next {
                    Some(event) => shared.dispatch(&event),
                    None => break,
                },
                _ = tokio::time::sleep(tick) => {}
            }
        }
    });

    let mut discarded = 0u64;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        log(
            Level::Warn,
            Domain::Bus,
            "queue_discarded",
            obj(&[("msg", v_str("events left in queue at shutdown")), ("count", json!(discarded))]),
        );
    }
    rx
}
