//! Reply delivery from transport listeners to the upload engine.
//!
//! Listener threads push decoded replies through a [`ReplySink`]. The
//! engine blocks on the matching [`ReplyQueue`] with a timeout. A
//! [`CancelToken`] posts a wake-up event into the same channel so a blocked
//! wait returns immediately.

use crate::protocol::reply::ReplyCode;
use log::warn;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Replies buffered before new ones are dropped.
///
/// At most one packet is outstanding, so anything queued beyond a few
/// entries is stale.
pub const REPLY_QUEUE_CAPACITY: usize = 16;

#[derive(Debug)]
enum Event {
    Reply(ReplyCode),
    Disconnected(String),
    Wake,
}

/// Outcome of one blocking wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    /// A reply arrived.
    Reply(ReplyCode),
    /// Nothing arrived in time.
    TimedOut,
    /// The cancel token fired.
    Cancelled,
    /// The listener lost its link.
    Disconnected(String),
}

/// Cancellation flag that sleepers can block on.
#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

impl CancelState {
    fn set(&self) {
        *self
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.changed.notify_all();
    }

    fn get(&self) -> bool {
        *self
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` or until cancelled. Returns the flag.
    fn sleep(&self, duration: Duration) -> bool {
        let guard = self
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Producer side, handed to a transport when it is opened.
#[derive(Debug, Clone)]
pub struct ReplySink {
    tx: SyncSender<Event>,
}

impl ReplySink {
    /// Deliver a reply.
    ///
    /// Returns `false` once the engine side is gone and the listener
    /// should stop.
    pub fn push(&self, reply: ReplyCode) -> bool {
        match self.tx.try_send(Event::Reply(reply)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Reply queue full, dropping {reply}");
                true
            },
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Report that the link is gone. The engine fails the current wait.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Event::Disconnected(reason.clone())) {
            warn!("Reply queue full, dropping disconnect notice: {reason}");
        }
    }
}

/// Cooperative cancellation for an upload.
///
/// Cloneable and usable from any thread, e.g. a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
    tx: SyncSender<Event>,
}

impl CancelToken {
    /// Request cancellation and wake a blocked wait or retry delay.
    pub fn cancel(&self) {
        self.state.set();
        // A full queue means the waiter is not blocked; it sees the flag
        let _ = self.tx.try_send(Event::Wake);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.get()
    }
}

/// Consumer side, owned by the upload engine.
#[derive(Debug)]
pub struct ReplyQueue {
    rx: Receiver<Event>,
    tx: SyncSender<Event>,
    cancel: Arc<CancelState>,
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(REPLY_QUEUE_CAPACITY);
        Self {
            rx,
            tx,
            cancel: Arc::default(),
        }
    }

    /// New producer handle.
    pub fn sink(&self) -> ReplySink {
        ReplySink {
            tx: self.tx.clone(),
        }
    }

    /// New cancellation handle.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.cancel),
            tx: self.tx.clone(),
        }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.get()
    }

    /// Sleep for `delay` unless cancelled first.
    ///
    /// Returns `true` when cancellation was requested. Queued replies are
    /// left for the next wait.
    pub fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.is_cancelled();
        }
        self.cancel.sleep(delay)
    }

    /// Block until an event arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Wait {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return Wait::Cancelled;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                // Re-check the flag; a stale wake just resumes waiting
                Ok(Event::Wake) => {},
                Ok(Event::Reply(reply)) => return Wait::Reply(reply),
                Ok(Event::Disconnected(reason)) => return Wait::Disconnected(reason),
                Err(RecvTimeoutError::Timeout) => return Wait::TimedOut,
                // We hold a sender ourselves, so this only happens on teardown
                Err(RecvTimeoutError::Disconnected) => {
                    return Wait::Disconnected("reply channel closed".into());
                },
            }
        }
    }

    /// Discard everything queued so far.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}
