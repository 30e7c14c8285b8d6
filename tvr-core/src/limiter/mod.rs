//! Coalescing sender: at most one send in flight, newest value wins.
//!
//! ```text
//!   send(e1) ──► [in flight: e1]
//!   send(e2) ──► [in flight: e1] [pending: e2]
//!   send(e3) ──► [in flight: e1] [pending: e3]    e2 fails with Replaced
//!   e1 done  ──► [in flight: e3]                  sent(r1, more = true)
//! ```

pub mod channeled;

pub use channeled::{ChannelCallback, ChannelSender, ChanneledReplacementLimiter};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{RemoteError, panic_message};
use crate::settle::Settlable;

// ── Collaborator traits ──────────────────────────────────────────

/// Performs the actual send of one event.
pub trait EventSender<E, R>: Send + Sync {
    fn send(&self, event: E) -> Settlable<R>;
}

impl<E, R, F> EventSender<E, R> for F
where
    F: Fn(E) -> Settlable<R> + Send + Sync,
{
    fn send(&self, event: E) -> Settlable<R> {
        self(event)
    }
}

/// Observer of send outcomes.
pub trait ReplacementCallback<E, R>: Send + Sync {
    /// A send succeeded. `more` is set when a newer submission arrived
    /// after this send began.
    fn sent(&self, _result: &R, _more: bool) {}

    /// A send failed. `retry` re-submits the same event if nothing newer
    /// was submitted meanwhile.
    fn failed(&self, _error: &RemoteError, _retry: Retry<E, R>) {}
}

/// Callback that ignores every outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallback;

impl<E, R> ReplacementCallback<E, R> for NoCallback {}

// ── ReplacementLimiter ───────────────────────────────────────────

struct Pending<E, R> {
    event: E,
    settlable: Settlable<R>,
    generation: u64,
}

struct Slot<E, R> {
    pending: Option<Pending<E, R>>,
    sending: bool,
}

pub struct ReplacementLimiter<E, R> {
    sender: Arc<dyn EventSender<E, R>>,
    callback: Arc<dyn ReplacementCallback<E, R>>,
    slot: Mutex<Slot<E, R>>,
    /// Advanced on every submission, under the slot lock.
    generation: AtomicU64,
}

impl<E, R> ReplacementLimiter<E, R>
where
    E: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(
        sender: Arc<dyn EventSender<E, R>>,
        callback: Arc<dyn ReplacementCallback<E, R>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sender,
            callback,
            slot: Mutex::new(Slot {
                pending: None,
                sending: false,
            }),
            generation: AtomicU64::new(0),
        })
    }

    /// Submit `event`. A previously pending event that has not been sent
    /// yet fails with [`RemoteError::Replaced`].
    pub fn send(self: &Arc<Self>, event: E) -> Settlable<R> {
        self.submit(event, None)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    pub fn is_sending(&self) -> bool {
        self.slot.lock().sending
    }

    /// Submit, optionally only if the generation still equals `expected`.
    fn submit(self: &Arc<Self>, event: E, expected: Option<u64>) -> Settlable<R> {
        let settlable = Settlable::new();
        let (displaced, start) = {
            let mut slot = self.slot.lock();
            let current = self.generation.load(Ordering::Acquire);
            if expected.is_some_and(|g| g != current) {
                return Settlable::failed(RemoteError::Replaced);
            }
            let generation = current + 1;
            self.generation.store(generation, Ordering::Release);
            let displaced = slot.pending.replace(Pending {
                event,
                settlable: settlable.clone(),
                generation,
            });
            let start = !slot.sending;
            slot.sending = true;
            (displaced, start)
        };

        if let Some(old) = displaced {
            let _ = old.settlable.settle_error(RemoteError::Replaced);
        }
        if start {
            self.dispatch();
        }
        settlable
    }

    /// Send whatever is pending, or go idle.
    fn dispatch(self: &Arc<Self>) {
        let Pending {
            event,
            settlable,
            generation,
        } = {
            let mut slot = self.slot.lock();
            match slot.pending.take() {
                Some(next) => next,
                None => {
                    slot.sending = false;
                    return;
                }
            }
        };

        let outcome = self.sender.send(event.clone());
        let caller = settlable.clone();
        let limiter = Arc::clone(self);
        let registered = outcome.on_complete(move |result| {
            limiter.finish(result, event, settlable, generation);
        });
        if let Err(e) = registered {
            warn!("sender returned a settlable with a consumed callback slot: {e}");
            let _ = caller.settle_error(e);
            self.dispatch();
        }
    }

    fn finish(
        self: &Arc<Self>,
        result: Result<R, RemoteError>,
        event: E,
        settlable: Settlable<R>,
        generation: u64,
    ) {
        let reported = catch_unwind(AssertUnwindSafe(|| match result {
            Ok(value) => {
                let more = self.generation() != generation;
                let _ = settlable.settle_value(value.clone());
                self.callback.sent(&value, more);
            }
            Err(e) => {
                let _ = settlable.settle_error(e.clone());
                let retry = Retry {
                    limiter: Arc::downgrade(self),
                    event,
                    generation,
                };
                self.callback.failed(&e, retry);
            }
        }));
        if let Err(payload) = reported {
            error!(
                "replacement callback panicked: {}",
                panic_message(payload.as_ref())
            );
        }
        self.dispatch();
    }
}

// ── Retry ────────────────────────────────────────────────────────

/// Re-submission token handed to [`ReplacementCallback::failed`].
pub struct Retry<E, R> {
    limiter: Weak<ReplacementLimiter<E, R>>,
    event: E,
    generation: u64,
}

impl<E, R> Retry<E, R>
where
    E: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn event(&self) -> &E {
        &self.event
    }

    /// Whether a retry would still be accepted.
    pub fn is_valid(&self) -> bool {
        self.limiter
            .upgrade()
            .is_some_and(|l| l.generation() == self.generation)
    }

    /// Re-submit the failed event. Fails with `Replaced` if anything was
    /// submitted since, or if the limiter is gone.
    pub fn retry(self) -> Settlable<R> {
        match self.limiter.upgrade() {
            Some(limiter) => limiter.submit(self.event, Some(self.generation)),
            None => Settlable::failed(RemoteError::Replaced),
        }
    }
}

impl<E: std::fmt::Debug, R> std::fmt::Debug for Retry<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("event", &self.event)
            .field("generation", &self.generation)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
