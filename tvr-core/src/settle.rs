//! Single-assignment result container bridging completions across tasks.
//!
//! A [`Settlable`] starts pending and is settled exactly once, with a
//! value or an error. One completion callback may be attached; it fires
//! on the settling task, or immediately on the registering task when the
//! outcome is already known.
//!
//! ```text
//!   pending ──settle_value──► succeeded(v)
//!      │
//!      └──────settle_error──► failed(e)
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::error;

use crate::error::{RemoteError, panic_message};

type Callback<T> = Box<dyn FnOnce(Result<T, RemoteError>) + Send + 'static>;

struct Slot<T> {
    outcome: Option<Result<T, RemoteError>>,
    callback: Option<Callback<T>>,
    callback_taken: bool,
}

/// Settle-once async result with callback-or-poll consumption.
///
/// Cloning yields another handle to the same slot.
pub struct Settlable<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for Settlable<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Settlable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        let state = match &slot.outcome {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Settlable").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Settlable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Settlable<T> {
    /// A pending settlable.
    pub fn new() -> Self {
        Self::with_outcome(None)
    }

    /// A settlable that has already succeeded with `value`.
    pub fn succeeded(value: T) -> Self {
        Self::with_outcome(Some(Ok(value)))
    }

    /// A settlable that has already failed with `error`.
    ///
    /// Callbacks attached later fire immediately; nothing is deferred.
    pub fn failed(error: RemoteError) -> Self {
        Self::with_outcome(Some(Err(error)))
    }

    fn with_outcome(outcome: Option<Result<T, RemoteError>>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                outcome,
                callback: None,
                callback_taken: false,
            })),
        }
    }

    /// Whether two handles point at the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    // ── Settlement ───────────────────────────────────────────────

    /// Settle with a value. Fails with `AlreadySettled` on a second call.
    pub fn settle_value(&self, value: T) -> Result<(), RemoteError> {
        self.settle(Ok(value))
    }

    /// Settle with an error. Fails with `AlreadySettled` on a second call.
    pub fn settle_error(&self, error: RemoteError) -> Result<(), RemoteError> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, RemoteError>) -> Result<(), RemoteError> {
        let callback = {
            let mut slot = self.slot.lock();
            if slot.outcome.is_some() {
                return Err(RemoteError::AlreadySettled);
            }
            slot.outcome = Some(outcome.clone());
            slot.callback.take()
        };
        if let Some(callback) = callback {
            dispatch(callback, outcome);
        }
        Ok(())
    }

    // ── Consumption ──────────────────────────────────────────────

    /// Attach the single completion callback.
    pub fn on_complete<F>(&self, f: F) -> Result<(), RemoteError>
    where
        F: FnOnce(Result<T, RemoteError>) + Send + 'static,
    {
        let callback: Callback<T> = Box::new(f);
        let ready = {
            let mut slot = self.slot.lock();
            if slot.callback_taken {
                return Err(RemoteError::CallbacksAlreadySet);
            }
            slot.callback_taken = true;
            match &slot.outcome {
                Some(outcome) => Some((callback, outcome.clone())),
                None => {
                    slot.callback = Some(callback);
                    None
                }
            }
        };
        if let Some((callback, outcome)) = ready {
            dispatch(callback, outcome);
        }
        Ok(())
    }

    /// Attach split success/failure callbacks (occupies the callback slot).
    pub fn on_result<S, E>(&self, on_value: S, on_error: E) -> Result<(), RemoteError>
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(RemoteError) + Send + 'static,
    {
        self.on_complete(move |outcome| match outcome {
            Ok(value) => on_value(value),
            Err(e) => on_error(e),
        })
    }

    /// Derive a settlable whose value is `f(value)`.
    ///
    /// Consumes this settlable's callback slot. An error (or panic) from
    /// `f` fails the derived settlable with that error.
    pub fn map<U, F>(&self, f: F) -> Result<Settlable<U>, RemoteError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, RemoteError> + Send + 'static,
    {
        let derived = Settlable::new();
        let child = derived.clone();
        self.on_complete(move |outcome| {
            let mapped = match outcome {
                Ok(value) => guarded(move || f(value)),
                Err(e) => Err(e),
            };
            let _ = child.settle(mapped);
        })?;
        Ok(derived)
    }

    /// Derive a settlable whose error is passed through `f`.
    ///
    /// `f` may recover with `Ok`, or return a replacement error.
    pub fn map_err<F>(&self, f: F) -> Result<Settlable<T>, RemoteError>
    where
        F: FnOnce(RemoteError) -> Result<T, RemoteError> + Send + 'static,
    {
        let derived = Settlable::new();
        let child = derived.clone();
        self.on_complete(move |outcome| {
            let mapped = match outcome {
                Ok(value) => Ok(value),
                Err(e) => guarded(move || f(e)),
            };
            let _ = child.settle(mapped);
        })?;
        Ok(derived)
    }

    /// Await the outcome. Consumes the callback slot.
    ///
    /// The handle is released before suspending, so a settlable whose
    /// every other handle is dropped resolves to `Abandoned`.
    pub async fn wait(self) -> Result<T, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        })?;
        drop(self);
        rx.await.unwrap_or(Err(RemoteError::Abandoned))
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Whether the settlable has been settled.
    pub fn is_done(&self) -> bool {
        self.slot.lock().outcome.is_some()
    }

    /// Whether it succeeded. Fails with `NotFinished` while pending.
    pub fn is_successful(&self) -> Result<bool, RemoteError> {
        match &self.slot.lock().outcome {
            None => Err(RemoteError::NotFinished),
            Some(outcome) => Ok(outcome.is_ok()),
        }
    }

    /// The settled value, the settled error, or `NotFinished`.
    pub fn value(&self) -> Result<T, RemoteError> {
        match &self.slot.lock().outcome {
            None => Err(RemoteError::NotFinished),
            Some(outcome) => outcome.clone(),
        }
    }

    /// The settled error, `None` on success, or `NotFinished`.
    pub fn error(&self) -> Result<Option<RemoteError>, RemoteError> {
        match &self.slot.lock().outcome {
            None => Err(RemoteError::NotFinished),
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => Ok(Some(e.clone())),
        }
    }
}

/// Run a transform, turning a panic into `RemoteError::Panicked`.
fn guarded<U>(f: impl FnOnce() -> Result<U, RemoteError>) -> Result<U, RemoteError> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(RemoteError::Panicked(panic_message(payload.as_ref()))))
}

fn dispatch<T>(callback: Callback<T>, outcome: Result<T, RemoteError>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
        error!(
            "settlement callback panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn settle_once_only() {
        let s = Settlable::<u32>::new();
        assert!(s.settle_value(1).is_ok());
        assert!(matches!(s.settle_value(2), Err(RemoteError::AlreadySettled)));
        assert!(matches!(
            s.settle_error(RemoteError::Replaced),
            Err(RemoteError::AlreadySettled)
        ));
        assert_eq!(s.value().unwrap(), 1);
    }

    #[test]
    fn error_then_value_rejected() {
        let s = Settlable::<u32>::new();
        s.settle_error(RemoteError::Replaced).unwrap();
        assert!(matches!(s.settle_value(2), Err(RemoteError::AlreadySettled)));
        assert!(!s.is_successful().unwrap());
        assert!(matches!(s.error().unwrap(), Some(RemoteError::Replaced)));
    }

    #[test]
    fn accessors_before_settlement_fail() {
        let s = Settlable::<u32>::new();
        assert!(!s.is_done());
        assert!(matches!(s.is_successful(), Err(RemoteError::NotFinished)));
        assert!(matches!(s.value(), Err(RemoteError::NotFinished)));
        assert!(matches!(s.error(), Err(RemoteError::NotFinished)));
    }

    #[test]
    fn callback_before_settlement_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let s = Settlable::<String>::new();
        let h = Arc::clone(&hits);
        s.on_complete(move |r| {
            assert_eq!(r.unwrap(), "done");
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        s.settle_value("done".into()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_after_settlement_fires_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let s = Settlable::failed(RemoteError::Unauthorized);
        let h = Arc::clone(&hits);
        s.on_result(
            |_: u8| panic!("must not succeed"),
            move |e| {
                assert!(matches!(e, RemoteError::Unauthorized));
                h.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_callback_rejected() {
        let s = Settlable::<u8>::new();
        s.on_complete(|_| {}).unwrap();
        assert!(matches!(
            s.on_complete(|_| {}),
            Err(RemoteError::CallbacksAlreadySet)
        ));
        assert!(matches!(
            s.map(|v| Ok(v + 1)),
            Err(RemoteError::CallbacksAlreadySet)
        ));
    }

    #[test]
    fn map_transforms_value() {
        let s = Settlable::succeeded(20u32);
        let derived = s.map(|v| Ok(v * 2)).unwrap();
        assert_eq!(derived.value().unwrap(), 40);
    }

    #[test]
    fn map_failure_replaces_value() {
        let s = Settlable::succeeded(20u32);
        let derived: Settlable<u32> = s
            .map(|_| Err(RemoteError::Handler("bad".into())))
            .unwrap();
        assert!(matches!(derived.value(), Err(RemoteError::Handler(_))));
    }

    #[test]
    fn map_panic_becomes_error() {
        let s = Settlable::<u32>::new();
        let derived: Settlable<u32> = s.map(|_| panic!("transform blew up")).unwrap();
        s.settle_value(1).unwrap();
        match derived.value() {
            Err(RemoteError::Panicked(msg)) => assert!(msg.contains("transform")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn map_propagates_parent_error() {
        let s = Settlable::<u32>::new();
        let derived = s.map(|v| Ok(v.to_string())).unwrap();
        s.settle_error(RemoteError::Replaced).unwrap();
        assert!(matches!(derived.value(), Err(RemoteError::Replaced)));
    }

    #[test]
    fn map_err_can_recover() {
        let s = Settlable::<u32>::failed(RemoteError::Replaced);
        let derived = s.map_err(|_| Ok(7)).unwrap();
        assert_eq!(derived.value().unwrap(), 7);
    }

    #[test]
    fn callback_panic_does_not_reach_settler() {
        let s = Settlable::<u32>::new();
        s.on_complete(|_| panic!("callback exploded")).unwrap();
        assert!(s.settle_value(3).is_ok());
        assert_eq!(s.value().unwrap(), 3);
    }

    #[tokio::test]
    async fn wait_across_tasks() {
        let s = Settlable::<String>::new();
        let settler = s.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            settler.settle_value("later".into()).unwrap();
        });
        assert_eq!(s.wait().await.unwrap(), "later");
    }

    #[tokio::test]
    async fn wait_on_abandoned_settlable() {
        let s = Settlable::<u8>::new();
        let waiter = s.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        // Dropping every handle drops the stored callback with it.
        drop(s);
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("timeout")
            .unwrap();
        assert!(matches!(result, Err(RemoteError::Abandoned)));
    }

    #[test]
    fn racing_settlers_only_one_wins() {
        let s = Settlable::<usize>::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if s.settle_value(i).is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
