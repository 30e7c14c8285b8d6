//! Pairing sessions and the paired-device registry.
//!
//! ```text
//!   idle ──start_pairing──► session active ──pair(right code)──► token issued ──► idle
//!                               │
//!                               ├──pair(wrong code)───────────────────────────► idle
//!                               ├──last cancel_pairing────────────────────────► idle
//!                               └──abort_pairing──────────────────────────────► idle
//! ```
//!
//! At most one session exists at a time. Every connection waiting in it
//! registers a cancel callback; ending the session notifies the waiters
//! that did not end it themselves.

mod store;

pub use store::{MemoryPairingStore, PairingRecord, PairingStore};

use std::ops::RangeInclusive;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{error, info, warn};

use crate::error::{RemoteError, panic_message};

/// Invoked when a pairing wait is cancelled by someone else.
/// Identity is the `Arc` pointer.
pub type CancelCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque id of a confirmation shown on the receiver's screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfirmationHandle(pub u64);

/// Whatever shows the pairing code and certificate fingerprint to the
/// person at the receiver.
pub trait ConfirmationSurface: Send + Sync {
    /// Show the code. Returns `NotReady` when nothing can be shown.
    fn show(&self, code: &str, fingerprint: &str) -> Result<ConfirmationHandle, RemoteError>;

    fn dismiss(&self, handle: ConfirmationHandle);
}

/// What the receiver knows about the remote that is pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub friendly_name: Option<String>,
}

struct Session {
    code: String,
    handle: ConfirmationHandle,
    cancels: Vec<CancelCallback>,
}

// ── PairingManager ───────────────────────────────────────────────

pub struct PairingManager {
    session: Mutex<Option<Session>>,
    surface: Arc<dyn ConfirmationSurface>,
    store: Arc<dyn PairingStore>,
    fingerprint: String,
    token_length: RangeInclusive<usize>,
}

impl PairingManager {
    pub fn new(
        surface: Arc<dyn ConfirmationSurface>,
        store: Arc<dyn PairingStore>,
        fingerprint: impl Into<String>,
        token_length: RangeInclusive<usize>,
    ) -> Self {
        let min = (*token_length.start()).max(1);
        let max = (*token_length.end()).max(min);
        Self {
            session: Mutex::new(None),
            surface,
            store,
            fingerprint: fingerprint.into(),
            token_length: min..=max,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_pairing(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Join the pairing session, creating it if needed. Returns whether a
    /// new session was created.
    pub fn start_pairing(&self, cancel: CancelCallback) -> Result<bool, RemoteError> {
        let mut session = self.session.lock();
        let created = match session.as_ref() {
            Some(_) => false,
            None => {
                let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
                let handle = self.surface.show(&code, &self.fingerprint)?;
                info!("pairing session started");
                *session = Some(Session {
                    code,
                    handle,
                    cancels: Vec::new(),
                });
                true
            }
        };
        if let Some(active) = session.as_mut() {
            if !active.cancels.iter().any(|c| Arc::ptr_eq(c, &cancel)) {
                active.cancels.push(cancel);
            }
        }
        Ok(created)
    }

    /// Try to complete pairing with `code`.
    ///
    /// Any attempt ends the session. Other waiters are notified through
    /// their cancel callbacks. Returns the new auth token on a match.
    pub fn pair(
        &self,
        code: &str,
        cancel: &CancelCallback,
        peer: &PeerInfo,
    ) -> Result<Option<String>, RemoteError> {
        let Some(mut session) = self.session.lock().take() else {
            return Ok(None);
        };
        session.cancels.retain(|c| !Arc::ptr_eq(c, cancel));
        self.end_session(session.handle, session.cancels);

        if !codes_match(&session.code, code.trim()) {
            warn!("pairing attempt from {} used a wrong code", peer.address);
            return Ok(None);
        }

        let token = self.issue_token();
        let record = PairingRecord {
            token: token.clone(),
            friendly_name: peer.friendly_name.clone(),
            last_connected_address: peer.address.clone(),
            last_connected_time: SystemTime::now(),
            device_type: None,
        };
        if let Err(e) = self.store.store(record) {
            error!("failed to persist pairing for {}: {e}", peer.address);
            notify(cancel);
            return Err(e);
        }
        info!("paired {}", peer.address);
        Ok(Some(token))
    }

    /// Withdraw a waiter. The session ends when the last waiter leaves.
    /// Returns whether `cancel` was registered.
    pub fn cancel_pairing(&self, cancel: &CancelCallback) -> bool {
        let ended = {
            let mut session = self.session.lock();
            let Some(active) = session.as_mut() else {
                return false;
            };
            let before = active.cancels.len();
            active.cancels.retain(|c| !Arc::ptr_eq(c, cancel));
            if active.cancels.len() == before {
                return false;
            }
            if active.cancels.is_empty() {
                session.take()
            } else {
                None
            }
        };
        if let Some(session) = ended {
            info!("pairing session cancelled");
            self.end_session(session.handle, Vec::new());
        }
        true
    }

    /// Operator dismissal: end the session and notify every waiter.
    pub fn abort_pairing(&self) -> bool {
        let session = self.session.lock().take();
        match session {
            Some(session) => {
                info!("pairing session aborted");
                self.end_session(session.handle, session.cancels);
                true
            }
            None => false,
        }
    }

    pub fn fetch_pairing_data(&self, token: &str) -> Result<Option<PairingRecord>, RemoteError> {
        self.store.lookup(token)
    }

    /// Stamp a reconnect on the record for `token`.
    pub fn record_connection(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Option<PairingRecord>, RemoteError> {
        self.modify(token, |record| {
            record.last_connected_address = address.to_string();
            record.last_connected_time = SystemTime::now();
        })
    }

    /// Apply peer-supplied metadata. `None` leaves a field unchanged.
    pub fn update_metadata(
        &self,
        token: &str,
        device_type: Option<String>,
        friendly_name: Option<String>,
    ) -> Result<Option<PairingRecord>, RemoteError> {
        self.modify(token, |record| {
            if device_type.is_some() {
                record.device_type = device_type;
            }
            if friendly_name.is_some() {
                record.friendly_name = friendly_name;
            }
        })
    }

    fn modify<F>(&self, token: &str, f: F) -> Result<Option<PairingRecord>, RemoteError>
    where
        F: FnOnce(&mut PairingRecord),
    {
        let Some(mut record) = self.store.lookup(token)? else {
            return Ok(None);
        };
        f(&mut record);
        self.store.store(record.clone())?;
        Ok(Some(record))
    }

    fn end_session(&self, handle: ConfirmationHandle, waiters: Vec<CancelCallback>) {
        self.surface.dismiss(handle);
        for waiter in &waiters {
            notify(waiter);
        }
    }

    fn issue_token(&self) -> String {
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(self.token_length.clone());
        (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

impl std::fmt::Debug for PairingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingManager")
            .field("pairing", &self.is_pairing())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Compare without short-circuiting on the first differing digit.
fn codes_match(expected: &str, offered: &str) -> bool {
    expected.len() == offered.len()
        && expected
            .bytes()
            .zip(offered.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn notify(cancel: &CancelCallback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cancel())) {
        error!(
            "pairing cancel callback panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Screen {
        shown: Mutex<Vec<(String, String)>>,
        dismissed: AtomicUsize,
        unavailable: AtomicBool,
    }

    impl ConfirmationSurface for Screen {
        fn show(&self, code: &str, fingerprint: &str) -> Result<ConfirmationHandle, RemoteError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RemoteError::NotReady("no display"));
            }
            let mut shown = self.shown.lock();
            shown.push((code.to_string(), fingerprint.to_string()));
            Ok(ConfirmationHandle(shown.len() as u64))
        }

        fn dismiss(&self, _handle: ConfirmationHandle) {
            self.dismissed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Screen {
        fn code(&self) -> String {
            self.shown.lock().last().unwrap().0.clone()
        }
    }

    struct FailingStore;

    impl PairingStore for FailingStore {
        fn lookup(&self, _token: &str) -> Result<Option<PairingRecord>, RemoteError> {
            Ok(None)
        }

        fn store(&self, _record: PairingRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Store("disk full".into()))
        }
    }

    fn manager() -> (PairingManager, Arc<Screen>) {
        let screen = Arc::new(Screen::default());
        let manager = PairingManager::new(
            screen.clone(),
            Arc::new(MemoryPairingStore::new()),
            "AA:BB",
            24..=48,
        );
        (manager, screen)
    }

    fn counter() -> (CancelCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let cb: CancelCallback = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    fn peer() -> PeerInfo {
        PeerInfo {
            address: "10.0.0.5".into(),
            friendly_name: Some("Phone".into()),
        }
    }

    #[test]
    fn right_code_issues_token() {
        let (manager, screen) = manager();
        let (cancel, cancelled) = counter();
        assert!(manager.start_pairing(cancel.clone()).unwrap());
        let code = screen.code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(screen.shown.lock()[0].1, "AA:BB");

        let token = manager.pair(&code, &cancel, &peer()).unwrap().unwrap();
        assert!((24..=48).contains(&token.len()));
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(screen.dismissed.load(Ordering::SeqCst), 1);
        assert!(!manager.is_pairing());

        let record = manager.fetch_pairing_data(&token).unwrap().unwrap();
        assert_eq!(record.last_connected_address, "10.0.0.5");
        assert_eq!(record.friendly_name.as_deref(), Some("Phone"));
    }

    #[test]
    fn wrong_code_ends_session() {
        let (manager, screen) = manager();
        let (cancel, _) = counter();
        manager.start_pairing(cancel.clone()).unwrap();
        let code = screen.code();
        let wrong = if code == "000000" { "000001" } else { "000000" };

        assert_eq!(manager.pair(wrong, &cancel, &peer()).unwrap(), None);
        assert!(!manager.is_pairing());
        // The right code no longer helps once the session is gone.
        assert_eq!(manager.pair(&code, &cancel, &peer()).unwrap(), None);
    }

    #[test]
    fn pairing_notifies_other_waiters() {
        let (manager, screen) = manager();
        let (a, a_cancelled) = counter();
        let (b, b_cancelled) = counter();
        assert!(manager.start_pairing(a.clone()).unwrap());
        assert!(!manager.start_pairing(b.clone()).unwrap());
        assert_eq!(screen.shown.lock().len(), 1);

        manager.pair(&screen.code(), &a, &peer()).unwrap().unwrap();
        assert_eq!(a_cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(b_cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_cancel_tears_down() {
        let (manager, screen) = manager();
        let (a, a_cancelled) = counter();
        let (b, _) = counter();
        manager.start_pairing(a.clone()).unwrap();
        manager.start_pairing(b.clone()).unwrap();

        assert!(manager.cancel_pairing(&a));
        assert!(manager.is_pairing());
        assert!(!manager.cancel_pairing(&a));
        assert!(manager.cancel_pairing(&b));
        assert!(!manager.is_pairing());
        assert_eq!(screen.dismissed.load(Ordering::SeqCst), 1);
        assert_eq!(a_cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_notifies_everyone() {
        let (manager, screen) = manager();
        let (a, a_cancelled) = counter();
        let (b, b_cancelled) = counter();
        manager.start_pairing(a).unwrap();
        manager.start_pairing(b).unwrap();

        assert!(manager.abort_pairing());
        assert!(!manager.abort_pairing());
        assert_eq!(a_cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(b_cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(screen.dismissed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_surface_is_not_ready() {
        let (manager, screen) = manager();
        screen.unavailable.store(true, Ordering::SeqCst);
        let (cancel, _) = counter();
        assert!(matches!(
            manager.start_pairing(cancel),
            Err(RemoteError::NotReady(_))
        ));
        assert!(!manager.is_pairing());
    }

    #[test]
    fn pair_without_session_is_none() {
        let (manager, _) = manager();
        let (cancel, _) = counter();
        assert_eq!(manager.pair("123456", &cancel, &peer()).unwrap(), None);
    }

    #[test]
    fn store_failure_cancels_caller() {
        let screen = Arc::new(Screen::default());
        let manager = PairingManager::new(screen.clone(), Arc::new(FailingStore), "AA", 24..=48);
        let (cancel, cancelled) = counter();
        manager.start_pairing(cancel.clone()).unwrap();
        let result = manager.pair(&screen.code(), &cancel, &peer());
        assert!(matches!(result, Err(RemoteError::Store(_))));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_and_metadata_update_record() {
        let (manager, screen) = manager();
        let (cancel, _) = counter();
        manager.start_pairing(cancel.clone()).unwrap();
        let token = manager
            .pair(&screen.code(), &cancel, &peer())
            .unwrap()
            .unwrap();

        let record = manager
            .record_connection(&token, "10.0.0.9")
            .unwrap()
            .unwrap();
        assert_eq!(record.last_connected_address, "10.0.0.9");

        let record = manager
            .update_metadata(&token, Some("tablet".into()), None)
            .unwrap()
            .unwrap();
        assert_eq!(record.device_type.as_deref(), Some("tablet"));
        assert_eq!(record.friendly_name.as_deref(), Some("Phone"));

        assert_eq!(manager.record_connection("unknown", "x").unwrap(), None);
    }

    #[test]
    fn token_length_bounds_are_sanitised() {
        let (min, max) = (10, 5);
        let manager = PairingManager::new(
            Arc::new(Screen::default()),
            Arc::new(MemoryPairingStore::new()),
            "AA",
            min..=max,
        );
        assert_eq!(manager.issue_token().len(), 10);
    }
}
