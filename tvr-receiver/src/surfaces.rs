//! Console stand-ins for the confirmation UI and the input backend.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;
use tvr_core::{
    Capabilities, ConfirmationHandle, ConfirmationSurface, Direction, MediaAction, RemoteError,
};

// ── LogConfirmationSurface ───────────────────────────────────────

/// Shows pairing codes in the log.
#[derive(Debug, Default)]
pub struct LogConfirmationSurface {
    next: AtomicU64,
}

impl LogConfirmationSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfirmationSurface for LogConfirmationSurface {
    fn show(&self, code: &str, fingerprint: &str) -> Result<ConfirmationHandle, RemoteError> {
        let handle = ConfirmationHandle(self.next.fetch_add(1, Ordering::Relaxed));
        info!("pairing code: {code}  (certificate {fingerprint})");
        Ok(handle)
    }

    fn dismiss(&self, handle: ConfirmationHandle) {
        info!("pairing prompt {} dismissed", handle.0);
    }
}

// ── LoggingCapabilities ──────────────────────────────────────────

/// Accepts every operation and logs it.
#[derive(Debug, Default)]
pub struct LoggingCapabilities;

#[async_trait]
impl Capabilities for LoggingCapabilities {
    async fn key(&self, code: u32) -> Result<(), RemoteError> {
        info!("key {code}");
        Ok(())
    }

    async fn dpad(&self, direction: Direction) -> Result<(), RemoteError> {
        info!("dpad {direction:?}");
        Ok(())
    }

    async fn cursor_move(&self, dx: i32, dy: i32) -> Result<(), RemoteError> {
        info!("move {dx},{dy}");
        Ok(())
    }

    async fn click(&self) -> Result<(), RemoteError> {
        info!("click");
        Ok(())
    }

    async fn scroll(&self, dx: i32, dy: i32) -> Result<(), RemoteError> {
        info!("scroll {dx},{dy}");
        Ok(())
    }

    async fn volume(&self, delta: i32) -> Result<(), RemoteError> {
        info!("volume {delta:+}");
        Ok(())
    }

    async fn media(&self, action: MediaAction) -> Result<(), RemoteError> {
        info!("media {action:?}");
        Ok(())
    }

    async fn text(&self, text: &str) -> Result<(), RemoteError> {
        info!("text {text:?}");
        Ok(())
    }

    async fn launch(&self, target: &str) -> Result<(), RemoteError> {
        info!("launch {target}");
        Ok(())
    }

    async fn back(&self) -> Result<(), RemoteError> {
        info!("back");
        Ok(())
    }

    async fn home(&self) -> Result<(), RemoteError> {
        info!("home");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_distinct() {
        let surface = LogConfirmationSurface::new();
        let a = surface.show("123456", "FP").unwrap();
        let b = surface.show("654321", "FP").unwrap();
        assert_ne!(a, b);
        surface.dismiss(a);
    }

    #[tokio::test]
    async fn accepts_everything() {
        let caps = LoggingCapabilities;
        caps.key(4).await.unwrap();
        caps.text("hi").await.unwrap();
        caps.media(MediaAction::Pause).await.unwrap();
    }
}
