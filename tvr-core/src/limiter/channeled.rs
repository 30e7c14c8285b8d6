//! One [`ReplacementLimiter`] per channel, sharing one sender and one
//! callback that both see which channel an event belongs to.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::{EventSender, ReplacementCallback, ReplacementLimiter, Retry};
use crate::error::RemoteError;
use crate::settle::Settlable;

/// Channel-aware [`EventSender`].
pub trait ChannelSender<K, E, R>: Send + Sync {
    fn send(&self, channel: &K, event: E) -> Settlable<R>;
}

/// Channel-aware [`ReplacementCallback`].
pub trait ChannelCallback<K, E, R>: Send + Sync {
    fn sent(&self, _channel: &K, _result: &R, _more: bool) {}

    fn failed(&self, _channel: &K, _error: &RemoteError, _retry: Retry<E, R>) {}
}

/// Binds a channel key into the shared sender and callback.
struct Bound<K, E, R> {
    channel: K,
    sender: Arc<dyn ChannelSender<K, E, R>>,
    callback: Arc<dyn ChannelCallback<K, E, R>>,
}

impl<K, E, R> EventSender<E, R> for Bound<K, E, R>
where
    K: Send + Sync,
{
    fn send(&self, event: E) -> Settlable<R> {
        self.sender.send(&self.channel, event)
    }
}

impl<K, E, R> ReplacementCallback<E, R> for Bound<K, E, R>
where
    K: Send + Sync,
{
    fn sent(&self, result: &R, more: bool) {
        self.callback.sent(&self.channel, result, more);
    }

    fn failed(&self, error: &RemoteError, retry: Retry<E, R>) {
        self.callback.failed(&self.channel, error, retry);
    }
}

// ── ChanneledReplacementLimiter ──────────────────────────────────

pub struct ChanneledReplacementLimiter<K, E, R> {
    sender: Arc<dyn ChannelSender<K, E, R>>,
    callback: Arc<dyn ChannelCallback<K, E, R>>,
    channels: Mutex<HashMap<K, Arc<ReplacementLimiter<E, R>>>>,
}

impl<K, E, R> ChanneledReplacementLimiter<K, E, R>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(
        sender: Arc<dyn ChannelSender<K, E, R>>,
        callback: Arc<dyn ChannelCallback<K, E, R>>,
    ) -> Self {
        Self {
            sender,
            callback,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_channel(&self, channel: K) -> Result<(), RemoteError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(&channel) {
            return Err(RemoteError::DuplicateChannel(format!("{channel:?}")));
        }
        let bound = Arc::new(Bound {
            channel: channel.clone(),
            sender: Arc::clone(&self.sender),
            callback: Arc::clone(&self.callback),
        });
        let limiter = ReplacementLimiter::new(
            Arc::clone(&bound) as Arc<dyn EventSender<E, R>>,
            bound as Arc<dyn ReplacementCallback<E, R>>,
        );
        channels.insert(channel, limiter);
        Ok(())
    }

    /// Returns `false` if the channel did not exist.
    pub fn remove_channel(&self, channel: &K) -> bool {
        self.channels.lock().remove(channel).is_some()
    }

    /// Submit `event` on `channel`. Sending on a channel that was never
    /// added, or was removed, is a caller error.
    pub fn send(&self, channel: &K, event: E) -> Result<Settlable<R>, RemoteError> {
        let limiter = self.channels.lock().get(channel).cloned();
        match limiter {
            Some(limiter) => Ok(limiter.send(event)),
            None => {
                error!("send on unknown channel {channel:?}");
                Err(RemoteError::UnknownChannel(format!("{channel:?}")))
            }
        }
    }

    pub fn has_channel(&self, channel: &K) -> bool {
        self.channels.lock().contains_key(channel)
    }

    pub fn channels(&self) -> Vec<K> {
        self.channels.lock().keys().cloned().collect()
    }
}
