//! Latest-value state broadcast to every subscribed destination.
//!
//! One stream exists per event type. Each subscriber gets its own
//! [`ChanneledReplacementLimiter`], so a slow destination only ever holds
//! the newest value per channel and never delays the others.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::juggler::EventJuggler;
use crate::limiter::{ChannelCallback, ChannelSender, ChanneledReplacementLimiter, Retry};
use crate::settle::Settlable;

/// Destination-side delivery of one state value.
pub trait StateSink<K, V>: Send + Sync {
    fn deliver(&self, channel: &K, value: V) -> Settlable<()>;
}

type SubscriberLimiter<K, V> = ChanneledReplacementLimiter<K, V, ()>;

struct Subscriber<K, V> {
    limiter: Arc<SubscriberLimiter<K, V>>,
    /// Distinguishes a re-subscription from the one a retry was made for.
    epoch: u64,
}

struct StreamState<K, V, D> {
    latest: HashMap<K, Option<V>>,
    subscribers: HashMap<D, Subscriber<K, V>>,
    next_epoch: u64,
}

// ── OutgoingStateEventStream ─────────────────────────────────────

pub struct OutgoingStateEventStream<K, V, D> {
    event_type: String,
    state: Arc<Mutex<StreamState<K, V, D>>>,
    retry_delay: Duration,
    runtime: Option<Handle>,
}

impl<K, V, D> OutgoingStateEventStream<K, V, D>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a stream. Failed deliveries are retried after `retry_delay`
    /// on the tokio runtime current at construction, if any.
    pub fn new(event_type: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            event_type: event_type.into(),
            state: Arc::new(Mutex::new(StreamState {
                latest: HashMap::new(),
                subscribers: HashMap::new(),
                next_epoch: 0,
            })),
            retry_delay,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn add_channel(&self, channel: K) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if state.latest.contains_key(&channel) {
            return Err(RemoteError::DuplicateChannel(format!("{channel:?}")));
        }
        for subscriber in state.subscribers.values() {
            subscriber.limiter.add_channel(channel.clone())?;
        }
        state.latest.insert(channel, None);
        Ok(())
    }

    pub fn remove_channel(&self, channel: &K) -> bool {
        let mut state = self.state.lock();
        if state.latest.remove(channel).is_none() {
            return false;
        }
        for subscriber in state.subscribers.values() {
            subscriber.limiter.remove_channel(channel);
        }
        true
    }

    /// Record `value` as the latest for `channel` and forward it to every
    /// subscriber.
    ///
    /// Fan-out happens under the stream lock so that publishes and
    /// subscribe replays reach each limiter in the order they were
    /// recorded. Limiter sends only hand off to the sink; sinks must not
    /// call back into the stream.
    pub fn publish(&self, channel: &K, value: V) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        let Some(latest) = state.latest.get_mut(channel) else {
            return Err(RemoteError::UnknownChannel(format!("{channel:?}")));
        };
        *latest = Some(value.clone());
        for subscriber in state.subscribers.values() {
            if let Err(e) = subscriber.limiter.send(channel, value.clone()) {
                debug!("{}: skipped fan-out: {e}", self.event_type);
            }
        }
        Ok(())
    }

    /// Subscribe `destination`, replacing an earlier subscription, and
    /// replay every channel's latest value to it.
    pub fn subscribe(&self, destination: D, sink: Arc<dyn StateSink<K, V>>) {
        let mut state = self.state.lock();
        let epoch = state.next_epoch;
        state.next_epoch += 1;

        let callback = Arc::new(RetryLater {
            event_type: self.event_type.clone(),
            destination: destination.clone(),
            epoch,
            state: Arc::downgrade(&self.state),
            delay: self.retry_delay,
            runtime: self.runtime.clone(),
        });
        let limiter = Arc::new(ChanneledReplacementLimiter::new(
            Arc::new(SinkSender { sink }) as Arc<dyn ChannelSender<K, V, ()>>,
            callback as Arc<dyn ChannelCallback<K, V, ()>>,
        ));
        for (channel, latest) in &state.latest {
            // Fresh limiter: channels cannot collide.
            let _ = limiter.add_channel(channel.clone());
            if let Some(value) = latest {
                let _ = limiter.send(channel, value.clone());
            }
        }
        state
            .subscribers
            .insert(destination, Subscriber { limiter, epoch });
    }

    pub fn unsubscribe(&self, destination: &D) -> bool {
        self.state.lock().subscribers.remove(destination).is_some()
    }

    pub fn latest(&self, channel: &K) -> Option<V> {
        self.state.lock().latest.get(channel).cloned().flatten()
    }

    pub fn channels(&self) -> Vec<K> {
        self.state.lock().latest.keys().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

// ── Limiter adapters ─────────────────────────────────────────────

struct SinkSender<K, V> {
    sink: Arc<dyn StateSink<K, V>>,
}

impl<K, V> ChannelSender<K, V, ()> for SinkSender<K, V> {
    fn send(&self, channel: &K, value: V) -> Settlable<()> {
        self.sink.deliver(channel, value)
    }
}

/// Schedules a delayed retry for a failed delivery, unless the
/// destination has since unsubscribed or re-subscribed.
struct RetryLater<K, V, D> {
    event_type: String,
    destination: D,
    epoch: u64,
    state: Weak<Mutex<StreamState<K, V, D>>>,
    delay: Duration,
    runtime: Option<Handle>,
}

impl<K, V, D> ChannelCallback<K, V, ()> for RetryLater<K, V, D>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn failed(&self, channel: &K, error: &RemoteError, retry: Retry<V, ()>) {
        if matches!(error, RemoteError::Replaced) {
            return;
        }
        warn!(
            "{}: delivery of {channel:?} to {:?} failed: {error}",
            self.event_type, self.destination
        );
        let Some(runtime) = &self.runtime else {
            warn!("{}: no runtime, dropping retry", self.event_type);
            return;
        };

        let state = self.state.clone();
        let destination = self.destination.clone();
        let epoch = self.epoch;
        let delay = self.delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = state.upgrade().is_some_and(|state| {
                state
                    .lock()
                    .subscribers
                    .get(&destination)
                    .is_some_and(|s| s.epoch == epoch)
            });
            if current {
                let _ = retry.retry();
            } else {
                debug!("retry for {destination:?} dropped: no longer subscribed");
            }
        });
    }
}

// ── JugglerSink ──────────────────────────────────────────────────

/// Delivers state values to a connection as outbound events of the form
/// `<event_type> <channel> <value>`.
#[derive(Clone)]
pub struct JugglerSink {
    juggler: EventJuggler,
    event_type: String,
}

impl JugglerSink {
    pub fn new(juggler: EventJuggler, event_type: impl Into<String>) -> Self {
        Self {
            juggler,
            event_type: event_type.into(),
        }
    }
}

impl<K: Display, V: Display> StateSink<K, V> for JugglerSink {
    fn deliver(&self, channel: &K, value: V) -> Settlable<()> {
        let event = self
            .juggler
            .send_event(format!("{} {channel} {value}", self.event_type));
        event.map(|_| Ok(())).unwrap_or_else(Settlable::failed)
    }
}

// ── Tests ────────────────────────────────────────────────────────
