// src/stream.rs
//! Disconnect notification channels.
//!
//! One topic per connection id. Every registry holding that connection
//! subscribes; publishing the connection id on the topic notifies all of
//! them. Subscription handles are durable: they outlive the callback that
//! was attached to them, can be enumerated per subscriber, and can be
//! resumed with a fresh callback after the subscriber is reactivated.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Well-known namespace of the per-connection disconnect channels.
pub const DISCONNECT_NAMESPACE: &str = "backplane.client-disconnect";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("unknown subscription handle {0}")]
    UnknownHandle(u64),

    #[error("stream provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTopic {
    pub namespace: String,
    pub key: String,
}

impl StreamTopic {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// The disconnect channel of `connection_id`.
    pub fn disconnect(connection_id: &str) -> Self {
        Self::new(DISCONNECT_NAMESPACE, connection_id)
    }
}

impl fmt::Display for StreamTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: StreamTopic,
    /// Address of the owning subscriber.
    pub subscriber: String,
}

/// Invoked with the published payload.
pub type StreamCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait DisconnectStream: Send + Sync {
    async fn subscribe(
        &self,
        topic: &StreamTopic,
        subscriber: &str,
        callback: StreamCallback,
    ) -> Result<SubscriptionHandle, StreamError>;

    /// Live handles on `topic` owned by `subscriber`.
    async fn handles(
        &self,
        topic: &StreamTopic,
        subscriber: &str,
    ) -> Result<Vec<SubscriptionHandle>, StreamError>;

    /// Attach `callback` to an existing handle, replacing any previous one.
    async fn resume(
        &self,
        handle: &SubscriptionHandle,
        callback: StreamCallback,
    ) -> Result<SubscriptionHandle, StreamError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StreamError>;

    /// Notify every subscriber of `topic`. Returns how many callbacks ran.
    async fn publish(&self, topic: &StreamTopic, payload: String) -> Result<usize, StreamError>;
}

struct Subscription {
    handle: SubscriptionHandle,
    callback: Option<StreamCallback>,
}

/// Process-local stream provider.
#[derive(Default)]
pub struct InMemoryStreams {
    topics: DashMap<StreamTopic, Vec<Subscription>>,
    next_id: AtomicU64,
}

impl InMemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live handles on `topic`, across all subscribers.
    pub fn subscriber_count(&self, topic: &StreamTopic) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Number of live handles across every topic.
    pub fn handle_count(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drop every attached callback while keeping the handles, as happens
    /// when the process hosting the subscribers goes away.
    pub fn detach_all(&self) {
        for mut entry in self.topics.iter_mut() {
            for sub in entry.value_mut().iter_mut() {
                sub.callback = None;
            }
        }
    }
}

#[async_trait]
impl DisconnectStream for InMemoryStreams {
    async fn subscribe(
        &self,
        topic: &StreamTopic,
        subscriber: &str,
        callback: StreamCallback,
    ) -> Result<SubscriptionHandle, StreamError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SubscriptionHandle {
            id,
            topic: topic.clone(),
            subscriber: subscriber.to_string(),
        };
        self.topics.entry(topic.clone()).or_default().push(Subscription {
            handle: handle.clone(),
            callback: Some(callback),
        });
        trace!(%topic, subscriber, handle = id, "subscribed");
        Ok(handle)
    }

    async fn handles(
        &self,
        topic: &StreamTopic,
        subscriber: &str,
    ) -> Result<Vec<SubscriptionHandle>, StreamError> {
        Ok(self
            .topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.handle.subscriber == subscriber)
                    .map(|s| s.handle.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resume(
        &self,
        handle: &SubscriptionHandle,
        callback: StreamCallback,
    ) -> Result<SubscriptionHandle, StreamError> {
        let mut subs = self
            .topics
            .get_mut(&handle.topic)
            .ok_or(StreamError::UnknownHandle(handle.id))?;
        let sub = subs
            .iter_mut()
            .find(|s| s.handle.id == handle.id)
            .ok_or(StreamError::UnknownHandle(handle.id))?;
        sub.callback = Some(callback);
        trace!(topic = %handle.topic, handle = handle.id, "subscription resumed");
        Ok(sub.handle.clone())
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StreamError> {
        // Removing an already-removed handle is fine; cleanup may retry.
        let now_empty = match self.topics.get_mut(&handle.topic) {
            Some(mut subs) => {
                subs.retain(|s| s.handle.id != handle.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(&handle.topic, |_, subs| subs.is_empty());
        }
        trace!(topic = %handle.topic, handle = handle.id, "unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &StreamTopic, payload: String) -> Result<usize, StreamError> {
        let callbacks: Vec<StreamCallback> = match self.topics.get(topic) {
            Some(subs) => {
                let detached = subs.iter().filter(|s| s.callback.is_none()).count();
                if detached > 0 {
                    debug!(%topic, detached, "skipping subscriptions without a callback");
                }
                subs.iter().filter_map(|s| s.callback.clone()).collect()
            }
            None => Vec::new(),
        };
        let notified = callbacks.len();
        join_all(callbacks.into_iter().map(|cb| cb(payload.clone()))).await;
        trace!(%topic, notified, "published");
        Ok(notified)
    }
}
