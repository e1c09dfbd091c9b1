// src/registry.rs
//! Connection registry actor.
//!
//! One instance per entity address. Owns the confirmed member set (persisted
//! through [`StateStore`]), keeps one disconnect subscription per member, fans
//! invocations out to members, and tears down subscriptions of removed
//! members from a periodic cleanup pass rather than inline in `remove`.
//!
//! The actor itself is plain state plus async methods; serialization of
//! calls is provided by the activation run loop.

use crate::activation::ActivationTable;
use crate::dispatch::{self, ConnectionSink};
use crate::error::{BackplaneError, Result};
use crate::key::EntityKey;
use crate::message::InvocationMessage;
use crate::store::{RegistryState, StateStore};
use crate::stream::{DisconnectStream, StreamCallback, StreamError, StreamTopic};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Lifecycle of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No backing state.
    Dormant,
    /// Non-empty member set, subscriptions live.
    Active,
    /// Member set just emptied; the persisted record is being cleared.
    Draining,
}

/// Read-only view of a registry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub phase: Phase,
    /// Sorted.
    pub members: Vec<String>,
    /// Ids whose subscriptions still await teardown. Sorted.
    pub pending_unsubscribe: Vec<String>,
    /// Whether backing state exists (possibly not yet written).
    pub has_state: bool,
}

/// Collaborators shared by every registry of a backplane.
#[derive(Clone)]
pub(crate) struct Env {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) streams: Arc<dyn DisconnectStream>,
    pub(crate) sink: Arc<dyn ConnectionSink>,
    /// Route for disconnect callbacks. Weak so a dropped backplane stops reacting.
    pub(crate) router: Weak<ActivationTable>,
}

pub(crate) struct RegistryActor {
    key: EntityKey,
    address: String,
    state: Option<RegistryState>,
    /// In-memory only; never persisted.
    pending: HashSet<String>,
    phase: Phase,
    env: Env,
}

impl RegistryActor {
    pub(crate) fn new(key: EntityKey, env: Env) -> Self {
        let address = key.address();
        Self {
            key,
            address,
            state: None,
            pending: HashSet::new(),
            phase: Phase::Dormant,
            env,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Load persisted state and re-attach disconnect monitoring for every
    /// persisted member. Members with no subscription left stay unmonitored
    /// until they are added again.
    ///
    /// Only members are looked up. A handle subscribed for an id whose add
    /// never reached the store (process lost between subscribe and write)
    /// is neither resumed nor reclaimed here; it stays in the provider with
    /// no callback until that id is added and removed again.
    pub(crate) async fn activate(&mut self) -> Result<()> {
        self.state = self.env.store.read(&self.address).await?;
        self.settle_phase();

        let members: Vec<String> = match &self.state {
            Some(state) => state.connections.iter().cloned().collect(),
            None => return Ok(()),
        };
        let outcomes = join_all(members.iter().map(|id| self.resume_member(id))).await;

        let mut resumed = 0;
        let mut unmonitored = 0;
        for (id, outcome) in members.iter().zip(outcomes) {
            match outcome {
                Ok(0) => {
                    unmonitored += 1;
                    debug!(address = %self.address, connection_id = %id, "no subscription to resume");
                }
                Ok(_) => resumed += 1,
                Err(e) => {
                    unmonitored += 1;
                    warn!(address = %self.address, connection_id = %id, error = %e, "resume failed");
                }
            }
        }
        debug!(
            address = %self.address,
            members = members.len(),
            resumed,
            unmonitored,
            "registry activated"
        );
        Ok(())
    }

    /// Final cleanup pass before the instance is dropped.
    pub(crate) async fn deactivate(&mut self) {
        if let Err(e) = self.cleanup().await {
            warn!(address = %self.address, error = %e, "cleanup at deactivation failed");
        }
        debug!(address = %self.address, pending = self.pending.len(), "registry deactivated");
    }

    pub(crate) async fn add(&mut self, connection_id: String) -> Result<()> {
        if self.is_member(&connection_id) {
            trace!(address = %self.address, %connection_id, "already a member");
            return Ok(());
        }

        self.state
            .get_or_insert_with(RegistryState::default)
            .connections
            .insert(connection_id.clone());

        if let Err(e) = self.subscribe_member(&connection_id).await {
            self.rollback_add(&connection_id);
            return Err(e.into());
        }
        if let Err(e) = self.persist().await {
            // The fresh subscription is now orphaned; let cleanup reclaim it.
            self.rollback_add(&connection_id);
            self.pending.insert(connection_id);
            return Err(e);
        }

        self.phase = Phase::Active;
        debug!(address = %self.address, %connection_id, members = self.count(), "member added");
        Ok(())
    }

    /// Returns whether `connection_id` was a member.
    pub(crate) async fn remove(&mut self, connection_id: &str) -> Result<bool> {
        // Marked even for non-members: a stray subscription may still exist.
        self.pending.insert(connection_id.to_string());

        let Some(state) = self.state.as_mut() else {
            trace!(address = %self.address, %connection_id, "remove on dormant registry");
            return Ok(false);
        };
        let removed = state.connections.remove(connection_id);
        let emptied = state.connections.is_empty();

        let written = if emptied {
            self.phase = Phase::Draining;
            self.env.store.clear(&self.address).await.map_err(BackplaneError::from)
        } else if removed {
            self.persist().await
        } else {
            return Ok(false);
        };

        // Memory never runs ahead of the record: a failed write keeps the member.
        if let Err(e) = written {
            if removed {
                self.state
                    .get_or_insert_with(RegistryState::default)
                    .connections
                    .insert(connection_id.to_string());
                self.pending.remove(connection_id);
            }
            self.settle_phase();
            warn!(address = %self.address, %connection_id, error = %e, "remove not persisted");
            return Err(e);
        }

        if emptied {
            self.state = None;
            self.phase = Phase::Dormant;
            debug!(address = %self.address, %connection_id, "last member removed, state cleared");
        } else {
            debug!(address = %self.address, %connection_id, members = self.count(), "member removed");
        }
        Ok(removed)
    }

    /// Issue one detached delivery per member not in `excluded`.
    pub(crate) fn send(&self, message: Arc<InvocationMessage>, excluded: &[String]) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let excluded: HashSet<&str> = excluded.iter().map(String::as_str).collect();
        let targets = state
            .connections
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .cloned();
        dispatch::fan_out(&self.env.sink, self.key.hub(), targets, message)
    }

    pub(crate) fn count(&self) -> usize {
        self.state.as_ref().map(|s| s.connections.len()).unwrap_or(0)
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        let mut members: Vec<String> = self
            .state
            .as_ref()
            .map(|s| s.connections.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        let mut pending_unsubscribe: Vec<String> = self.pending.iter().cloned().collect();
        pending_unsubscribe.sort();
        RegistrySnapshot {
            phase: self.phase,
            members,
            pending_unsubscribe,
            has_state: self.state.is_some(),
        }
    }

    /// Tear down the subscriptions of every pending id. An id leaves the
    /// pending set only once all of its handles are confirmed unsubscribed;
    /// failed ids stay for the next pass. Returns how many ids were reclaimed.
    pub(crate) async fn cleanup(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        // A pending id that became a member again keeps its subscription.
        let members: Vec<String> = self
            .pending
            .iter()
            .filter(|id| self.is_member(id))
            .cloned()
            .collect();
        for id in &members {
            self.pending.remove(id);
        }

        let ids: Vec<String> = self.pending.iter().cloned().collect();
        let outcomes = join_all(ids.iter().map(|id| self.unsubscribe_all(id))).await;

        let mut reclaimed = 0;
        let mut failure: Option<StreamError> = None;
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(handles) => {
                    trace!(address = %self.address, connection_id = %id, handles, "subscriptions reclaimed");
                    self.pending.remove(&id);
                    reclaimed += 1;
                }
                Err(e) => {
                    warn!(address = %self.address, connection_id = %id, error = %e, "unsubscribe failed, will retry");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(reclaimed),
        }
    }

    fn is_member(&self, connection_id: &str) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.connections.contains(connection_id))
    }

    fn settle_phase(&mut self) {
        self.phase = match &self.state {
            Some(state) if !state.is_empty() => Phase::Active,
            _ => Phase::Dormant,
        };
    }

    fn rollback_add(&mut self, connection_id: &str) {
        if let Some(state) = self.state.as_mut() {
            state.connections.remove(connection_id);
            if state.is_empty() {
                self.state = None;
            }
        }
        self.settle_phase();
    }

    async fn persist(&self) -> Result<()> {
        if let Some(state) = &self.state {
            self.env.store.write(&self.address, state).await?;
        }
        Ok(())
    }

    /// Subscribe to the member's disconnect channel. A subscription still
    /// awaiting teardown from an earlier removal is resumed instead of
    /// creating a second one.
    async fn subscribe_member(&mut self, connection_id: &str) -> Result<(), StreamError> {
        let topic = StreamTopic::disconnect(connection_id);
        let callback = self.disconnect_callback();

        if self.pending.contains(connection_id) {
            let handles = self.env.streams.handles(&topic, &self.address).await?;
            if let Some((first, rest)) = handles.split_first() {
                self.env.streams.resume(first, callback).await?;
                for extra in rest {
                    self.env.streams.unsubscribe(extra).await?;
                }
                self.pending.remove(connection_id);
                trace!(address = %self.address, %connection_id, "pending subscription reused");
                return Ok(());
            }
            self.pending.remove(connection_id);
        }

        self.env
            .streams
            .subscribe(&topic, &self.address, callback)
            .await?;
        Ok(())
    }

    /// Returns the number of handles resumed.
    async fn resume_member(&self, connection_id: &str) -> Result<usize, StreamError> {
        let topic = StreamTopic::disconnect(connection_id);
        let handles = self.env.streams.handles(&topic, &self.address).await?;
        if handles.is_empty() {
            return Ok(0);
        }
        let callback = self.disconnect_callback();
        let resumed = join_all(
            handles
                .iter()
                .map(|h| self.env.streams.resume(h, callback.clone())),
        )
        .await;
        resumed.into_iter().collect::<Result<Vec<_>, _>>().map(|v| v.len())
    }

    /// Returns the number of handles removed.
    async fn unsubscribe_all(&self, connection_id: &str) -> Result<usize, StreamError> {
        let topic = StreamTopic::disconnect(connection_id);
        let handles = self.env.streams.handles(&topic, &self.address).await?;
        let results = join_all(handles.iter().map(|h| self.env.streams.unsubscribe(h))).await;
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(handles.len())
    }

    /// On fire: remove the connection from this entity, activating it if needed.
    fn disconnect_callback(&self) -> StreamCallback {
        let router = self.env.router.clone();
        let key = self.key.clone();
        Arc::new(move |connection_id: String| {
            let router = router.clone();
            let key = key.clone();
            async move {
                let Some(table) = router.upgrade() else {
                    trace!(address = %key, %connection_id, "backplane gone, disconnect ignored");
                    return;
                };
                if let Err(e) = table.remove_member(&key, connection_id.clone()).await {
                    warn!(address = %key, %connection_id, error = %e, "disconnect eviction failed");
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DeliveryError;
    use crate::error::BackplaneError;
    use crate::store::{InMemoryStateStore, StoreError};
    use crate::stream::InMemoryStreams;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionSink for Recording {
        async fn send(
            &self,
            _hub: &str,
            connection_id: &str,
            _message: Arc<InvocationMessage>,
        ) -> Result<(), DeliveryError> {
            self.seen.lock().push(connection_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        streams: Arc<InMemoryStreams>,
        sink: Arc<Recording>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStateStore::new()),
                streams: Arc::new(InMemoryStreams::new()),
                sink: Arc::new(Recording::default()),
            }
        }

        fn actor(&self) -> RegistryActor {
            let env = Env {
                store: self.store.clone(),
                streams: self.streams.clone(),
                sink: self.sink.clone(),
                router: Weak::new(),
            };
            RegistryActor::new(EntityKey::group("chat", "room").unwrap(), env)
        }

        fn actor_on(&self, store: Arc<dyn StateStore>) -> RegistryActor {
            let env = Env {
                store,
                streams: self.streams.clone(),
                sink: self.sink.clone(),
                router: Weak::new(),
            };
            RegistryActor::new(EntityKey::group("chat", "room").unwrap(), env)
        }
    }

    /// Store whose writes and clears fail while `down` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStateStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn read(&self, address: &str) -> Result<Option<RegistryState>, StoreError> {
            self.inner.read(address).await
        }

        async fn write(&self, address: &str, state: &RegistryState) -> Result<(), StoreError> {
            self.check()?;
            self.inner.write(address, state).await
        }

        async fn clear(&self, address: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.clear(address).await
        }
    }

    #[tokio::test]
    async fn duplicate_add_writes_once() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();

        actor.add("a".into()).await.unwrap();
        actor.add("a".into()).await.unwrap();

        assert_eq!(actor.count(), 1);
        assert_eq!(fx.store.stats().writes, 1);
        assert_eq!(fx.streams.handle_count(), 1);
        assert_eq!(actor.snapshot().phase, Phase::Active);
    }

    #[tokio::test]
    async fn removing_a_stranger_only_marks_it_pending() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();

        let removed = actor.remove("x").await.unwrap();

        assert!(!removed);
        let snap = actor.snapshot();
        assert_eq!(snap.members, vec!["a".to_string()]);
        assert_eq!(snap.pending_unsubscribe, vec!["x".to_string()]);
        assert_eq!(fx.store.stats().writes, 1);
    }

    #[tokio::test]
    async fn last_removal_clears_the_record() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();
        assert!(fx.store.contains(actor.address()));

        actor.remove("a").await.unwrap();

        assert_eq!(actor.count(), 0);
        assert!(!fx.store.contains(actor.address()));
        assert_eq!(fx.store.stats().clears, 1);
        let snap = actor.snapshot();
        assert_eq!(snap.phase, Phase::Dormant);
        assert!(!snap.has_state);
    }

    #[tokio::test]
    async fn cleanup_reclaims_removed_subscriptions() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();
        for id in ["a", "b", "c"] {
            actor.add(id.into()).await.unwrap();
        }
        actor.remove("a").await.unwrap();
        actor.remove("b").await.unwrap();
        assert_eq!(fx.streams.handle_count(), 3);

        let reclaimed = actor.cleanup().await.unwrap();

        assert_eq!(reclaimed, 2);
        assert!(actor.snapshot().pending_unsubscribe.is_empty());
        assert_eq!(fx.streams.handle_count(), 1);
        assert_eq!(actor.cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn readding_a_pending_member_keeps_one_subscription() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();
        actor.add("b".into()).await.unwrap();
        actor.remove("a").await.unwrap();

        actor.add("a".into()).await.unwrap();
        actor.cleanup().await.unwrap();

        let topic = StreamTopic::disconnect("a");
        assert_eq!(fx.streams.subscriber_count(&topic), 1);
        assert!(actor.snapshot().pending_unsubscribe.is_empty());
    }

    #[tokio::test]
    async fn send_skips_excluded_members() {
        let fx = Fixture::new();
        let mut actor = fx.actor();
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();
        actor.add("b".into()).await.unwrap();

        let msg = Arc::new(InvocationMessage::new("m", vec![]));
        let issued = actor.send(msg, &["a".to_string()]);
        assert_eq!(issued, 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*fx.sink.seen.lock(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn activation_restores_members_from_the_store() {
        let fx = Fixture::new();
        {
            let mut first = fx.actor();
            first.activate().await.unwrap();
            first.add("a".into()).await.unwrap();
        }

        let mut second = fx.actor();
        second.activate().await.unwrap();

        let snap = second.snapshot();
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.members, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn unpersisted_remove_keeps_the_member() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyStore::default());
        let mut actor = fx.actor_on(store.clone());
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();
        actor.add("b".into()).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = actor.remove("a").await.unwrap_err();
        assert!(matches!(err, BackplaneError::Store(StoreError::Backend(_))));
        let snap = actor.snapshot();
        assert_eq!(snap.members, vec!["a".to_string(), "b".to_string()]);
        assert!(snap.pending_unsubscribe.is_empty());

        // Cleanup must not strip the still-persisted member of its subscription.
        actor.cleanup().await.unwrap();
        assert_eq!(fx.streams.subscriber_count(&StreamTopic::disconnect("a")), 1);

        store.down.store(false, Ordering::SeqCst);
        assert!(actor.remove("a").await.unwrap());
        actor.cleanup().await.unwrap();
        actor.deactivate().await;

        let mut next = fx.actor_on(store.clone());
        next.activate().await.unwrap();
        assert_eq!(next.snapshot().members, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn failed_clear_keeps_the_last_member() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyStore::default());
        let mut actor = fx.actor_on(store.clone());
        actor.activate().await.unwrap();
        actor.add("a".into()).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        assert!(actor.remove("a").await.is_err());
        let snap = actor.snapshot();
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.members, vec!["a".to_string()]);

        store.down.store(false, Ordering::SeqCst);
        assert!(actor.remove("a").await.unwrap());
        assert!(!store.inner.contains(actor.address()));
        assert_eq!(actor.snapshot().phase, Phase::Dormant);
    }

    #[tokio::test]
    async fn activation_leaves_non_member_handles_alone() {
        let fx = Fixture::new();
        let address = EntityKey::group("chat", "room").unwrap().address();
        let noop: StreamCallback = Arc::new(|_: String| async {}.boxed());
        // Subscribed, but the process went away before the member was written.
        fx.streams
            .subscribe(&StreamTopic::disconnect("ghost"), &address, noop)
            .await
            .unwrap();
        fx.streams.detach_all();

        let mut actor = fx.actor();
        actor.activate().await.unwrap();

        assert_eq!(actor.count(), 0);
        assert_eq!(fx.streams.handle_count(), 1);
        let notified = fx
            .streams
            .publish(&StreamTopic::disconnect("ghost"), "ghost".into())
            .await
            .unwrap();
        assert_eq!(notified, 0);
    }
}
