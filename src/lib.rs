// src/lib.rs
//! Iris Backplane: clustered connection registry for real-time push messaging.
//!
//! This crate tracks which connection ids belong to which entity (a single
//! client connection, a named group, or a user), evicts members when their
//! connection's disconnect channel fires, and fans invocations out to every
//! member through a [`dispatch::ConnectionSink`].
//!
//! Each entity is served by a registry actor activated on first use; see
//! [`registry`] for the state machine. Activation, idle deactivation and the
//! cleanup timer live in the private `activation` module.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod key;
pub mod mailbox;
pub mod message;
pub mod network;
pub mod registry;
pub mod store;
pub mod stream;

mod activation;

#[cfg(feature = "subscriber")]
pub mod telemetry;

pub use config::BackplaneConfig;
pub use error::{BackplaneError, Result};
pub use key::{EntityKey, EntityKind};
pub use message::InvocationMessage;
pub use registry::{Phase, RegistrySnapshot};

use crate::activation::{ActivationTable, Command};
use crate::dispatch::ConnectionSink;
use crate::mailbox::{MailboxDirectory, MailboxReceiver};
use crate::store::{InMemoryStateStore, StateStore};
use crate::stream::{DisconnectStream, InMemoryStreams, StreamTopic};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One node's view of the backplane: the registry activation table plus the
/// mailboxes of the connections hosted here.
#[derive(Clone)]
pub struct Backplane {
    table: Arc<ActivationTable>,
    streams: Arc<dyn DisconnectStream>,
    mailboxes: Arc<MailboxDirectory>,
}

impl Backplane {
    /// Fan-out goes through `sink`; connections opened with [`Backplane::connect`]
    /// get local mailboxes that `sink` may or may not route to.
    pub fn new(
        config: BackplaneConfig,
        store: Arc<dyn StateStore>,
        streams: Arc<dyn DisconnectStream>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        let mailboxes = Arc::new(MailboxDirectory::new(config.mailbox_capacity));
        Self {
            table: ActivationTable::new(config, store, streams.clone(), sink),
            streams,
            mailboxes,
        }
    }

    /// Fan-out delivers straight into this node's connection mailboxes.
    pub fn with_local_delivery(
        config: BackplaneConfig,
        store: Arc<dyn StateStore>,
        streams: Arc<dyn DisconnectStream>,
    ) -> Self {
        let mailboxes = Arc::new(MailboxDirectory::new(config.mailbox_capacity));
        let sink: Arc<dyn ConnectionSink> = mailboxes.clone();
        Self {
            table: ActivationTable::new(config, store, streams.clone(), sink),
            streams,
            mailboxes,
        }
    }

    /// Single-node backplane with in-memory state and streams.
    pub fn in_memory(config: BackplaneConfig) -> Self {
        Self::with_local_delivery(
            config,
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryStreams::new()),
        )
    }

    pub fn config(&self) -> &BackplaneConfig {
        self.table.config()
    }

    pub fn streams(&self) -> &Arc<dyn DisconnectStream> {
        &self.streams
    }

    pub fn mailboxes(&self) -> &Arc<MailboxDirectory> {
        &self.mailboxes
    }

    // --- Registries ---

    /// Handle to the registry of `key`. Activation happens on the first call.
    pub fn registry(&self, key: &EntityKey) -> RegistryHandle {
        RegistryHandle {
            key: key.clone(),
            table: self.table.clone(),
        }
    }

    pub fn client(&self, hub: &str, connection_id: &str) -> Result<RegistryHandle> {
        Ok(self.registry(&EntityKey::client(hub, connection_id)?))
    }

    pub fn group(&self, hub: &str, group: &str) -> Result<RegistryHandle> {
        Ok(self.registry(&EntityKey::group(hub, group)?))
    }

    pub fn user(&self, hub: &str, user_id: &str) -> Result<RegistryHandle> {
        Ok(self.registry(&EntityKey::user(hub, user_id)?))
    }

    /// Number of registries currently activated on this node.
    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    pub fn is_active(&self, key: &EntityKey) -> bool {
        self.table.is_active(key)
    }

    /// Deactivate one registry now. Returns `false` if it was not active.
    pub async fn deactivate(&self, key: &EntityKey) -> bool {
        self.table.deactivate(key).await
    }

    /// Deactivate every registry, running each one's final cleanup.
    pub async fn shutdown(&self) {
        self.table.shutdown().await;
    }

    // --- Connections hosted on this node ---

    /// Open a mailbox for a new connection and register it with its own
    /// client registry.
    pub async fn connect(&self, hub: &str, connection_id: &str) -> Result<MailboxReceiver> {
        let client = self.client(hub, connection_id)?;
        let rx = self.mailboxes.open(hub, connection_id)?;
        if let Err(e) = client.add(connection_id).await {
            self.mailboxes.close(hub, connection_id);
            return Err(e);
        }
        debug!(%hub, %connection_id, "connection opened");
        Ok(rx)
    }

    /// Tear down a connection and notify every registry holding it.
    /// Returns how many registries were notified.
    pub async fn disconnect(&self, hub: &str, connection_id: &str) -> Result<usize> {
        self.mailboxes.close(hub, connection_id);
        let notified = self
            .streams
            .publish(&StreamTopic::disconnect(connection_id), connection_id.to_string())
            .await?;
        debug!(%hub, %connection_id, notified, "connection closed");
        Ok(notified)
    }
}

/// Caller-side handle to one registry. Cheap to clone; every call goes
/// through the activation table, so a handle stays valid across
/// deactivation and reactivation of its registry.
#[derive(Clone)]
pub struct RegistryHandle {
    key: EntityKey,
    table: Arc<ActivationTable>,
}

impl RegistryHandle {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Add a connection. Adding a member again is a no-op.
    pub async fn add(&self, connection_id: impl Into<String>) -> Result<()> {
        let connection_id = connection_id.into();
        self.table
            .call(&self.key, |reply| Command::Add {
                connection_id: connection_id.clone(),
                reply,
            })
            .await
    }

    /// Remove a connection. Removing a non-member is a no-op.
    pub async fn remove(&self, connection_id: impl Into<String>) -> Result<()> {
        let connection_id = connection_id.into();
        self.table
            .call(&self.key, |reply| Command::Remove {
                connection_id: connection_id.clone(),
                reply,
            })
            .await
    }

    /// Fan `message` out to every member. Deliveries are issued, not awaited;
    /// returns how many were issued.
    pub async fn send(&self, message: InvocationMessage) -> Result<usize> {
        self.dispatch(Arc::new(message), Vec::new()).await
    }

    /// Invoke `method` on every member not listed in `excluded`.
    pub async fn send_except(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        excluded: Vec<String>,
    ) -> Result<usize> {
        self.dispatch(Arc::new(InvocationMessage::new(method, args)), excluded)
            .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.table
            .call(&self.key, |reply| Command::Count { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        self.table
            .call(&self.key, |reply| Command::Snapshot { reply })
            .await
    }

    /// Run the subscription cleanup pass now instead of waiting for the timer.
    /// Returns how many pending ids were reclaimed.
    pub async fn cleanup(&self) -> Result<usize> {
        self.table
            .call(&self.key, |reply| Command::Cleanup { reply })
            .await
    }

    async fn dispatch(&self, message: Arc<InvocationMessage>, excluded: Vec<String>) -> Result<usize> {
        self.table
            .call(&self.key, |reply| Command::Send {
                message: message.clone(),
                excluded: excluded.clone(),
                reply,
            })
            .await
    }
}
