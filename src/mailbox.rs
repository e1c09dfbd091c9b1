// src/mailbox.rs
//! Per-connection mailboxes.
//!
//! Each live connection owns one mailbox. Invocations fanned out by the
//! registries land in the user lane; control signals (abort, ping) travel
//! on a separate lane and are always received first.

use crate::dispatch::{ConnectionSink, DeliveryError};
use crate::key::{EntityKey, KeyError};
use crate::message::InvocationMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Invocation = Arc<InvocationMessage>;

/// Underlying sender for invocations; either unbounded or bounded.
#[derive(Clone)]
enum InvocationSender {
    Unbounded(mpsc::UnboundedSender<Invocation>),
    Bounded(mpsc::Sender<Invocation>),
}

enum InvocationReceiver {
    Unbounded(mpsc::UnboundedReceiver<Invocation>),
    Bounded(mpsc::Receiver<Invocation>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// The connection was torn down by the server; stop reading.
    Abort,
    Ping,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    Invocation(Invocation),
    Control(Control),
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Full,
    Closed,
}

/// Sender half of a connection mailbox.
#[derive(Clone)]
pub struct MailboxSender {
    tx_user: InvocationSender,
    tx_ctl: mpsc::UnboundedSender<Control>,
    /// Invocations currently queued.
    counter: Arc<AtomicUsize>,
}

/// Receiver half, held by the connection's transport loop.
pub struct MailboxReceiver {
    rx_user: InvocationReceiver,
    rx_ctl: mpsc::UnboundedReceiver<Control>,
    counter: Arc<AtomicUsize>,
}

/// Create a new unbounded mailbox channel (sender, receiver).
pub fn channel() -> (MailboxSender, MailboxReceiver) {
    let (tx_user, rx_user) = mpsc::unbounded_channel();
    pair(InvocationSender::Unbounded(tx_user), InvocationReceiver::Unbounded(rx_user))
}

/// Create a bounded mailbox with given capacity. A full mailbox rejects
/// new invocations (drop-new policy).
pub fn bounded_channel(capacity: usize) -> (MailboxSender, MailboxReceiver) {
    let (tx_user, rx_user) = mpsc::channel(capacity);
    pair(InvocationSender::Bounded(tx_user), InvocationReceiver::Bounded(rx_user))
}

fn pair(tx_user: InvocationSender, rx_user: InvocationReceiver) -> (MailboxSender, MailboxReceiver) {
    let (tx_ctl, rx_ctl) = mpsc::unbounded_channel();
    let counter = Arc::new(AtomicUsize::new(0));
    (
        MailboxSender {
            tx_user,
            tx_ctl,
            counter: counter.clone(),
        },
        MailboxReceiver {
            rx_user,
            rx_ctl,
            counter,
        },
    )
}

impl MailboxSender {
    pub fn send(&self, msg: Invocation) -> Result<(), SendError> {
        // increment before enqueue so the receiver never underflows
        self.counter.fetch_add(1, Ordering::SeqCst);
        let res = match &self.tx_user {
            InvocationSender::Unbounded(tx) => tx.send(msg).map_err(|_| SendError::Closed),
            InvocationSender::Bounded(tx) => tx.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }),
        };
        if res.is_err() {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
        res
    }

    pub fn send_control(&self, ctl: Control) -> Result<(), SendError> {
        self.tx_ctl.send(ctl).map_err(|_| SendError::Closed)
    }

    /// Number of invocations currently queued.
    pub fn len(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MailboxReceiver {
    /// Await the next delivery, preferring control signals.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if let Ok(ctl) = self.rx_ctl.try_recv() {
            return Some(Delivery::Control(ctl));
        }

        tokio::select! {
            biased;
            ctl = self.rx_ctl.recv() => ctl.map(Delivery::Control),
            user = async {
                match &mut self.rx_user {
                    InvocationReceiver::Unbounded(rx) => rx.recv().await,
                    InvocationReceiver::Bounded(rx) => rx.recv().await,
                }
            } => {
                let m = user?;
                self.counter.fetch_sub(1, Ordering::SeqCst);
                Some(Delivery::Invocation(m))
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        if let Ok(ctl) = self.rx_ctl.try_recv() {
            return Some(Delivery::Control(ctl));
        }
        let opt = match &mut self.rx_user {
            InvocationReceiver::Unbounded(rx) => rx.try_recv().ok(),
            InvocationReceiver::Bounded(rx) => rx.try_recv().ok(),
        };
        opt.map(|m| {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            Delivery::Invocation(m)
        })
    }
}

/// Live connection mailboxes on this node, by (hub, connection id).
#[derive(Default)]
pub struct MailboxDirectory {
    mailboxes: DashMap<String, MailboxSender>,
    capacity: Option<usize>,
}

impl MailboxDirectory {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            mailboxes: DashMap::new(),
            capacity,
        }
    }

    /// Register a connection, replacing any previous mailbox under the same id.
    /// Hub and connection id follow the client key rules, so distinct pairs
    /// never share a mailbox.
    pub fn open(&self, hub: &str, connection_id: &str) -> Result<MailboxReceiver, KeyError> {
        let slot = mailbox_key(hub, connection_id)?;
        let (tx, rx) = match self.capacity {
            Some(cap) => bounded_channel(cap),
            None => channel(),
        };
        self.mailboxes.insert(slot, tx);
        Ok(rx)
    }

    /// Drop a connection's mailbox and tell its reader to stop.
    pub fn close(&self, hub: &str, connection_id: &str) -> bool {
        let Ok(slot) = mailbox_key(hub, connection_id) else {
            return false;
        };
        match self.mailboxes.remove(&slot) {
            Some((_, tx)) => {
                let _ = tx.send_control(Control::Abort);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, hub: &str, connection_id: &str) -> bool {
        mailbox_key(hub, connection_id).is_ok_and(|slot| self.mailboxes.contains_key(&slot))
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

fn mailbox_key(hub: &str, connection_id: &str) -> Result<String, KeyError> {
    let key = EntityKey::client(hub, connection_id)?;
    Ok(EntityKey::build(key.hub(), key.id()))
}

#[async_trait]
impl ConnectionSink for MailboxDirectory {
    async fn send(
        &self,
        hub: &str,
        connection_id: &str,
        message: Arc<InvocationMessage>,
    ) -> Result<(), DeliveryError> {
        let tx = mailbox_key(hub, connection_id)
            .ok()
            .and_then(|slot| self.mailboxes.get(&slot).map(|entry| entry.value().clone()))
            .ok_or_else(|| DeliveryError::UnknownConnection {
                hub: hub.to_string(),
                connection_id: connection_id.to_string(),
            })?;
        tx.send(message).map_err(|e| match e {
            SendError::Full => DeliveryError::MailboxFull(connection_id.to_string()),
            SendError::Closed => DeliveryError::MailboxClosed(connection_id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(target: &str) -> Invocation {
        Arc::new(InvocationMessage::new(target, vec![]))
    }

    fn target(d: Delivery) -> String {
        match d {
            Delivery::Invocation(m) => m.target.clone(),
            other => panic!("expected invocation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_and_recv() {
        let (tx, mut rx) = channel();
        tx.send(msg("hello")).unwrap();
        assert_eq!(tx.len(), 1);
        let got = rx.recv().await.expect("should receive");
        assert_eq!(target(got), "hello");
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn bounded_mailbox_drop_new() {
        let (tx, mut rx) = bounded_channel(2);
        tx.send(msg("m1")).unwrap();
        tx.send(msg("m2")).unwrap();
        assert_eq!(tx.send(msg("m3")), Err(SendError::Full));
        assert_eq!(tx.len(), 2);

        assert_eq!(target(rx.recv().await.unwrap()), "m1");
        assert_eq!(target(rx.recv().await.unwrap()), "m2");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn control_signals_jump_the_queue() {
        let (tx, mut rx) = channel();
        tx.send(msg("m1")).unwrap();
        tx.send_control(Control::Abort).unwrap();

        assert_eq!(rx.recv().await, Some(Delivery::Control(Control::Abort)));
        assert_eq!(target(rx.recv().await.unwrap()), "m1");
    }

    #[tokio::test]
    async fn directory_routes_by_hub_and_connection() {
        let dir = MailboxDirectory::new(None);
        let mut rx = dir.open("chat", "c1").unwrap();
        dir.send("chat", "c1", msg("hi")).await.unwrap();
        assert_eq!(target(rx.try_recv().unwrap()), "hi");

        let err = dir.send("other", "c1", msg("hi")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownConnection { .. }));

        assert!(dir.close("chat", "c1"));
        assert_eq!(rx.recv().await, Some(Delivery::Control(Control::Abort)));
        assert!(!dir.contains("chat", "c1"));
    }

    #[test]
    fn directory_rejects_ambiguous_names() {
        let dir = MailboxDirectory::new(None);
        assert!(dir.open("a:", "b").is_err());
        assert!(dir.open("a", "b::c").is_err());
        assert!(dir.open("", "c1").is_err());

        let _rx = dir.open("a", ":b").unwrap();
        assert!(dir.contains("a", ":b"));
        assert!(!dir.contains("a:", "b"));
        assert!(!dir.close("a:", "b"));
        assert_eq!(dir.len(), 1);
    }
}
