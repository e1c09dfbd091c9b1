// src/activation.rs
//! Activation table and registry run loop.
//!
//! Registries are activated on demand: the first call for an address spawns
//! a task that loads the persisted state, resumes disconnect subscriptions,
//! and then drains a command channel one call at a time. The same task owns
//! the cleanup timer and the idle timer. A deactivating instance closes its
//! channel, finishes the calls already queued, runs cleanup once, and only
//! then lets a successor for the same address load state.

use crate::config::BackplaneConfig;
use crate::dispatch::ConnectionSink;
use crate::error::{BackplaneError, Result};
use crate::key::EntityKey;
use crate::message::InvocationMessage;
use crate::registry::{Env, RegistryActor, RegistrySnapshot};
use crate::store::StateStore;
use crate::stream::DisconnectStream;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Attempts to reach a registry that is concurrently deactivating.
const MAX_CALL_ATTEMPTS: usize = 3;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Add {
        connection_id: String,
        reply: Reply<()>,
    },
    Remove {
        connection_id: String,
        reply: Reply<()>,
    },
    Send {
        message: Arc<InvocationMessage>,
        excluded: Vec<String>,
        reply: Reply<usize>,
    },
    Count {
        reply: Reply<usize>,
    },
    Snapshot {
        reply: Reply<RegistrySnapshot>,
    },
    Cleanup {
        reply: Reply<usize>,
    },
    Deactivate {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    /// Answer without running, used when activation failed.
    fn refuse(self, address: &str) {
        match self {
            Command::Add { reply, .. } | Command::Remove { reply, .. } => {
                let _ = reply.send(unavailable(address));
            }
            Command::Send { reply, .. } | Command::Count { reply } | Command::Cleanup { reply } => {
                let _ = reply.send(unavailable(address));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(unavailable(address));
            }
            Command::Deactivate { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

fn unavailable<T>(address: &str) -> Result<T> {
    Err(BackplaneError::Unavailable(address.to_string()))
}

#[derive(Clone)]
struct Slot {
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
    /// Flips to `true` once the instance has fully deactivated.
    stopped: watch::Receiver<bool>,
}

impl Slot {
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub(crate) struct ActivationTable {
    me: Weak<ActivationTable>,
    config: BackplaneConfig,
    store: Arc<dyn StateStore>,
    streams: Arc<dyn DisconnectStream>,
    sink: Arc<dyn ConnectionSink>,
    slots: DashMap<String, Slot>,
    generation: AtomicU64,
}

impl ActivationTable {
    pub(crate) fn new(
        config: BackplaneConfig,
        store: Arc<dyn StateStore>,
        streams: Arc<dyn DisconnectStream>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            store,
            streams,
            sink,
            slots: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub(crate) fn config(&self) -> &BackplaneConfig {
        &self.config
    }

    /// Number of registries currently accepting calls.
    pub(crate) fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.value().is_live()).count()
    }

    pub(crate) fn is_active(&self, key: &EntityKey) -> bool {
        self.slots
            .get(&key.address())
            .is_some_and(|s| s.value().is_live())
    }

    /// Deliver one command, re-activating if the current instance is going away.
    pub(crate) async fn call<T, F>(&self, key: &EntityKey, make: F) -> Result<T>
    where
        F: Fn(Reply<T>) -> Command,
    {
        for attempt in 0..MAX_CALL_ATTEMPTS {
            let slot = self.resolve(key);
            let (tx, rx) = oneshot::channel();
            if slot.tx.send(make(tx)).is_err() {
                trace!(address = %key, attempt, "registry deactivating, retrying");
                tokio::task::yield_now().await;
                continue;
            }
            match rx.await {
                Ok(res) => return res,
                Err(_) => {
                    warn!(address = %key, attempt, "registry dropped a call");
                }
            }
        }
        Err(BackplaneError::Unavailable(key.address()))
    }

    /// Disconnect-callback entry point.
    pub(crate) async fn remove_member(&self, key: &EntityKey, connection_id: String) -> Result<()> {
        self.call(key, |reply| Command::Remove {
            connection_id: connection_id.clone(),
            reply,
        })
        .await
    }

    /// Deactivate one registry. Returns `false` if it was not active.
    pub(crate) async fn deactivate(&self, key: &EntityKey) -> bool {
        let slot = match self.slots.get(&key.address()) {
            Some(s) if s.value().is_live() => s.value().clone(),
            _ => return false,
        };
        Self::stop(slot).await
    }

    /// Deactivate every registry and wait for all of them.
    pub(crate) async fn shutdown(&self) {
        let slots: Vec<Slot> = self
            .slots
            .iter()
            .filter(|s| s.value().is_live())
            .map(|s| s.value().clone())
            .collect();
        let count = slots.len();
        join_all(slots.into_iter().map(Self::stop)).await;
        debug!(count, "all registries deactivated");
    }

    async fn stop(slot: Slot) -> bool {
        let (tx, rx) = oneshot::channel();
        let requested = slot.tx.send(Command::Deactivate { reply: tx }).is_ok();
        if requested {
            let _ = rx.await;
        }
        let mut stopped = slot.stopped;
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        requested
    }

    fn resolve(&self, key: &EntityKey) -> Slot {
        match self.slots.entry(key.address()) {
            Entry::Occupied(e) if e.get().is_live() => e.get().clone(),
            Entry::Occupied(mut e) => {
                let predecessor = e.get().stopped.clone();
                let slot = self.spawn(key, Some(predecessor));
                e.insert(slot.clone());
                slot
            }
            Entry::Vacant(e) => {
                let slot = self.spawn(key, None);
                e.insert(slot.clone());
                slot
            }
        }
    }

    fn spawn(&self, key: &EntityKey, predecessor: Option<watch::Receiver<bool>>) -> Slot {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let actor = RegistryActor::new(
            key.clone(),
            Env {
                store: self.store.clone(),
                streams: self.streams.clone(),
                sink: self.sink.clone(),
                router: self.me.clone(),
            },
        );
        let timers = Timers {
            cleanup_interval: self
                .config
                .cleanup_interval
                .clamp(Duration::from_millis(1), FAR_FUTURE),
            idle_timeout: self.config.idle_timeout,
        };
        trace!(address = %key, generation, "spawning registry");
        tokio::spawn(run(
            actor,
            rx,
            predecessor,
            stopped_tx,
            timers,
            self.me.clone(),
            generation,
        ));
        Slot {
            generation,
            tx,
            stopped: stopped_rx,
        }
    }

    fn release(&self, address: &str, generation: u64) {
        self.slots
            .remove_if(address, |_, slot| slot.generation == generation);
    }
}

#[derive(Clone, Copy)]
struct Timers {
    cleanup_interval: Duration,
    idle_timeout: Option<Duration>,
}

async fn run(
    mut actor: RegistryActor,
    mut rx: mpsc::UnboundedReceiver<Command>,
    predecessor: Option<watch::Receiver<bool>>,
    stopped: watch::Sender<bool>,
    timers: Timers,
    table: Weak<ActivationTable>,
    generation: u64,
) {
    let address = actor.address().to_string();

    if let Some(mut prev) = predecessor {
        while !*prev.borrow() {
            if prev.changed().await.is_err() {
                break;
            }
        }
    }

    if let Err(e) = actor.activate().await {
        warn!(%address, error = %e, "activation failed");
        rx.close();
        while let Some(cmd) = rx.recv().await {
            cmd.refuse(&address);
        }
        finish(&stopped, &table, &address, generation);
        return;
    }

    let mut cleanup =
        tokio::time::interval_at(deadline_after(timers.cleanup_interval), timers.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let idle = tokio::time::sleep_until(deadline_after(timers.idle_timeout.unwrap_or(FAR_FUTURE)));
    tokio::pin!(idle);

    let mut waiters = Vec::new();
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    trace!(%address, "all senders gone");
                    break;
                };
                if let Some(waiter) = handle(&mut actor, cmd).await {
                    waiters.push(waiter);
                    break;
                }
                if let Some(timeout) = timers.idle_timeout {
                    idle.as_mut().reset(deadline_after(timeout));
                }
            }
            _ = cleanup.tick() => {
                match actor.cleanup().await {
                    Ok(0) => {}
                    Ok(reclaimed) => trace!(%address, reclaimed, "cleanup tick"),
                    Err(e) => warn!(%address, error = %e, "cleanup tick failed"),
                }
            }
            _ = &mut idle, if timers.idle_timeout.is_some() => {
                debug!(%address, "idle, deactivating");
                break;
            }
        }
    }

    // No new calls from here on; finish the ones already queued.
    rx.close();
    while let Some(cmd) = rx.recv().await {
        if let Some(waiter) = handle(&mut actor, cmd).await {
            waiters.push(waiter);
        }
    }

    actor.deactivate().await;
    finish(&stopped, &table, &address, generation);
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

fn finish(
    stopped: &watch::Sender<bool>,
    table: &Weak<ActivationTable>,
    address: &str,
    generation: u64,
) {
    let _ = stopped.send(true);
    if let Some(table) = table.upgrade() {
        table.release(address, generation);
    }
}

/// Run one call. A deactivation request is handed back instead.
async fn handle(actor: &mut RegistryActor, cmd: Command) -> Option<oneshot::Sender<()>> {
    match cmd {
        Command::Add {
            connection_id,
            reply,
        } => {
            let _ = reply.send(actor.add(connection_id).await);
        }
        Command::Remove {
            connection_id,
            reply,
        } => {
            let _ = reply.send(actor.remove(&connection_id).await.map(|_| ()));
        }
        Command::Send {
            message,
            excluded,
            reply,
        } => {
            let _ = reply.send(Ok(actor.send(message, &excluded)));
        }
        Command::Count { reply } => {
            let _ = reply.send(Ok(actor.count()));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Ok(actor.snapshot()));
        }
        Command::Cleanup { reply } => {
            let _ = reply.send(actor.cleanup().await);
        }
        Command::Deactivate { reply } => return Some(reply),
    }
    None
}
