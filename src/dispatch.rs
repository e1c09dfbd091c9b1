// src/dispatch.rs
//! Fan-out dispatch.
//!
//! One logical send becomes one detached task per member. Nothing is
//! awaited on behalf of the caller and per-member failures are only
//! logged here; the downstream connection owns any further reporting.

use crate::message::InvocationMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no live connection '{connection_id}' on hub '{hub}'")]
    UnknownConnection { hub: String, connection_id: String },

    #[error("mailbox of '{0}' is full")]
    MailboxFull(String),

    #[error("mailbox of '{0}' is closed")]
    MailboxClosed(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Downstream contract: the per-connection delivery actor, addressed by
/// (hub, connection id), accepting a one-way invocation.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(
        &self,
        hub: &str,
        connection_id: &str,
        message: Arc<InvocationMessage>,
    ) -> Result<(), DeliveryError>;
}

/// Issue one detached delivery per target. Returns the number issued.
pub fn fan_out<I>(
    sink: &Arc<dyn ConnectionSink>,
    hub: &str,
    targets: I,
    message: Arc<InvocationMessage>,
) -> usize
where
    I: IntoIterator<Item = String>,
{
    let mut issued = 0;
    for connection_id in targets {
        let sink = sink.clone();
        let hub = hub.to_string();
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.send(&hub, &connection_id, message).await {
                debug!(%hub, %connection_id, error = %e, "delivery dropped");
            }
        });
        issued += 1;
    }
    trace!(%hub, issued, method = %message.target, "fan-out issued");
    issued
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionSink for Recording {
        async fn send(
            &self,
            hub: &str,
            connection_id: &str,
            _message: Arc<InvocationMessage>,
        ) -> Result<(), DeliveryError> {
            if connection_id == "broken" {
                return Err(DeliveryError::UnknownConnection {
                    hub: hub.to_string(),
                    connection_id: connection_id.to_string(),
                });
            }
            self.seen.lock().push(connection_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_member_does_not_stop_the_rest() {
        let recording = Arc::new(Recording::default());
        let sink: Arc<dyn ConnectionSink> = recording.clone();
        let msg = Arc::new(InvocationMessage::new("m", vec![]));

        let issued = fan_out(
            &sink,
            "chat",
            ["a", "broken", "b"].map(String::from),
            msg,
        );
        assert_eq!(issued, 3);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut seen = recording.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }
}
