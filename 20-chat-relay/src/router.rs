//! Fan-out of chat lines to registered sessions.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    outbound::Undelivered,
    protocol::chat_line,
    registry::Registry,
};

/// Result of a direct message as seen by its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
    Delivered,
    /// The recipient's queue was full; the line was dropped.
    Dropped,
    RecipientOffline,
}

#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queues `text` for every registered session, the sender included.
    ///
    /// Never waits on a recipient: a full or closed queue loses this line for
    /// that recipient only. Returns how many sessions accepted it.
    pub async fn broadcast(&self, text: &str) -> usize {
        let sessions = self.registry.sessions().await;
        let mut delivered = 0;
        for session in sessions {
            match session.try_deliver(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(Undelivered::QueueFull) => {
                    warn!(user = session.username(), "outbound queue full; dropping broadcast line");
                }
                Err(Undelivered::Closed) => {
                    debug!(user = session.username(), "skipping broadcast to closing session");
                }
            }
        }
        delivered
    }

    /// Queues `<sender>: <text>` for `recipient` only.
    ///
    /// Nothing is kept for offline users. A recipient whose writer has already
    /// stopped counts as offline; one whose queue is full loses the line.
    pub async fn direct(&self, sender: &str, recipient: &str, text: &str) -> DirectOutcome {
        let Some(session) = self.registry.lookup(recipient).await else {
            return DirectOutcome::RecipientOffline;
        };
        match session.try_deliver(chat_line(sender, text)) {
            Ok(()) => DirectOutcome::Delivered,
            Err(Undelivered::QueueFull) => {
                warn!(%sender, %recipient, "outbound queue full; dropping direct message");
                DirectOutcome::Dropped
            }
            Err(Undelivered::Closed) => DirectOutcome::RecipientOffline,
        }
    }
}
