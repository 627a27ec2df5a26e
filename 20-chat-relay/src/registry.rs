//! Shared directory of who is online.
//!
//! Presence and the live session map sit behind one lock, so a username is
//! in the session map exactly when its presence is `Online`, and every read
//! sees the result of whole register/deregister steps.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::outbound::{SessionHandle, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Online => f.write_str("Online"),
            Presence::Offline => f.write_str("Offline"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{0} is already online")]
    AlreadyOnline(String),
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct RegistryInner {
    presence: BTreeMap<String, Presence>,
    sessions: HashMap<String, SessionHandle>,
}

impl Registry {
    /// Creates a registry where every known user starts `Offline`.
    pub fn new<I>(known_users: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let presence = known_users
            .into_iter()
            .map(|user| (user, Presence::Offline))
            .collect();
        Self {
            inner: Mutex::new(RegistryInner {
                presence,
                sessions: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts the session and marks its user `Online`, unless the user
    /// already has a live session. The check and the insert happen under
    /// one lock acquisition.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), RegisterError> {
        let mut inner = self.inner.lock().await;
        let username = handle.username().to_string();
        if inner.sessions.contains_key(&username) {
            return Err(RegisterError::AlreadyOnline(username));
        }
        inner.presence.insert(username.clone(), Presence::Online);
        inner.sessions.insert(username.clone(), handle);
        debug!(user = %username, "registered session");
        Ok(())
    }

    /// Removes the user's session and marks them `Offline`.
    ///
    /// Returns the removed handle; `None` when the user was not registered.
    pub async fn deregister(&self, username: &str) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().await;
        let removed = inner.sessions.remove(username)?;
        inner
            .presence
            .insert(username.to_string(), Presence::Offline);
        debug!(user = %username, "deregistered session");
        Some(removed)
    }

    pub async fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.inner.lock().await.sessions.get(username).cloned()
    }

    /// Handles of every registered session at one point in time.
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    /// Presence of every known user, ordered by username.
    pub async fn snapshot_status(&self) -> Vec<(String, Presence)> {
        let inner = self.inner.lock().await;
        inner
            .presence
            .iter()
            .map(|(user, presence)| (user.clone(), *presence))
            .collect()
    }

    pub async fn presence(&self, username: &str) -> Option<Presence> {
        self.inner.lock().await.presence.get(username).copied()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}
