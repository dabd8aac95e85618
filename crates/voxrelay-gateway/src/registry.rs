//! Session registry: the only structure shared across connections.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxrelay_core::error::RegistryError;

use crate::channel::{ChannelEvent, OutboundSender, TransportChannel};
use crate::pipeline::SessionServices;
use crate::session::Session;

/// Handle to a live session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    inbound: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Build the transport channel that feeds this session.
    pub fn channel(&self, max_frame_bytes: usize, outbound: OutboundSender) -> TransportChannel {
        TransportChannel::new(
            self.id.clone(),
            max_frame_bytes,
            self.inbound.clone(),
            outbound,
            self.shutdown.clone(),
            self.done.clone(),
        )
    }

    /// Ask the session to close immediately, bypassing its queue.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the session task has exited.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }

    /// Wait for the session to exit; force it after `grace`.
    pub async fn wait_closed(&self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, self.finished()).await.is_ok() {
            return true;
        }
        warn!(session_id = %self.id, grace_ms = grace.as_millis() as u64, "Session slow to close, forcing shutdown");
        self.shutdown();
        self.finished().await;
        false
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    services: Arc<SessionServices>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(services: Arc<SessionServices>, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            services,
            max_sessions,
        }
    }

    /// Register `id` and spawn its session task. Must be called within a
    /// tokio runtime.
    pub fn create(
        &self,
        id: &str,
        outbound: OutboundSender,
    ) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.contains_key(id) {
            return Err(RegistryError::DuplicateSession(id.to_string()));
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full {
                limit: self.max_sessions,
            });
        }

        let (inbound, rx) = mpsc::channel(self.services.inbound_queue.max(1));
        let handle = SessionHandle {
            id: id.to_string(),
            inbound,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        };

        let session = Session::new(id.to_string(), self.services.clone(), outbound);
        let shutdown = handle.shutdown.clone();
        let done = handle.done.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            session.run(rx, shutdown).await;
        });

        sessions.insert(id.to_string(), handle.clone());
        debug!(session_id = %id, active = sessions.len(), "Session registered");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "Session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Signal every session to close (server shutdown).
    pub fn shutdown_all(&self) {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in sessions.values() {
            handle.shutdown();
        }
    }
}
