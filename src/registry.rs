//! Session Registry
//!
//! Process-wide map from identity to `Session`. Built once at startup and
//! handed to the HTTP front end; nothing else holds sessions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::auth::{identity_claim, CredentialSource};
use crate::config::SessionConfig;
use crate::session::{Connector, Session};
use crate::signing::HeaderSigner;
use crate::types::{CauldronError, Result};

/// Identity -> Session cache
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    /// Signer new sessions start with
    default_signer: Arc<dyn HeaderSigner>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        default_signer: Arc<dyn HeaderSigner>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            connector,
            default_signer,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Existing session for `identity`, or a new unconnected one.
    ///
    /// Concurrent callers for the same identity always get the same session.
    /// An existing session keeps its credentials; see `Session::set_credentials`.
    pub fn get_or_create(
        &self,
        identity: &str,
        credentials: Arc<dyn CredentialSource>,
    ) -> Arc<Session> {
        let entry = self.sessions.entry(identity.to_string()).or_insert_with(|| {
            info!(identity = %identity, "Creating session");
            Arc::new(Session::new(
                identity,
                credentials,
                Arc::clone(&self.default_signer),
                Arc::clone(&self.connector),
                self.config.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|s| Arc::clone(s.value()))
    }

    /// Resolve a bearer token to its session without creating one.
    pub fn lookup_by_token(&self, token: &str) -> Result<Arc<Session>> {
        let identity = identity_claim(token)?;
        debug!(identity = %identity, "Resolved bearer token");
        self.get(&identity).ok_or_else(|| {
            CauldronError::Unauthorized(format!(
                "No active session for {}, please sign in",
                identity
            ))
        })
    }

    /// Evict a session. Close it first if it may still be connected.
    pub fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(identity).map(|(_, session)| session);
        if removed.is_some() {
            info!(identity = %identity, "Session removed");
        }
        removed
    }

    /// Close the session's connection, then evict it.
    pub fn sign_out(&self, identity: &str) -> bool {
        match self.get(identity) {
            Some(session) => {
                session.close();
                self.remove(identity);
                true
            }
            None => false,
        }
    }

    /// Close every session's connection (process shutdown)
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        info!(sessions = sessions.len(), "Closing all sessions");
        for session in sessions {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions with a live connection
    pub fn open_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.value().is_open()).count()
    }
}
