//! Query Session Engine
//!
//! One `Session` per authenticated identity turns a single persistent
//! WebSocket into a request/response query service.
//!
//! # Architecture
//!
//! | Module        | Responsibility                                         |
//! |---------------|--------------------------------------------------------|
//! | `transport`   | Connector/reader/writer seams, tokio-tungstenite impl  |
//! | `memory`      | In-memory connector for tests and embedding            |
//! | `connection`  | Lifecycle state machine, handshake, idle timeout       |
//! | `dispatcher`  | Ordered outbound write queue                           |
//! | `demux`       | Inbound read loop                                      |
//! | `correlator`  | Pending-query table keyed by request id                |
//! | `accumulator` | Reassembly of multi-fragment answers                   |
//!
//! # Flow
//!
//! ```text
//! query(payload)
//!   ├─ register request id        (duplicate? reject, nothing sent)
//!   ├─ connect if not open        (token ─▶ signed headers ─▶ handshake)
//!   ├─ dispatcher.submit(frame)   (returns immediately)
//!   └─ wait on the pending entry  ◀── demux routes fragments here
//! ```
//!
//! Callers never poll. Each pending query resolves through its own one-shot
//! channel, and a broken connection resolves all of them at once.
//!
//! # Usage
//!
//! ```ignore
//! let session = Session::new("ana@example.com", credentials, signer, connector, config);
//! let result = session.query(QueryPayload::sql("SELECT * FROM parquet_scan('s3://...')")).await?;
//! ```

pub mod accumulator;
pub mod connection;
pub mod correlator;
mod demux;
mod dispatcher;
pub mod memory;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use memory::{MemoryConnector, MemoryPeer};
pub use transport::{Connector, FrameReader, FrameWriter, WsConnector};

use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{CredentialSource, IdentityToken};
use crate::config::SessionConfig;
use crate::protocol::{QueryPayload, QueryResult};
use crate::signing::{HeaderSigner, PresignedUrlSigner, SignedHeaders};
use crate::types::{CauldronError, Result};
use correlator::Correlator;

/// The per-identity query session
pub struct Session {
    identity: String,
    config: SessionConfig,
    credentials: RwLock<Arc<dyn CredentialSource>>,
    signer: RwLock<Arc<dyn HeaderSigner>>,
    /// Where the next handshake goes; starts as `config.url`
    endpoint: RwLock<String>,
    correlator: Arc<Correlator>,
    connection: ConnectionManager,
}

impl Session {
    /// Create a session. Nothing connects until the first query.
    pub fn new(
        identity: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        signer: Arc<dyn HeaderSigner>,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        let identity = identity.into();
        let correlator = Arc::new(Correlator::new());
        let connection = ConnectionManager::new(
            identity.clone(),
            config.idle_timeout,
            connector,
            Arc::clone(&correlator),
        );

        Self {
            endpoint: RwLock::new(config.url.clone()),
            identity,
            config,
            credentials: RwLock::new(credentials),
            signer: RwLock::new(signer),
            correlator,
            connection,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Why the last connection attempt or link failed
    pub fn last_error(&self) -> Option<CauldronError> {
        self.connection.last_error()
    }

    /// Queries waiting for their answer
    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn endpoint(&self) -> String {
        read_lock(&self.endpoint).clone()
    }

    /// Swap the credential source used for future handshakes
    pub fn set_credentials(&self, credentials: Arc<dyn CredentialSource>) {
        *write_lock(&self.credentials) = credentials;
    }

    /// Swap the header signer used for future handshakes
    pub fn set_signer(&self, signer: Arc<dyn HeaderSigner>) {
        *write_lock(&self.signer) = signer;
    }

    fn credentials(&self) -> Arc<dyn CredentialSource> {
        Arc::clone(&read_lock(&self.credentials))
    }

    fn signer(&self) -> Arc<dyn HeaderSigner> {
        Arc::clone(&read_lock(&self.signer))
    }

    /// Obtain a current identity token from the credential source
    pub async fn authenticate(&self) -> Result<IdentityToken> {
        self.credentials().obtain_identity_token().await
    }

    /// Token plus transport headers for a handshake
    async fn signed_headers(&self) -> Result<SignedHeaders> {
        let token = self.authenticate().await?;
        self.signer().sign(&token).await.map_err(|e| match e {
            CauldronError::Auth(_) => e,
            other => CauldronError::Auth(format!("Signing failed: {}", other)),
        })
    }

    /// Open the connection unless it already is
    pub async fn connect(&self) -> Result<()> {
        if self.connection.is_open() {
            return Ok(());
        }
        let endpoint = self.endpoint();
        self.connection
            .connect_with(&endpoint, || self.signed_headers())
            .await
    }

    /// Connect using an already-authenticated URL.
    ///
    /// The URL's `X-Amz-*` parameters become the handshake headers and stay
    /// with the session for later reconnects. An open connection is replaced.
    pub async fn connect_presigned(&self, presigned_url: &str) -> Result<()> {
        let signer = PresignedUrlSigner::new(presigned_url)?;

        let mut endpoint = Url::parse(presigned_url)
            .map_err(|e| CauldronError::BadRequest(format!("Invalid pre-signed URL: {}", e)))?;
        endpoint.set_query(None);

        self.set_signer(Arc::new(signer));
        *write_lock(&self.endpoint) = endpoint.to_string();

        if self.connection.is_open() {
            info!(identity = %self.identity, "Replacing connection with pre-signed URL");
            self.connection.close();
        }
        self.connect().await
    }

    /// Query-string-authenticated URL for the session's endpoint
    pub async fn signed_url(&self) -> Result<String> {
        let headers = self.signed_headers().await?;
        headers.signed_url(&self.endpoint())
    }

    /// Submit one query and wait for its complete answer.
    ///
    /// Connects (authenticating first) when the session is closed. A blank
    /// `requestId` is replaced by a fresh UUID.
    pub async fn query(&self, mut payload: QueryPayload) -> Result<QueryResult> {
        let request_id = payload.ensure_request_id().to_string();
        let frame = payload.to_frame()?;

        // Registered before any network activity, so duplicates never reach the wire
        let ticket = self.correlator.register(&request_id)?;

        if let Err(e) = self.connect().await {
            warn!(identity = %self.identity, request_id = %request_id, error = %e, "Query not sent");
            return Err(e);
        }

        self.connection.submit(&request_id, frame)?;
        debug!(identity = %self.identity, request_id = %request_id, "Query submitted");

        match self.config.query_timeout {
            Some(limit) => tokio::time::timeout(limit, ticket.wait())
                .await
                .map_err(|_| {
                    warn!(identity = %self.identity, request_id = %request_id, "Query timed out");
                    CauldronError::Timeout(format!(
                        "No complete answer for {} within {}s",
                        request_id,
                        limit.as_secs()
                    ))
                })?,
            None => ticket.wait().await,
        }
    }

    /// Close the connection, failing every outstanding query. Idempotent.
    pub fn close(&self) {
        self.connection.close();
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
