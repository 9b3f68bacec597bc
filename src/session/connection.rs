//! Connection Manager
//!
//! Owns the lifecycle of the one physical connection a session may have:
//!
//! ```text
//! Closed ──connect()──▶ Connecting ──handshake ok──▶ Open
//!   ▲                       │                         │
//!   └──── handshake failed ─┘   close() / idle / I/O error
//!   └─────────────────────────────────────────────────┘
//! ```
//!
//! Every successful handshake starts a new *generation* with its own
//! dispatcher, demultiplexer and idle watchdog. Background tasks only ever
//! tear down their own generation, so a late failure from an old link can
//! never close a newer one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::correlator::Correlator;
use super::demux;
use super::dispatcher::Dispatcher;
use super::transport::Connector;
use crate::signing::SignedHeaders;
use crate::types::{CauldronError, Result};

/// Lifecycle state of a session's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Tasks and queue belonging to one open connection
struct Link {
    generation: u64,
    dispatcher: Dispatcher,
    demux: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    link: Option<Link>,
    last_error: Option<CauldronError>,
}

struct Shared {
    identity: String,
    idle_timeout: Duration,
    connector: Arc<dyn Connector>,
    correlator: Arc<Correlator>,
    inner: Mutex<Inner>,
    /// Serializes handshakes so concurrent callers converge on one
    handshake: tokio::sync::Mutex<()>,
    /// Handshakes that ran to an outcome (success or failure)
    attempts: AtomicU64,
    generation: AtomicU64,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last send or receive
    last_activity: AtomicU64,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        self.last_activity
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity.load(Ordering::Relaxed))
    }

    /// Close the connection and fail everything outstanding.
    ///
    /// With `Some(generation)` only that generation is torn down; a stale
    /// request returns `false` without touching anything.
    fn teardown(&self, generation: Option<u64>, error: CauldronError) -> bool {
        let link = {
            let mut inner = self.inner();
            match (&inner.link, generation) {
                (Some(link), Some(g)) if link.generation != g => return false,
                (None, Some(_)) => return false,
                _ => {}
            }
            if generation.is_some() {
                inner.last_error = Some(error.clone());
            }
            inner.state = ConnectionState::Closed;
            inner.link.take()
        };

        let closed_generation = link.as_ref().map(|l| l.generation);
        if let Some(link) = link {
            link.demux.abort();
            link.watchdog.abort();
            // Dropping the dispatcher discards queued frames and closes the writer
            drop(link.dispatcher);
        }

        let failed = self.correlator.fail_all(error.clone());
        if closed_generation.is_some() || failed > 0 {
            info!(
                identity = %self.identity,
                generation = ?closed_generation,
                failed,
                reason = %error,
                "Connection closed"
            );
        }
        true
    }
}

/// Puts the state back to `Closed` if a handshake is abandoned midway,
/// e.g. because the caller's future was dropped.
struct HandshakeGuard<'a> {
    shared: &'a Shared,
    finished: bool,
}

impl HandshakeGuard<'_> {
    /// Mark the attempt as decided so queued callers adopt its outcome
    fn finish(&mut self) {
        self.finished = true;
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.shared.inner();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Closed;
            debug!(identity = %self.shared.identity, "Handshake abandoned");
        }
    }
}

/// Per-generation handle given to the background tasks of one connection
#[derive(Clone)]
pub(crate) struct LinkHandle {
    generation: u64,
    shared: Weak<Shared>,
}

impl LinkHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Record traffic, pushing the idle deadline out
    pub(crate) fn activity(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.touch();
        }
    }

    /// Tear down this generation after an unrecoverable error
    pub(crate) fn broken(&self, error: CauldronError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.teardown(Some(self.generation), error);
        }
    }
}

/// Connection lifecycle for one session
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        identity: impl Into<String>,
        idle_timeout: Duration,
        connector: Arc<dyn Connector>,
        correlator: Arc<Correlator>,
    ) -> Self {
        let epoch = Instant::now();
        Self {
            shared: Arc::new(Shared {
                identity: identity.into(),
                idle_timeout,
                connector,
                correlator,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Closed,
                    link: None,
                    last_error: None,
                }),
                handshake: tokio::sync::Mutex::new(()),
                attempts: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                epoch,
                last_activity: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the last handshake or link failed, if it did
    pub fn last_error(&self) -> Option<CauldronError> {
        self.shared.inner().last_error.clone()
    }

    /// Number of handshakes that produced a connection
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout
    }

    /// Open the connection unless it is already open.
    ///
    /// `headers` is only invoked when a handshake is actually needed.
    /// Concurrent callers queue behind the first and share its outcome:
    /// `Ok` if it opened the connection, otherwise its error. Only an
    /// abandoned handshake lets the next caller in line try again.
    pub async fn connect_with<F, Fut>(&self, url: &str, headers: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SignedHeaders>>,
    {
        let seen = self.shared.attempts.load(Ordering::SeqCst);
        let _handshake = self.shared.handshake.lock().await;

        {
            let mut inner = self.shared.inner();
            if inner.state == ConnectionState::Open {
                return Ok(());
            }
            if self.shared.attempts.load(Ordering::SeqCst) != seen {
                let error = inner.last_error.clone().unwrap_or_else(|| {
                    CauldronError::Connect("Connection attempt failed".into())
                });
                debug!(identity = %self.shared.identity, error = %error, "Sharing failed handshake outcome");
                return Err(error);
            }
            inner.state = ConnectionState::Connecting;
        }
        let mut guard = HandshakeGuard {
            shared: &self.shared,
            finished: false,
        };

        let outcome = match headers().await {
            Ok(headers) => self.shared.connector.connect(url, &headers).await,
            Err(e) => Err(e),
        };

        let (writer, reader) = match outcome {
            Ok(halves) => halves,
            Err(e) => {
                warn!(identity = %self.shared.identity, url = %url, error = %e, "Connect failed");
                let mut inner = self.shared.inner();
                inner.state = ConnectionState::Closed;
                inner.last_error = Some(e.clone());
                guard.finish();
                return Err(e);
            }
        };

        let mut inner = self.shared.inner();
        if inner.state != ConnectionState::Connecting {
            // close() ran while the handshake was in flight
            let error = CauldronError::Connect("Connection closed during handshake".into());
            inner.last_error = Some(error.clone());
            guard.finish();
            return Err(error);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.touch();

        let handle = LinkHandle {
            generation,
            shared: Arc::downgrade(&self.shared),
        };
        let dispatcher = Dispatcher::spawn(writer, handle.clone());
        let demux = tokio::spawn(demux::run(
            reader,
            Arc::clone(&self.shared.correlator),
            handle.clone(),
        ));
        let watchdog = tokio::spawn(idle_watchdog(handle, self.shared.idle_timeout));

        inner.link = Some(Link {
            generation,
            dispatcher,
            demux,
            watchdog,
        });
        inner.state = ConnectionState::Open;
        inner.last_error = None;
        guard.finish();

        info!(identity = %self.shared.identity, generation, "Connection open");
        Ok(())
    }

    /// Queue a frame on the open connection
    pub fn submit(&self, request_id: &str, frame: String) -> Result<()> {
        let inner = self.shared.inner();
        match &inner.link {
            Some(link) => link.dispatcher.submit(request_id, frame),
            None => Err(CauldronError::ConnectionLost(
                "Connection closed before the query was sent".into(),
            )),
        }
    }

    /// Close the connection and fail all outstanding queries. Idempotent.
    pub fn close(&self) {
        debug!(identity = %self.shared.identity, "Closing connection");
        self.shared
            .teardown(None, CauldronError::ConnectionLost("Connection closed".into()));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared
            .teardown(None, CauldronError::ConnectionLost("Session dropped".into()));
    }
}

async fn idle_watchdog(link: LinkHandle, idle_timeout: Duration) {
    loop {
        let Some(deadline) = link
            .shared
            .upgrade()
            .map(|shared| shared.last_activity() + idle_timeout)
        else {
            return;
        };

        tokio::time::sleep_until(deadline).await;

        let Some(shared) = link.shared.upgrade() else {
            return;
        };
        if shared.last_activity() + idle_timeout <= Instant::now() {
            info!(
                identity = %shared.identity,
                generation = link.generation,
                idle_secs = idle_timeout.as_secs(),
                "Idle timeout reached"
            );
            shared.teardown(
                Some(link.generation),
                CauldronError::ConnectionLost("Connection closed after idle timeout".into()),
            );
            return;
        }
    }
}
