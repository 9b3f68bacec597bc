//! In-memory transport
//!
//! A `Connector` whose connections are channel pairs. Every successful
//! `connect()` hands a `MemoryPeer` to whoever is playing the server, which
//! can read what the engine wrote, push frames back, and inject failures.
//! Used by the engine's tests; also handy for embedding without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::{Connector, FrameReader, FrameWriter};
use crate::protocol::{QueryPayload, ResponseFragment};
use crate::signing::SignedHeaders;
use crate::types::{CauldronError, Result};

enum Inbound {
    Frame(String),
    Fail(String),
    Close,
}

/// Connector producing in-memory connections
pub struct MemoryConnector {
    attempts: AtomicUsize,
    connects: AtomicUsize,
    failures: Mutex<VecDeque<String>>,
    handshake_delay: Mutex<Duration>,
    last_headers: Mutex<Option<SignedHeaders>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            attempts: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            handshake_delay: Mutex::new(Duration::ZERO),
            last_headers: Mutex::new(None),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// Handshakes attempted, successful or not
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Handshakes that produced a connection
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next handshake fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(reason.into());
        }
    }

    /// Stretch every handshake by `delay`
    pub fn set_handshake_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.handshake_delay.lock() {
            *current = delay;
        }
    }

    /// Headers presented on the most recent handshake
    pub fn last_headers(&self) -> Option<SignedHeaders> {
        self.last_headers.lock().ok().and_then(|h| h.clone())
    }

    /// Wait for the next connection the engine opens
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _url: &str,
        headers: &SignedHeaders,
    ) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.handshake_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(CauldronError::Connect(reason));
        }

        if let Ok(mut last) = self.last_headers.lock() {
            *last = Some(headers.clone());
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            written: Some(out_rx),
            inbound: in_tx,
            closed: Arc::clone(&closed),
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| CauldronError::Connect("Memory connector has no listener".into()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok((
            Box::new(MemoryWriter { tx: out_tx, closed }),
            Box::new(MemoryReader { rx: in_rx }),
        ))
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write(&mut self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| CauldronError::Transport("Failed to send: peer gone".into()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read(&mut self) -> Result<Option<String>> {
        match self.rx.recv().await {
            Some(Inbound::Frame(frame)) => Ok(Some(frame)),
            Some(Inbound::Fail(reason)) => Err(CauldronError::Transport(reason)),
            Some(Inbound::Close) | None => Ok(None),
        }
    }
}

/// Server side of one in-memory connection
pub struct MemoryPeer {
    written: Option<mpsc::UnboundedReceiver<String>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next frame the engine wrote; `None` once writes are severed or the
    /// engine dropped the connection
    pub async fn recv(&mut self) -> Option<String> {
        self.written.as_mut()?.recv().await
    }

    /// Next frame the engine wrote, decoded as a query submission
    pub async fn recv_payload(&mut self) -> Option<QueryPayload> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Deliver a raw frame to the engine
    pub fn send(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Frame(frame.into()));
    }

    /// Deliver a response fragment to the engine
    pub fn send_fragment(&self, fragment: &ResponseFragment) {
        if let Ok(frame) = serde_json::to_string(fragment) {
            self.send(frame);
        }
    }

    /// Make the engine's next read fail
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Fail(reason.into()));
    }

    /// Close cleanly from the server side
    pub fn hang_up(&self) {
        let _ = self.inbound.send(Inbound::Close);
    }

    /// Make every further write from the engine fail
    pub fn sever_writes(&mut self) {
        self.written = None;
    }

    /// Whether the engine closed its write half
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
