//! Outbound dispatcher
//!
//! Queries are queued with `submit()`, which never waits on the socket. One
//! worker per connection owns the write half and drains the queue in
//! submission order, so frames never interleave on the wire.
//!
//! A failed write breaks the connection. The worker stops at once and
//! whatever is still queued is discarded; the owning queries are failed by
//! the connection teardown.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::connection::LinkHandle;
use super::transport::FrameWriter;
use crate::types::{CauldronError, Result};

/// Upper bound on the close handshake when a connection is torn down
const CLOSE_GRACE: Duration = Duration::from_secs(5);

struct Outbound {
    request_id: String,
    frame: String,
}

/// Write queue for one connection.
///
/// Dropping the dispatcher stops the worker (queued frames are discarded)
/// and closes the write half.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Outbound>,
    _shutdown: oneshot::Sender<()>,
}

impl Dispatcher {
    /// Start the drain worker for `writer`
    pub(crate) fn spawn(writer: Box<dyn FrameWriter>, link: LinkHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(drain(writer, rx, shutdown_rx, link));

        Self {
            tx,
            _shutdown: shutdown_tx,
        }
    }

    /// Queue a frame; returns immediately.
    pub fn submit(&self, request_id: &str, frame: String) -> Result<()> {
        self.tx
            .send(Outbound {
                request_id: request_id.to_string(),
                frame,
            })
            .map_err(|_| {
                CauldronError::ConnectionLost("Connection closed before the query was sent".into())
            })
    }
}

async fn drain(
    mut writer: Box<dyn FrameWriter>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: oneshot::Receiver<()>,
    link: LinkHandle,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        match writer.write(outbound.frame).await {
            Ok(()) => {
                debug!(
                    request_id = %outbound.request_id,
                    generation = link.generation(),
                    "Query dispatched"
                );
                link.activity();
            }
            Err(e) => {
                warn!(
                    request_id = %outbound.request_id,
                    generation = link.generation(),
                    error = %e,
                    "Write failed, closing connection"
                );
                link.broken(CauldronError::ConnectionLost(format!("Write failed: {}", e)));
                return;
            }
        }
    }

    if tokio::time::timeout(CLOSE_GRACE, writer.close()).await.is_err() {
        debug!(generation = link.generation(), "Close handshake timed out");
    }
}
