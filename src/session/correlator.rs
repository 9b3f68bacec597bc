//! Query correlator
//!
//! The table of in-flight queries. Each entry owns the accumulator for its
//! correlation id and the one-shot channel its caller is parked on.
//!
//! - `register` creates the entry before anything touches the wire and
//!   rejects ids that are still outstanding.
//! - `route` is called by the demultiplexer for every inbound frame.
//! - `fail_all` resolves every entry when the connection goes away.
//!
//! Entries leave the table exactly once: on completion, on failure, or when
//! the caller's `Ticket` is dropped (e.g. a per-query timeout fired).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::accumulator::{FragmentAccumulator, Progress};
use crate::protocol::{decode_fragment, FragmentError, QueryResult};
use crate::types::{CauldronError, Result};

/// How many finished correlation ids are remembered for late fragments
const RETIRED_CAPACITY: usize = 256;

type Completion = oneshot::Sender<Result<QueryResult>>;

struct PendingQuery {
    ticket: u64,
    /// `None` until the first fragment arrives
    accumulator: Option<FragmentAccumulator>,
    completion: Completion,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, PendingQuery>,
    retired: VecDeque<String>,
}

impl Table {
    fn retire(&mut self, request_id: String) {
        if self.retired.len() >= RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(request_id);
    }

    fn is_retired(&self, request_id: &str) -> bool {
        self.retired.iter().any(|id| id == request_id)
    }

    fn finish(&mut self, request_id: &str, outcome: Result<QueryResult>) -> bool {
        match self.pending.remove(request_id) {
            Some(entry) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = entry.completion.send(outcome);
                self.retire(request_id.to_string());
                true
            }
            None => false,
        }
    }
}

/// Table of outstanding queries for one session
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
    next_ticket: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the pending entry for `request_id`.
    ///
    /// Fails with `DuplicateCorrelationId` if the id is still outstanding.
    pub fn register(self: &Arc<Self>, request_id: &str) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut table = self.table();
        if table.pending.contains_key(request_id) {
            return Err(CauldronError::DuplicateCorrelationId(request_id.to_string()));
        }
        // A reused id is live again; late fragments for it are no longer stale.
        table.retired.retain(|id| id != request_id);
        table.pending.insert(
            request_id.to_string(),
            PendingQuery {
                ticket,
                accumulator: None,
                completion: tx,
            },
        );
        drop(table);

        debug!(request_id = %request_id, "Query registered");

        Ok(Ticket {
            request_id: request_id.to_string(),
            ticket,
            correlator: Arc::clone(self),
            rx: Some(rx),
        })
    }

    /// Route one inbound frame to its pending query.
    ///
    /// An `Err` means the stream can no longer be trusted and the whole
    /// session must be closed. Problems scoped to a single query are
    /// delivered to that query and return `Ok`.
    pub fn route(&self, frame: &str) -> Result<()> {
        let fragment = match decode_fragment(frame) {
            Ok(fragment) => fragment,
            Err(FragmentError {
                request_id: Some(request_id),
                reason,
            }) => {
                let mut table = self.table();
                let error = CauldronError::Protocol(format!(
                    "Malformed fragment for {}: {}",
                    request_id, reason
                ));
                if table.finish(&request_id, Err(error)) {
                    warn!(request_id = %request_id, reason = %reason, "Malformed fragment, failing query");
                    return Ok(());
                }
                if table.is_retired(&request_id) {
                    warn!(request_id = %request_id, reason = %reason, "Dropping malformed late fragment");
                    return Ok(());
                }
                return Err(CauldronError::Protocol(format!(
                    "Malformed fragment for unknown request {}: {}",
                    request_id, reason
                )));
            }
            Err(FragmentError {
                request_id: None,
                reason,
            }) => {
                return Err(CauldronError::Protocol(format!(
                    "Undecodable frame: {}",
                    reason
                )));
            }
        };

        let request_id = fragment.request_id.clone();
        let mut table = self.table();

        let Some(entry) = table.pending.get_mut(&request_id) else {
            if table.is_retired(&request_id) {
                warn!(
                    request_id = %request_id,
                    serial = fragment.sub_batch_serial,
                    "Dropping fragment for finished query"
                );
                return Ok(());
            }
            return Err(CauldronError::Protocol(format!(
                "Fragment for unknown request {}",
                request_id
            )));
        };

        debug!(
            request_id = %request_id,
            serial = fragment.sub_batch_serial,
            total = fragment.total_sub_batches,
            rows = fragment.data.len(),
            "Fragment received"
        );

        let progress = entry
            .accumulator
            .get_or_insert_with(|| FragmentAccumulator::new(request_id.clone()))
            .push(fragment);

        match progress {
            Progress::Pending => {}
            Progress::Complete(result) => {
                debug!(
                    request_id = %request_id,
                    fragments = result.fragments,
                    rows = result.data.len(),
                    "Query complete"
                );
                table.finish(&request_id, Ok(result));
            }
            Progress::Empty => {
                debug!(request_id = %request_id, "Query produced no batches");
                table.finish(
                    &request_id,
                    Err(CauldronError::EmptyResult(format!(
                        "No response from server for {}. Check SQL syntax",
                        request_id
                    ))),
                );
            }
        }

        Ok(())
    }

    /// Fail one query, if it is still outstanding.
    pub fn fail(&self, request_id: &str, error: CauldronError) -> bool {
        self.table().finish(request_id, Err(error))
    }

    /// Resolve every outstanding query with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: CauldronError) -> usize {
        let mut table = self.table();
        let drained: Vec<(String, PendingQuery)> = table.pending.drain().collect();
        let count = drained.len();
        for (request_id, entry) in drained {
            let _ = entry.completion.send(Err(error.clone()));
            table.retire(request_id);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.table().pending.contains_key(request_id)
    }

    fn abandon(&self, request_id: &str, ticket: u64) {
        let mut table = self.table();
        let ours = table
            .pending
            .get(request_id)
            .is_some_and(|entry| entry.ticket == ticket);
        if ours {
            table.pending.remove(request_id);
            table.retire(request_id.to_string());
            debug!(request_id = %request_id, "Query abandoned by caller");
        }
    }
}

/// A caller's claim on one pending query.
///
/// Dropping the ticket without waiting removes the pending entry.
pub struct Ticket {
    request_id: String,
    ticket: u64,
    correlator: Arc<Correlator>,
    rx: Option<oneshot::Receiver<Result<QueryResult>>>,
}

impl Ticket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Park until the query completes or fails.
    pub async fn wait(mut self) -> Result<QueryResult> {
        let Some(rx) = self.rx.take() else {
            return Err(CauldronError::Internal("Ticket already consumed".into()));
        };
        rx.await
            .unwrap_or_else(|_| Err(CauldronError::ConnectionLost("Session closed".into())))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.correlator.abandon(&self.request_id, self.ticket);
    }
}
