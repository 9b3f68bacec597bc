//! Session engine integration tests
//!
//! Drive a `Session` over the in-memory transport, playing the query service
//! through `MemoryPeer`.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cauldron::auth::{CredentialSource, IdentityToken};
use cauldron::protocol::{QueryPayload, ResponseFragment, Row};
use cauldron::session::{MemoryConnector, MemoryPeer};
use cauldron::signing::StaticSigner;
use cauldron::{CauldronError, ConnectionState, Result, Session, SessionConfig};

// =============================================================================
// Fixtures
// =============================================================================

/// Credential source that counts calls and can be told to fail
struct CountingCredentials {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingCredentials {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn obtain_identity_token(&self) -> Result<IdentityToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CauldronError::Auth("Refresh token revoked".into()));
        }
        Ok(IdentityToken::new("id-token"))
    }
}

fn session(
    connector: &Arc<MemoryConnector>,
    credentials: &Arc<CountingCredentials>,
    config: SessionConfig,
) -> Arc<Session> {
    Arc::new(Session::new(
        "ana@example.com",
        credentials.clone(),
        Arc::new(StaticSigner::default()),
        connector.clone(),
        config,
    ))
}

fn default_session() -> (Arc<Session>, Arc<MemoryConnector>, Arc<CountingCredentials>) {
    let connector = Arc::new(MemoryConnector::new());
    let credentials = CountingCredentials::new();
    let session = session(&connector, &credentials, SessionConfig::new("ws://query.test"));
    (session, connector, credentials)
}

fn rows(values: &[i64]) -> Vec<Row> {
    values
        .iter()
        .map(|v| json!({ "v": v }).as_object().cloned().unwrap())
        .collect()
}

fn fragment(request_id: &str, serial: i64, total: i64, values: &[i64]) -> ResponseFragment {
    ResponseFragment {
        message_type: "DATA".into(),
        request_id: request_id.into(),
        batch_serial: 1,
        total_batches: 1,
        split_serial: 1,
        total_split_serials: 1,
        cache_info: None,
        sub_batch_serial: serial,
        total_sub_batches: total,
        data: rows(values),
    }
}

fn spawn_query(
    session: &Arc<Session>,
    payload: QueryPayload,
) -> tokio::task::JoinHandle<Result<cauldron::QueryResult>> {
    let session = Arc::clone(session);
    tokio::spawn(async move { session.query(payload).await })
}

/// All orderings of `0..n`
fn permutations(n: i64) -> Vec<Vec<i64>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for perm in permutations(n - 1) {
        for pos in 0..=perm.len() {
            let mut next = perm.clone();
            next.insert(pos, n - 1);
            out.push(next);
        }
    }
    out
}

async fn accept(connector: &MemoryConnector) -> MemoryPeer {
    tokio::time::timeout(Duration::from_secs(5), connector.accept())
        .await
        .expect("engine never connected")
        .expect("connector closed")
}

// =============================================================================
// Reassembly
// =============================================================================

#[tokio::test]
async fn test_reassembly_independent_of_arrival_order() {
    let (session, connector, _) = default_session();
    let mut peer: Option<MemoryPeer> = None;

    for (i, order) in permutations(4).into_iter().enumerate() {
        let request_id = format!("perm-{}", i);
        let handle = spawn_query(
            &session,
            QueryPayload::sql("SELECT v FROM t").with_request_id(&request_id),
        );

        if peer.is_none() {
            peer = Some(accept(&connector).await);
        }
        let peer = peer.as_mut().unwrap();
        let payload = peer.recv_payload().await.unwrap();
        assert_eq!(payload.request_id, request_id);

        for serial in &order {
            let values = [serial * 2, serial * 2 + 1];
            peer.send_fragment(&fragment(&request_id, *serial, 4, &values));
        }

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.data, rows(&[0, 1, 2, 3, 4, 5, 6, 7]), "order {:?}", order);
        assert_eq!(result.fragments, 4);
    }

    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_single_fragment_shortcut() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("one"));

    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();
    peer.send_fragment(&fragment("one", 0, 0, &[42]));

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.data, rows(&[42]));
    assert_eq!(result.fragments, 1);
}

#[tokio::test]
async fn test_empty_result_is_query_scoped() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELEC oops").with_request_id("bad"));

    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();
    peer.send(r#"{"messageType": "DATA", "requestId": "bad", "totalBatches": 0, "totalSubBatches": 0, "data": null}"#);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, CauldronError::EmptyResult(_)), "got {err:?}");
    assert!(!err.is_infrastructure_failure());

    // The connection survives a query-scoped failure
    assert!(session.is_open());
}

#[tokio::test]
async fn test_generated_request_id() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1"));

    let mut peer = accept(&connector).await;
    let payload = peer.recv_payload().await.unwrap();
    assert!(uuid::Uuid::parse_str(&payload.request_id).is_ok());
    assert_eq!(payload.message_type, "SQL_QUERY");
    assert_eq!(payload.read_cache, "NONE");

    peer.send_fragment(&fragment(&payload.request_id, 0, 0, &[1]));
    assert_eq!(handle.await.unwrap().unwrap().request_id, payload.request_id);
}

// =============================================================================
// Multiplexing
// =============================================================================

#[tokio::test]
async fn test_concurrent_queries_are_isolated() {
    let (session, connector, _) = default_session();
    let a = spawn_query(&session, QueryPayload::sql("SELECT a").with_request_id("a"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();

    let b = spawn_query(&session, QueryPayload::sql("SELECT b").with_request_id("b"));
    peer.recv_payload().await.unwrap();

    // Interleave the two answers on the wire
    peer.send_fragment(&fragment("b", 1, 2, &[21]));
    peer.send_fragment(&fragment("a", 0, 3, &[10]));
    peer.send_fragment(&fragment("a", 2, 3, &[12]));
    peer.send_fragment(&fragment("b", 0, 2, &[20]));
    peer.send_fragment(&fragment("a", 1, 3, &[11]));

    assert_eq!(a.await.unwrap().unwrap().data, rows(&[10, 11, 12]));
    assert_eq!(b.await.unwrap().unwrap().data, rows(&[20, 21]));
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_duplicate_id_rejected_without_transport() {
    let (session, connector, _) = default_session();
    let first = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("dup"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();

    let err = session
        .query(QueryPayload::sql("SELECT 2").with_request_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, CauldronError::DuplicateCorrelationId(ref id) if id == "dup"));

    // Nothing was written for the rejected query
    assert!(tokio::time::timeout(Duration::from_millis(50), peer.recv())
        .await
        .is_err());
    assert_eq!(connector.attempt_count(), 1);

    // The original query is unaffected
    peer.send_fragment(&fragment("dup", 0, 0, &[1]));
    assert_eq!(first.await.unwrap().unwrap().data, rows(&[1]));
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_reconnect_performs_exactly_one_connect() {
    let (session, connector, credentials) = default_session();
    assert_eq!(session.state(), ConnectionState::Closed);

    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("q1"));
    let mut peer = accept(&connector).await;

    // The payload arrives on the one connection that was opened
    let payload = peer.recv_payload().await.unwrap();
    assert_eq!(payload.request_id, "q1");
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(credentials.calls(), 1);

    peer.send_fragment(&fragment("q1", 0, 0, &[1]));
    handle.await.unwrap().unwrap();

    // After a close, the next query reconnects transparently
    session.close();
    assert!(!session.is_open());

    let handle = spawn_query(&session, QueryPayload::sql("SELECT 2").with_request_id("q2"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();
    peer.send_fragment(&fragment("q2", 0, 0, &[2]));
    handle.await.unwrap().unwrap();

    assert_eq!(connector.connect_count(), 2);
    assert_eq!(credentials.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_handshake() {
    let (session, connector, credentials) = default_session();
    connector.set_handshake_delay(Duration::from_millis(200));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            spawn_query(
                &session,
                QueryPayload::sql("SELECT 1").with_request_id(format!("c{}", i)),
            )
        })
        .collect();

    let mut peer = accept(&connector).await;
    for _ in 0..5 {
        let payload = peer.recv_payload().await.unwrap();
        peer.send_fragment(&fragment(&payload.request_id, 0, 0, &[1]));
    }
    for joined in futures::future::join_all(handles).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(credentials.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_failed_handshake() {
    let (session, connector, credentials) = default_session();
    connector.fail_next_connect("refused");
    connector.set_handshake_delay(Duration::from_millis(200));

    let (a, b) = tokio::join!(session.connect(), session.connect());

    assert!(matches!(a, Err(CauldronError::Connect(_))));
    assert!(matches!(b, Err(CauldronError::Connect(_))));
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(credentials.calls(), 1);
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_handshake_leaves_session_closed() {
    let (session, connector, _) = default_session();
    connector.set_handshake_delay(Duration::from_secs(10));

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        session.query(QueryPayload::sql("SELECT 1").with_request_id("slow")),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(session.pending_count(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_read_failure_fails_all_outstanding() {
    let (session, connector, _) = default_session();
    let mut handles = Vec::new();

    handles.push(spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("x")));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();
    for id in ["y", "z"] {
        handles.push(spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id(id)));
        peer.recv_payload().await.unwrap();
    }
    // One of them is part-way through its answer
    peer.send_fragment(&fragment("y", 0, 3, &[1]));

    peer.fail("connection reset by peer");

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CauldronError::ConnectionLost(_)), "got {err:?}");
    }
    assert!(!session.is_open());
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_explicit_close_fails_outstanding() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("slow"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();

    session.close();
    session.close();

    assert!(matches!(
        handle.await.unwrap(),
        Err(CauldronError::ConnectionLost(_))
    ));
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_write_failure_breaks_connection() {
    let (session, connector, _) = default_session();
    session.connect().await.unwrap();
    let mut peer = accept(&connector).await;
    peer.sever_writes();

    let err = session
        .query(QueryPayload::sql("SELECT 1").with_request_id("w"))
        .await
        .unwrap_err();
    assert!(err.is_infrastructure_failure(), "got {err:?}");
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_unknown_request_id_is_session_wide() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("mine"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();

    peer.send_fragment(&fragment("someone-else", 0, 0, &[1]));

    assert!(matches!(
        handle.await.unwrap(),
        Err(CauldronError::Protocol(_))
    ));
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_peer_close_fails_outstanding() {
    let (session, connector, _) = default_session();
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("q"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();

    peer.hang_up();

    assert!(matches!(
        handle.await.unwrap(),
        Err(CauldronError::ConnectionLost(_))
    ));
    assert!(!session.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_closes_connection() {
    let connector = Arc::new(MemoryConnector::new());
    let credentials = CountingCredentials::new();
    let session = session(
        &connector,
        &credentials,
        SessionConfig::new("ws://query.test").with_idle_timeout(Some(Duration::from_secs(60))),
    );

    session.connect().await.unwrap();
    let peer = accept(&connector).await;
    assert!(session.is_open());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(session.is_open());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!session.is_open());
    assert!(matches!(
        session.last_error(),
        Some(CauldronError::ConnectionLost(_))
    ));

    tokio::task::yield_now().await;
    assert!(peer.client_closed());
}

// =============================================================================
// Collaborator failures
// =============================================================================

#[tokio::test]
async fn test_credential_failure_is_auth_error() {
    let connector = Arc::new(MemoryConnector::new());
    let credentials = CountingCredentials::failing();
    let session = session(&connector, &credentials, SessionConfig::new("ws://query.test"));

    let err = session
        .query(QueryPayload::sql("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CauldronError::Auth(_)));
    assert_eq!(connector.attempt_count(), 0);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_connect_failure_then_retry() {
    let (session, connector, _) = default_session();
    connector.fail_next_connect("handshake rejected: 403");

    let err = session
        .query(QueryPayload::sql("SELECT 1").with_request_id("r"))
        .await
        .unwrap_err();
    assert!(matches!(err, CauldronError::Connect(_)));
    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(session.last_error().is_some());

    // Retrying the same id works: the failed attempt left nothing pending
    let handle = spawn_query(&session, QueryPayload::sql("SELECT 1").with_request_id("r"));
    let mut peer = accept(&connector).await;
    peer.recv_payload().await.unwrap();
    peer.send_fragment(&fragment("r", 0, 0, &[1]));
    handle.await.unwrap().unwrap();
}
