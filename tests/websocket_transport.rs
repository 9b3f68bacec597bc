//! WebSocket transport integration tests
//!
//! Runs a tokio-tungstenite server on loopback and drives a `Session` over
//! the real `WsConnector`.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use cauldron::auth::{IdentityToken, StaticCredentials};
use cauldron::protocol::QueryPayload;
use cauldron::session::{Connector, WsConnector};
use cauldron::signing::{SignedHeaders, StaticSigner};
use cauldron::{CauldronError, Session, SessionConfig};

fn signed_headers() -> SignedHeaders {
    SignedHeaders::new()
        .with(
            "Authorization",
            "AWS4-HMAC-SHA256 Credential=AKID/20240101/eu-west-1/execute-api/aws4_request, \
             SignedHeaders=host;x-amz-date;x-amz-security-token, Signature=abc123",
        )
        .with("X-Amz-Date", "20240101T000000Z")
        .with("X-Amz-Security-Token", "session-token")
}

fn ws_session(url: String) -> Session {
    Session::new(
        "ana@example.com",
        Arc::new(StaticCredentials::new(IdentityToken::new("id-token"))),
        Arc::new(StaticSigner::new(signed_headers())),
        Arc::new(WsConnector),
        SessionConfig::new(url),
    )
}

#[tokio::test]
async fn test_query_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (token_tx, token_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let token = req
                    .headers()
                    .get("X-Amz-Security-Token")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = token_tx.send(token);
                Ok(resp)
            },
        )
        .await
        .unwrap();

        let frame = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected a text frame, got {other:?}"),
        };
        let payload: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let request_id = payload["requestId"].as_str().unwrap().to_string();

        // Second part first; the client reorders by subBatchSerial
        for (serial, value) in [(1, "b"), (0, "a")] {
            let fragment = json!({
                "messageType": "DATA",
                "requestId": request_id,
                "totalBatches": 1,
                "subBatchSerial": serial,
                "totalSubBatches": 2,
                "data": [{"col": value}],
            });
            ws.send(Message::Text(fragment.to_string())).await.unwrap();
        }

        // Drain until the client goes away
        while let Some(Ok(_)) = ws.next().await {}
        payload
    });

    let session = ws_session(format!("ws://{}", addr));
    let result = session
        .query(QueryPayload::sql("SELECT col FROM t").with_request_id("ws-1"))
        .await
        .unwrap();

    assert_eq!(result.request_id, "ws-1");
    assert_eq!(result.data.len(), 2);
    assert_eq!(result.data[0]["col"], "a");
    assert_eq!(result.data[1]["col"], "b");
    assert_eq!(token_rx.await.unwrap().as_deref(), Some("session-token"));

    session.close();
    let payload = server.await.unwrap();
    assert_eq!(payload["sql"], "SELECT col FROM t");
    assert_eq!(payload["messageType"], "SQL_QUERY");
}

#[tokio::test]
async fn test_server_close_fails_pending_query() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Read the query, then hang up without answering
        let _ = ws.next().await;
        let _ = ws.close(None).await;
    });

    let session = ws_session(format!("ws://{}", addr));
    let err = session
        .query(QueryPayload::sql("SELECT 1").with_request_id("never"))
        .await
        .unwrap_err();

    assert!(matches!(err, CauldronError::ConnectionLost(_)), "got {err:?}");
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let result = WsConnector
        .connect(&format!("ws://{}", addr), &signed_headers())
        .await;
    assert!(matches!(result, Err(CauldronError::Connect(_))));

    let session = ws_session(format!("ws://{}", addr));
    let err = session.query(QueryPayload::sql("SELECT 1")).await.unwrap_err();
    assert!(matches!(err, CauldronError::Connect(_)));
    assert!(err.is_infrastructure_failure());
}
