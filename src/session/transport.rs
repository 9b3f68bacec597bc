//! WebSocket Transport Layer
//!
//! Single responsibility: open a connection and move text frames.
//! No knowledge of the query protocol, correlation, or session lifecycle.
//!
//! The engine talks to the transport through three small traits so the
//! physical socket can be substituted (see `session::memory`).

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::signing::SignedHeaders;
use crate::types::{CauldronError, Result};

/// Write half of an open connection
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one frame atomically
    async fn write(&mut self, frame: String) -> Result<()>;

    /// Best-effort close handshake
    async fn close(&mut self);
}

/// Read half of an open connection
#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame; `Ok(None)` when the peer closed cleanly
    async fn read(&mut self) -> Result<Option<String>>;
}

/// Opens connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &SignedHeaders,
    ) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>)>;
}

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// tokio-tungstenite backed connector
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &SignedHeaders,
    ) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>)> {
        debug!(url = %url, "Connecting to WebSocket");

        let mut request = url
            .into_client_request()
            .map_err(|e| CauldronError::Connect(format!("Failed to build request: {}", e)))?;

        for (name, value) in headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CauldronError::Connect(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CauldronError::Connect(format!("Invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| CauldronError::Connect(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok((Box::new(WsWriter { sink }), Box::new(WsReader { stream })))
    }
}

struct WsWriter {
    sink: WsSink,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| CauldronError::Transport(format!("Failed to send: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsReader {
    stream: WsStream,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data).map(Some).map_err(|e| {
                        CauldronError::Protocol(format!("Binary frame is not UTF-8: {}", e))
                    })
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(CauldronError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }
}
