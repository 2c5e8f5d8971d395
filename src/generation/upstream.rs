//! Link to the remote text-to-motion server.
//!
//! The server speaks a one-shot WebSocket protocol: the client sends one JSON
//! request and receives exactly one message back. A binary message is the
//! generated capture (an `.npz` payload); a text message is an error report.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::UpstreamError;

/// Largest reply accepted from the server.
pub const MAX_REPLY_BYTES: usize = 50 << 20;

/// The request body understood by the generation server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub text: String,
    /// Clip length in seconds.
    pub motion_length: f64,
    pub num_inference_steps: u32,
    pub seed: u64,
    pub adaptive_smooth: bool,
    pub static_start: bool,
    pub static_frames: u32,
    pub blend_frames: u32,
}

impl GenerateRequest {
    /// A request with the bridge's fixed smoothing settings and a seed taken
    /// from the wall clock.
    pub fn new(text: impl Into<String>, motion_length: f64, num_inference_steps: u32) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() % 10_000)
            .unwrap_or(0);

        Self {
            text: text.into(),
            motion_length,
            num_inference_steps,
            seed,
            adaptive_smooth: true,
            static_start: true,
            static_frames: 2,
            blend_frames: 8,
        }
    }
}

/// The single reply of a generation round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    /// Raw capture payload.
    Motion(Bytes),
    /// Error reported by the server.
    Error(String),
}

impl BackendReply {
    /// Interprets a text frame. The `error` field of a JSON object wins;
    /// anything else is reported verbatim.
    pub fn from_text(text: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorPayload {
            error: serde_json::Value,
        }

        match serde_json::from_str::<ErrorPayload>(text) {
            Ok(ErrorPayload {
                error: serde_json::Value::String(message),
            }) => BackendReply::Error(message),
            Ok(ErrorPayload { error }) if !error.is_null() => BackendReply::Error(error.to_string()),
            _ => BackendReply::Error(text.to_string()),
        }
    }
}

/// Something that can open a generation session.
#[async_trait]
pub trait MotionBackend: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MotionSession>, UpstreamError>;
}

/// One open connection to the generation server.
#[async_trait]
pub trait MotionSession: Send {
    async fn send(&mut self, request: &GenerateRequest) -> Result<(), UpstreamError>;

    /// Waits for the single reply.
    async fn recv(&mut self) -> Result<BackendReply, UpstreamError>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Reaches the server through the local end of the SSH tunnel.
#[derive(Debug, Clone)]
pub struct TunnelBackend {
    uri: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl TunnelBackend {
    pub fn new(local_port: u16, connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            uri: format!("ws://127.0.0.1:{}/ws", local_port),
            connect_timeout,
            response_timeout,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl MotionBackend for TunnelBackend {
    async fn connect(&self) -> Result<Box<dyn MotionSession>, UpstreamError> {
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_REPLY_BYTES))
            .max_frame_size(Some(MAX_REPLY_BYTES));

        let connecting = tokio_tungstenite::connect_async_with_config(self.uri.as_str(), Some(config), false);
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| UpstreamError::Timeout(self.connect_timeout))?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        debug!(uri = %self.uri, "Connected to motion server");
        Ok(Box::new(TunnelSession {
            stream,
            response_timeout: self.response_timeout,
        }))
    }
}

struct TunnelSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    response_timeout: Duration,
}

impl TunnelSession {
    async fn next_reply(&mut self) -> Result<BackendReply, UpstreamError> {
        while let Some(message) = self.stream.next().await {
            match message.map_err(|e| UpstreamError::Protocol(e.to_string()))? {
                Message::Binary(payload) => return Ok(BackendReply::Motion(payload)),
                Message::Text(text) => return Ok(BackendReply::from_text(text.as_str())),
                Message::Close(_) => return Err(UpstreamError::Closed),
                // Ping/pong are answered by tungstenite itself.
                _ => {}
            }
        }
        Err(UpstreamError::Closed)
    }
}

#[async_trait]
impl MotionSession for TunnelSession {
    async fn send(&mut self, request: &GenerateRequest) -> Result<(), UpstreamError> {
        let body = serde_json::to_string(request).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        self.stream
            .send(Message::Text(body.into()))
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Result<BackendReply, UpstreamError> {
        tokio::time::timeout(self.response_timeout, self.next_reply())
            .await
            .map_err(|_| UpstreamError::Timeout(self.response_timeout))?
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// How the local test server answers the single request.
    enum Answer {
        Binary(&'static [u8]),
        Text(&'static str),
        Close,
        Silent,
    }

    /// Accepts one WebSocket client, forwards its request text, then answers.
    async fn generation_server(answer: Answer) -> (u16, oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (request_tx, request_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            if let Some(Ok(Message::Text(request))) = ws.next().await {
                let _ = request_tx.send(request.to_string());
            }
            match answer {
                Answer::Binary(payload) => {
                    ws.send(Message::Ping(Bytes::new())).await.expect("ping");
                    ws.send(Message::Binary(Bytes::from_static(payload))).await.expect("reply");
                }
                Answer::Text(text) => ws.send(Message::Text(text.into())).await.expect("reply"),
                Answer::Close => ws.close(None).await.expect("close"),
                Answer::Silent => tokio::time::sleep(Duration::from_secs(30)).await,
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        (port, request_rx)
    }

    async fn round_trip(answer: Answer, response_timeout: Duration) -> (Result<BackendReply, UpstreamError>, String) {
        let (port, request_rx) = generation_server(answer).await;
        let backend = TunnelBackend::new(port, Duration::from_secs(5), response_timeout);
        let mut session = backend.connect().await.expect("connect");

        session
            .send(&GenerateRequest::new("a person waves", 4.0, 10))
            .await
            .expect("send");
        let reply = session.recv().await;
        session.close().await;

        (reply, request_rx.await.expect("request reached the server"))
    }

    #[test]
    fn request_carries_fixed_smoothing_settings() {
        let request = GenerateRequest::new("a person waves", 4.0, 10);
        assert!(request.seed < 10_000);

        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["text"], "a person waves");
        assert_eq!(json["motion_length"], 4.0);
        assert_eq!(json["num_inference_steps"], 10);
        assert_eq!(json["adaptive_smooth"], true);
        assert_eq!(json["static_start"], true);
        assert_eq!(json["static_frames"], 2);
        assert_eq!(json["blend_frames"], 8);
    }

    #[test]
    fn text_replies_are_errors() {
        assert_eq!(
            BackendReply::from_text(r#"{"error": "CUDA out of memory"}"#),
            BackendReply::Error("CUDA out of memory".to_string())
        );
        assert_eq!(
            BackendReply::from_text(r#"{"error": {"code": 3}}"#),
            BackendReply::Error(r#"{"code":3}"#.to_string())
        );
        assert_eq!(
            BackendReply::from_text("model not loaded"),
            BackendReply::Error("model not loaded".to_string())
        );
        assert_eq!(
            BackendReply::from_text(r#"{"detail": "nope"}"#),
            BackendReply::Error(r#"{"detail": "nope"}"#.to_string())
        );
    }

    #[test]
    fn backend_targets_the_tunnel_port() {
        let backend = TunnelBackend::new(17000, Duration::from_secs(10), Duration::from_secs(600));
        assert_eq!(backend.uri(), "ws://127.0.0.1:17000/ws");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let backend = TunnelBackend::new(port, Duration::from_secs(2), Duration::from_secs(2));
        assert!(backend.connect().await.is_err());
    }

    #[tokio::test]
    async fn binary_reply_is_the_motion_payload() {
        let (reply, request) = round_trip(Answer::Binary(b"PK\x03\x04npz"), Duration::from_secs(5)).await;

        assert_eq!(reply.expect("reply"), BackendReply::Motion(Bytes::from_static(b"PK\x03\x04npz")));
        let request: GenerateRequest = serde_json::from_str(&request).expect("request json");
        assert_eq!(request.text, "a person waves");
        assert_eq!(request.motion_length, 4.0);
        assert_eq!(request.num_inference_steps, 10);
    }

    #[tokio::test]
    async fn text_reply_is_a_server_error() {
        let (reply, _) = round_trip(Answer::Text(r#"{"error": "model not loaded"}"#), Duration::from_secs(5)).await;
        assert_eq!(reply.expect("reply"), BackendReply::Error("model not loaded".to_string()));
    }

    #[tokio::test]
    async fn server_close_before_reply_is_reported() {
        let (reply, _) = round_trip(Answer::Close, Duration::from_secs(5)).await;
        assert!(matches!(reply, Err(UpstreamError::Closed)), "{reply:?}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let timeout = Duration::from_millis(300);
        let (reply, _) = round_trip(Answer::Silent, timeout).await;
        assert!(matches!(reply, Err(UpstreamError::Timeout(d)) if d == timeout), "{reply:?}");
    }
}
