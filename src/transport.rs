//! Transport - WebSocket-Verbindungen für Signaling und Media
//!
//! Beide Kanäle (Signaling und Media) sprechen JSON-Textframes über eine
//! WebSocket-Verbindung. Der `Connector` kapselt den Verbindungsaufbau,
//! damit Client und Media-Session gegen einen austauschbaren Transport
//! programmiert sind.

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Failed to receive frame: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed by remote")]
    Closed,
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Schreibende Hälfte einer Verbindung (Textframes)
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Lesende Hälfte einer Verbindung (Textframes)
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Eine geöffnete Verbindung, bereits in Sink und Stream aufgeteilt
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Baut Verbindungen zu einer URL auf
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// `Connector` auf Basis von tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let url = url.to_string();

        Box::pin(async move {
            tracing::debug!("Opening WebSocket: {}", url);

            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let (write, read) = ws_stream.split();

            let sink = write
                .with(|text: String| async move {
                    Ok::<Message, tokio_tungstenite::tungstenite::Error>(Message::Text(text))
                })
                .sink_map_err(|e| TransportError::SendFailed(e.to_string()));

            // Nur Textframes sind relevant; Close beendet den Stream aus Sicht des Lesers
            let stream = read.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
                }
            });

            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
