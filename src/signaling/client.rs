//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die eine, langlebige Steuerverbindung pro Benutzer:
//! - Verbindungsaufbau mit Schutz gegen doppelte Verbindungen
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Heartbeat (ping/pong) zur Erkennung toter Verbindungen
//! - Event-basierte Weitergabe eingehender Nachrichten

use super::messages::*;
use crate::config::SignalingConfig;
use crate::transport::{Connector, Transport, TransportError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Größe der ausgehenden Warteschlange
const OUTBOUND_QUEUE: usize = 100;

/// Peer-Name, wenn `call_ready` kein `by` mitliefert
const DEFAULT_READY_PEER: &str = "AI";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Eingehender Anruf
    IncomingCall { from: String, ws_url: Option<String> },

    /// Anruf wurde von der Gegenseite angenommen
    CallAccepted { by: String, ws_url: String },

    /// Media-Verbindung ist bereit
    CallReady { by: String, ws_url: String },

    /// Anruf abgelehnt
    CallRejected { by: String, reason: Option<String> },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

/// Lebenszyklus der Steuerverbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Default)]
struct ClientState {
    lifecycle: ConnectionState,
    user_id: Option<String>,
    retry_count: u32,
    last_pong: Option<Instant>,
    /// Jede Verbindung bekommt eine eigene Generation; Tasks alter
    /// Generationen ändern den Zustand nicht mehr
    generation: u64,
    tx: Option<mpsc::Sender<String>>,
    close_signal: Option<Arc<Notify>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct ClientInner {
    config: SignalingConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ClientState>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

/// Verzögerung vor dem Reconnect-Versuch Nummer `attempt`
///
/// `min(max, base × 2^attempt)`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
///
/// Klonen ist billig; alle Klone teilen dieselbe Verbindung.
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient (noch ohne Verbindung)
    pub fn new(config: SignalingConfig, connector: Arc<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                state: Mutex::new(ClientState::default()),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktueller Verbindungsstatus
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().lifecycle
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Anzahl der Reconnect-Versuche seit der letzten erfolgreichen Verbindung
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }

    /// Benutzer, für den die Verbindung besteht
    pub fn user_id(&self) -> Option<String> {
        self.inner.state.lock().user_id.clone()
    }

    /// Baut die Verbindungs-URL für einen Benutzer
    pub fn endpoint_for(&self, user_id: &str) -> Result<String, SignalingError> {
        let mut url = url::Url::parse(&self.inner.config.url)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("user", user_id);
        Ok(url.to_string())
    }

    /// Verbindet mit dem Signaling-Server
    ///
    /// Ist bereits eine Verbindung offen oder im Aufbau, passiert nichts
    /// (`Ok(false)`). Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn connect(&self, user_id: &str) -> Result<bool, SignalingError> {
        self.start_connection(user_id, None)
    }

    /// Gemeinsamer Weg für `connect` und Reconnect
    ///
    /// Ein Reconnect übergibt die Generation, in der er geplant wurde. Hat
    /// sich seitdem etwas geändert (Logout, neuer Connect), verfällt er.
    fn start_connection(&self, user_id: &str, scheduled_in: Option<u64>) -> Result<bool, SignalingError> {
        let url = self.endpoint_for(user_id)?;

        let generation = {
            let mut state = self.inner.state.lock();
            if let Some(scheduled_in) = scheduled_in {
                if state.shut_down || state.generation != scheduled_in {
                    tracing::debug!("Dropping stale reconnect");
                    return Ok(false);
                }
                state.reconnect = None;
            }

            if matches!(
                state.lifecycle,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                tracing::debug!("Already connected or connecting");
                return Ok(false);
            }

            // Ein manueller Connect ersetzt einen wartenden Reconnect
            if let Some(pending) = state.reconnect.take() {
                pending.abort();
            }

            state.shut_down = false;
            state.user_id = Some(user_id.to_string());
            state.lifecycle = ConnectionState::Connecting;
            state.generation += 1;
            state.generation
        };

        tracing::info!("Connecting to signaling server as {}", user_id);

        tokio::spawn(Self::run_connection(Arc::clone(&self.inner), generation, url));
        Ok(true)
    }

    /// Trennt die Verbindung endgültig (Logout)
    ///
    /// Heartbeat und Reconnect werden gestoppt. Ein späteres `connect`
    /// startet wieder normal.
    pub fn shutdown(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            let was_open = state.lifecycle == ConnectionState::Open;

            state.shut_down = true;
            state.generation += 1;
            state.lifecycle = ConnectionState::Disconnected;
            state.user_id = None;
            state.retry_count = 0;
            state.tx = None;

            if let Some(close) = state.close_signal.take() {
                close.notify_one();
            }
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            was_open
        };

        tracing::info!("Signaling client shut down");
        if was_open {
            let _ = self.inner.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Sendet eine Nachricht über die offene Verbindung
    ///
    /// Ohne offene Verbindung wird nichts gesendet und `NotConnected`
    /// zurückgegeben; der Aufrufer entscheidet über einen erneuten Versuch.
    pub fn send<T: Serialize>(&self, payload: &T) -> Result<(), SignalingError> {
        let tx = {
            let state = self.inner.state.lock();
            if state.lifecycle == ConnectionState::Open {
                state.tx.clone()
            } else {
                None
            }
        };

        let text = serde_json::to_string(payload)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let Some(tx) = tx else {
            tracing::warn!("Tried sending signal but socket not ready: {}", text);
            return Err(SignalingError::NotConnected);
        };

        // try_send ist non-blocking; der Writer-Task ist der einzige Schreiber
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Nimmt einen Anruf an
    pub fn accept_call(&self, from: String, to: String, call_id: String) -> Result<(), SignalingError> {
        self.send(&AcceptCallPayload::new(from, to, call_id))
    }

    /// Lehnt einen Anruf ab
    pub fn reject_call(
        &self,
        from: String,
        to: String,
        call_id: String,
        reason: Option<String>,
    ) -> Result<(), SignalingError> {
        self.send(&RejectCallPayload::new(from, to, call_id, reason))
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Baut eine Verbindung auf und liest bis sie endet
    async fn run_connection(inner: Arc<ClientInner>, generation: u64, url: String) {
        let transport = match inner.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Signaling connection failed: {}", e);
                Self::handle_disconnect(&inner, generation);
                return;
            }
        };

        let Transport { sink, mut stream } = transport;
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let close_signal = Arc::new(Notify::new());

        {
            let mut state = inner.state.lock();
            if state.generation != generation || state.shut_down {
                // Verbindung wurde inzwischen ersetzt oder beendet
                return;
            }

            state.lifecycle = ConnectionState::Open;
            state.retry_count = 0;
            state.last_pong = Some(Instant::now());
            state.tx = Some(tx);
            state.close_signal = Some(Arc::clone(&close_signal));

            if let Some(old) = state.heartbeat.take() {
                old.abort();
            }
            state.heartbeat = Some(tokio::spawn(Self::heartbeat_loop(
                Arc::clone(&inner),
                generation,
            )));
        }

        tracing::info!("Connected to signaling server");
        let _ = inner.event_tx.send(SignalingEvent::Connected);

        // Write-Task: einziger Schreibpfad für diese Verbindung
        tokio::spawn(async move {
            let mut sink = sink;
            let mut rx = rx;
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::error!("Failed to send signaling message: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = close_signal.notified() => {
                    tracing::info!("Closing signaling connection");
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(text)) => Self::handle_frame(&inner, &text),
                    Some(Err(TransportError::Closed)) | None => {
                        tracing::info!("Signaling connection closed by server");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Signaling connection error: {}", e);
                        break;
                    }
                },
            }
        }

        Self::handle_disconnect(&inner, generation);
    }

    /// Verbindung ist weg: Zustand zurücksetzen und Reconnect planen
    fn handle_disconnect(inner: &Arc<ClientInner>, generation: u64) {
        let was_open = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }

            let was_open = state.lifecycle == ConnectionState::Open;
            state.lifecycle = ConnectionState::Disconnected;
            state.tx = None;
            state.close_signal = None;
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }

            if !state.shut_down {
                Self::schedule_reconnect(inner, &mut state);
            }
            was_open
        };

        if was_open {
            tracing::warn!("Signal disconnected");
            let _ = inner.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Plant genau einen Reconnect-Versuch
    fn schedule_reconnect(inner: &Arc<ClientInner>, state: &mut ClientState) {
        if state.reconnect.is_some() {
            return;
        }
        let Some(user_id) = state.user_id.clone() else {
            return;
        };

        let delay = reconnect_delay(
            state.retry_count,
            inner.config.reconnect_base(),
            inner.config.reconnect_max(),
        );
        state.retry_count = state.retry_count.saturating_add(1);

        tracing::info!("Reconnecting in {}ms", delay.as_millis());

        let scheduled_in = state.generation;
        let inner = Arc::clone(inner);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let client = SignalingClient { inner };
            if let Err(e) = client.start_connection(&user_id, Some(scheduled_in)) {
                tracing::error!("Reconnect failed: {}", e);
            }
        }));
    }

    /// Sendet regelmäßig `ping` und schließt die Verbindung ohne `pong`
    async fn heartbeat_loop(inner: Arc<ClientInner>, generation: u64) {
        let period = inner.config.heartbeat_interval();
        let pong_timeout = inner.config.pong_timeout();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            interval.tick().await;

            let (tx, last_pong, close) = {
                let state = inner.state.lock();
                if state.generation != generation || state.lifecycle != ConnectionState::Open {
                    break;
                }
                (state.tx.clone(), state.last_pong, state.close_signal.clone())
            };

            if let (Some(tx), Ok(ping)) = (tx, serde_json::to_string(&PingPayload::new())) {
                if let Err(e) = tx.try_send(ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }

            let stale = last_pong.is_some_and(|at| at.elapsed() > pong_timeout);
            if stale {
                tracing::warn!(
                    "No pong in {}s, reconnecting",
                    pong_timeout.as_secs()
                );
                if let Some(close) = close {
                    close.notify_one();
                }
                break;
            }
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Verarbeitet einen eingehenden Textframe
    fn handle_frame(inner: &ClientInner, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Pong) => {
                inner.state.lock().last_pong = Some(Instant::now());
            }
            Ok(Inbound::Event(event)) => Self::handle_server_event(inner, event),
            Ok(Inbound::Unknown(_)) => {
                tracing::debug!("Unhandled signaling event: {}", text);
            }
            Err(e) => {
                tracing::warn!("Signaling parse error: {}", e);
            }
        }
    }

    /// Leitet Server-Ereignisse an die Subscriber weiter
    fn handle_server_event(inner: &ClientInner, event: ServerEvent) {
        let event = match event {
            ServerEvent::IncomingCall { from, ws_url } => {
                tracing::info!("Incoming call from {}", from);
                SignalingEvent::IncomingCall { from, ws_url }
            }
            ServerEvent::CallAccepted { by, ws_url } => {
                tracing::info!("Call accepted by {}", by);
                SignalingEvent::CallAccepted { by, ws_url }
            }
            ServerEvent::CallReady { by, ws_url } => {
                tracing::info!("Call ready");
                SignalingEvent::CallReady {
                    by: by.unwrap_or_else(|| DEFAULT_READY_PEER.to_string()),
                    ws_url,
                }
            }
            ServerEvent::CallRejected { by, reason } => {
                tracing::info!("Call rejected by {} (reason: {:?})", by, reason);
                SignalingEvent::CallRejected { by, reason }
            }
        };

        let _ = inner.event_tx.send(event);
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SignalingClient")
            .field("server_url", &self.inner.config.url)
            .field("state", &state.lifecycle)
            .field("retry_count", &state.retry_count)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
