//! Voice Bridge - Call-Kern eines mobilen Voice-Clients
//!
//! Der Kern zwischen App-Oberfläche und Servern:
//! - WebSocket-Signaling mit Heartbeat und Reconnect
//! - Zustandsmaschine für genau einen Anruf
//! - G.711 μ-law Media-Relay (Mikrofon raus, WAV-Clips rein)
//!
//! Die App liefert Identität, Navigation, Mikrofon und Wiedergabe über die
//! Schnittstellen in [`host`].

pub mod call_engine;
pub mod config;
pub mod host;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

use call_engine::{CallError, CallSessionController};
use config::Config;
use host::HostServices;
use signaling::SignalingClient;
use std::sync::Arc;
use tokio::task::JoinHandle;
use transport::{Connector, WsConnector};

/// Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "voice_bridge=debug,tungstenite=warn";

/// Initialisiert das Logging; ein zweiter Aufruf ändert nichts
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Signaling-Client und Call-Controller, fertig verdrahtet
pub struct VoiceBridge {
    config: Config,
    host: HostServices,
    signaling: SignalingClient,
    calls: CallSessionController,
    listener: JoinHandle<()>,
}

impl VoiceBridge {
    /// Baut den Kern mit echten WebSocket-Verbindungen
    pub fn init(config: Config, host: HostServices) -> Self {
        Self::with_connector(config, host, Arc::new(WsConnector::new()))
    }

    /// Baut den Kern mit einem beliebigen Transport (Signaling und Media)
    pub fn with_connector(config: Config, host: HostServices, connector: Arc<dyn Connector>) -> Self {
        tracing::info!("Initializing voice bridge ({})", config.signaling.url);

        let signaling = SignalingClient::new(config.signaling.clone(), Arc::clone(&connector));
        let calls = CallSessionController::new(&config, signaling.clone(), connector, host.clone());
        let listener = calls.spawn_signal_listener(signaling.subscribe());

        Self {
            config,
            host,
            signaling,
            calls,
            listener,
        }
    }

    /// Verbindet das Signaling als angemeldeter Benutzer
    pub fn connect(&self) -> Result<(), CallError> {
        let user_id = self.host.identity.user_id().ok_or(CallError::NoIdentity)?;

        if !self.signaling.connect(&user_id)? {
            tracing::debug!("Signaling already connecting for {}", user_id);
        }
        Ok(())
    }

    /// Logout: laufenden Anruf beenden, Signaling schließen
    ///
    /// Danach kann mit `connect` erneut verbunden werden.
    pub async fn shutdown(&self) {
        if let Err(e) = self.calls.hangup().await {
            tracing::warn!("Hangup during shutdown failed: {}", e);
        }
        self.signaling.shutdown();
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn calls(&self) -> &CallSessionController {
        &self.calls
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for VoiceBridge {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for VoiceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceBridge")
            .field("signaling", &self.signaling)
            .field("calls", &self.calls)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
