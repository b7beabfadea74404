//! Message Types für das Signaling-Protokoll
//!
//! Ausgehende Nachrichten tragen ein `type`-Feld, eingehende Ereignisse ein
//! `event`-Feld. Einzige Ausnahme ist die Heartbeat-Antwort `{type:"pong"}`.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct PingPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl PingPayload {
    pub fn new() -> Self {
        Self { msg_type: "ping" }
    }
}

impl Default for PingPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Anruf annehmen
#[derive(Debug, Clone, Serialize)]
pub struct AcceptCallPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub from: String,
    pub to: String,
    #[serde(rename = "callId")]
    pub call_id: String,
}

impl AcceptCallPayload {
    pub fn new(from: String, to: String, call_id: String) -> Self {
        Self {
            msg_type: "accept_call",
            from,
            to,
            call_id,
        }
    }
}

/// Anruf ablehnen
#[derive(Debug, Clone, Serialize)]
pub struct RejectCallPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub from: String,
    pub to: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RejectCallPayload {
    pub fn new(from: String, to: String, call_id: String, reason: Option<String>) -> Self {
        Self {
            msg_type: "reject_call",
            from,
            to,
            call_id,
            reason,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle bekannten Server-Ereignisse
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Eingehender Anruf
    IncomingCall {
        from: String,
        #[serde(default)]
        ws_url: Option<String>,
    },

    /// Gegenseite hat angenommen
    CallAccepted { by: String, ws_url: String },

    /// Media-Verbindung steht bereit
    CallReady {
        #[serde(default)]
        by: Option<String>,
        ws_url: String,
    },

    /// Gegenseite hat abgelehnt
    CallRejected {
        by: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Ergebnis der Klassifizierung eines eingehenden Frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Heartbeat-Antwort
    Pong,
    /// Bekanntes Ereignis
    Event(ServerEvent),
    /// Gültiges JSON mit unbekanntem oder fehlendem `event`
    Unknown(String),
}

/// Namen der Ereignisse, die `ServerEvent` kennt
const KNOWN_EVENTS: [&str; 4] = ["incoming_call", "call_accepted", "call_ready", "call_rejected"];

impl Inbound {
    /// Klassifiziert einen Textframe
    ///
    /// Fehler bedeuten unlesbares JSON oder ein bekanntes Ereignis mit
    /// fehlenden Feldern.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if value.get("type").and_then(|t| t.as_str()) == Some("pong") {
            return Ok(Inbound::Pong);
        }

        match value.get("event").and_then(|e| e.as_str()) {
            Some(name) if KNOWN_EVENTS.contains(&name) => {
                Ok(Inbound::Event(serde_json::from_value(value)?))
            }
            Some(name) => Ok(Inbound::Unknown(name.to_string())),
            None => Ok(Inbound::Unknown(String::new())),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
