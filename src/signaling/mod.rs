//! Signaling Module - WebSocket Client für den Signaling-Server
//!
//! Dieses Modul verwaltet die Steuerverbindung des Benutzers:
//! - WebSocket-Verbindung aufbauen und mit Backoff wiederherstellen
//! - Heartbeat und Erkennung toter Verbindungen
//! - Eingehende Ereignisse parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{
    reconnect_delay, ConnectionState, SignalingClient, SignalingError, SignalingEvent,
};
pub use messages::*;
