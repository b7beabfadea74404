//! Konfiguration
//!
//! Alle Werte haben Defaults, die dem Verhalten des mobilen Clients
//! entsprechen. Eine optionale `config.json` im App-Konfigurationsverzeichnis
//! überschreibt die Defaults, Umgebungsvariablen überschreiben beides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::call_engine::WireEncoding;

/// Umgebungsvariable für die Signaling-URL
pub const ENV_SIGNALING_URL: &str = "VOICE_BRIDGE_SIGNALING_URL";
/// Umgebungsvariable für den AI-Media-Endpoint
pub const ENV_MEDIA_URL: &str = "VOICE_BRIDGE_MEDIA_URL";
/// Umgebungsvariable für den Accept-Timeout in Millisekunden
pub const ENV_ACCEPT_TIMEOUT_MS: &str = "VOICE_BRIDGE_ACCEPT_TIMEOUT_MS";
/// Umgebungsvariable für das Verzeichnis der WAV-Clips
pub const ENV_CLIP_DIR: &str = "VOICE_BRIDGE_CLIP_DIR";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

/// Gesamte Konfiguration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub call: CallConfig,
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
}

/// Signaling-Verbindung: Endpoint, Heartbeat und Backoff
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Basis-URL, der User wird als `?user=` angehängt
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            heartbeat_interval_ms: 10_000,
            pong_timeout_ms: 30_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Anruf-Ablauf
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Wie lange nach `accept_call` auf `call_ready`/`call_accepted` gewartet wird
    pub accept_timeout_ms: u64,
    /// Wie lange ein unbeantworteter Anruf klingelt
    pub ring_timeout_ms: u64,
    /// Obergrenze für den Aufbau der Media-Verbindung
    pub media_connect_timeout_ms: u64,
    /// Media-Endpoint für AI-Anrufe und den Push-Pfad
    pub ai_media_url: String,
    /// Encoding, das im `start`-Frame angekündigt wird
    pub encoding: WireEncoding,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 15_000,
            ring_timeout_ms: 45_000,
            media_connect_timeout_ms: 10_000,
            ai_media_url: "wss://127.0.0.1/media".to_string(),
            encoding: WireEncoding::MuLaw,
        }
    }
}

impl CallConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn media_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.media_connect_timeout_ms)
    }
}

/// Wiedergabe der empfangenen Audio-Daten
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Größe eines Clips in Bytes PCM16 (16000 ≈ 1s bei 8kHz mono)
    pub frame_bytes: usize,
    /// Pause zwischen zwei Clips
    pub settle_ms: u64,
    /// Obergrenze des Playback-Buffers; ältere Daten werden verworfen
    pub max_buffered_bytes: usize,
    /// Verzeichnis für temporäre WAV-Clips (Default: Cache-Verzeichnis)
    pub clip_dir: Option<PathBuf>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_bytes: 16_000,
            settle_ms: 250,
            max_buffered_bytes: 160_000,
            clip_dir: None,
        }
    }
}

impl PlaybackConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Clip-Verzeichnis, fällt auf das Cache-Verzeichnis der App zurück
    pub fn resolve_clip_dir(&self) -> PathBuf {
        if let Some(dir) = &self.clip_dir {
            return dir.clone();
        }

        directories::ProjectDirs::from("com", "voicebridge", "voice-bridge")
            .map(|dirs| dirs.cache_dir().join("clips"))
            .unwrap_or_else(|| std::env::temp_dir().join("voice-bridge-clips"))
    }
}

/// Mikrofon-Konfiguration (fester Vertrag mit dem Capture-Gerät)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Android `VOICE_COMMUNICATION`
    pub audio_source: u32,
    pub buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 16,
            audio_source: 6,
            buffer_size: 4096,
        }
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl Config {
    /// Lädt `config.json` aus dem Konfigurationsverzeichnis (falls vorhanden)
    /// und wendet danach die Umgebungsvariablen an.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Liest eine Konfigurationsdatei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parst eine Konfiguration aus JSON; fehlende Felder bekommen Defaults
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Pfad der Konfigurationsdatei im App-Verzeichnis
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "voicebridge", "voice-bridge")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Überschreibt Werte aus einer Schlüssel-Quelle (normalerweise die Umgebung)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SIGNALING_URL) {
            self.signaling.url = url;
        }
        if let Some(url) = lookup(ENV_MEDIA_URL) {
            self.call.ai_media_url = url;
        }
        if let Some(raw) = lookup(ENV_ACCEPT_TIMEOUT_MS) {
            self.call.accept_timeout_ms =
                raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    field: "call.accept_timeout_ms",
                    reason: format!("not a number: {raw}"),
                })?;
        }
        if let Some(dir) = lookup(ENV_CLIP_DIR) {
            self.playback.clip_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Prüft Werte, mit denen die Zustandsmaschinen nicht arbeiten können
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, url) in [
            ("signaling.url", &self.signaling.url),
            ("call.ai_media_url", &self.call.ai_media_url),
        ] {
            let parsed = url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("expected ws:// or wss://, got {}", parsed.scheme()),
                });
            }
        }

        if self.signaling.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "signaling.heartbeat_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        // Ein Frame muss aus ganzen Samples bestehen
        for (field, value) in [
            ("call.ring_timeout_ms", self.call.ring_timeout_ms),
            ("call.media_connect_timeout_ms", self.call.media_connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.playback.frame_bytes == 0 || self.playback.frame_bytes % 2 != 0 {
            return Err(ConfigError::Invalid {
                field: "playback.frame_bytes",
                reason: format!("must be a positive even number, got {}", self.playback.frame_bytes),
            });
        }

        if self.playback.max_buffered_bytes < self.playback.frame_bytes {
            return Err(ConfigError::Invalid {
                field: "playback.max_buffered_bytes",
                reason: "must hold at least one frame".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
