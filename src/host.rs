//! Host-Schnittstellen
//!
//! Alles, was die App um den Call-Kern herum bereitstellt: Identität,
//! Vordergrund-Status, Navigation, Hinweise an den Benutzer, Mikrofon,
//! Wiedergabe und das Schreiben temporärer WAV-Clips.
//!
//! Für den Headless-Betrieb gibt es einfache Implementierungen, die nur
//! loggen bzw. Dateien in ein Verzeichnis schreiben.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::CaptureConfig;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No audio device available: {0}")]
    Unavailable(String),

    #[error("Audio device failed: {0}")]
    Failed(String),

    #[error("Failed to write clip: {0}")]
    ClipWrite(String),
}

// ============================================================================
// APP COLLABORATORS
// ============================================================================

/// Liefert die Identität des angemeldeten Benutzers
pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

/// Gibt an, ob die App gerade im Vordergrund ist
pub trait AppVisibility: Send + Sync {
    fn is_foreground(&self) -> bool;
}

/// Navigationsziele, die der Call-Kern anfordert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    /// Eingehender Anruf mit Annehmen/Ablehnen
    IncomingCall {
        call_id: String,
        caller: String,
        ws_url: Option<String>,
    },
    /// Aktiver Anruf
    VoiceCall { ws_url: String, peer: String },
    /// Zurück zur Hauptansicht
    Main,
}

impl Screen {
    /// Name des Screens in der App-Navigation
    pub fn name(&self) -> &'static str {
        match self {
            Screen::IncomingCall { .. } => "IncomingCallScreen",
            Screen::VoiceCall { .. } => "VoiceCallScreen",
            Screen::Main => "Main",
        }
    }

    /// Navigations-Parameter als JSON
    pub fn params(&self) -> serde_json::Value {
        match self {
            Screen::IncomingCall {
                call_id,
                caller,
                ws_url,
            } => serde_json::json!({
                "callId": call_id,
                "caller": caller,
                "ws_url": ws_url
            }),
            Screen::VoiceCall { ws_url, peer } => serde_json::json!({
                "ws_url": ws_url,
                "peer": peer
            }),
            Screen::Main => serde_json::Value::Null,
        }
    }
}

/// Nimmt Navigationsbefehle entgegen
pub trait Navigator: Send + Sync {
    fn navigate(&self, screen: Screen);
}

/// Für den Benutzer sichtbarer Hinweis (Toast/Alert)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Zeigt Hinweise an
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

// ============================================================================
// AUDIO COLLABORATORS
// ============================================================================

/// Callback für aufgenommene Chunks (Base64-kodiertes PCM16LE)
pub type ChunkCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Mikrofon mit Chunk-Callback
pub trait CaptureDevice: Send + Sync {
    fn start(&self, config: &CaptureConfig, on_chunk: ChunkCallback) -> Result<(), DeviceError>;
    fn stop(&self);
}

/// Spielt eine Datei ab; das Future endet, wenn der Clip fertig ist
pub trait PlaybackSink: Send + Sync {
    fn play_url(&self, uri: &str) -> BoxFuture<'static, Result<(), DeviceError>>;
}

/// Schreibt temporäre WAV-Clips
pub trait ClipWriter: Send + Sync {
    fn write_clip(&self, wav: &[u8]) -> Result<PathBuf, DeviceError>;
    fn discard(&self, path: &Path);
}

/// Bündelt alle Host-Schnittstellen für den Call-Kern
#[derive(Clone)]
pub struct HostServices {
    pub identity: Arc<dyn IdentityProvider>,
    pub visibility: Arc<dyn AppVisibility>,
    pub navigator: Arc<dyn Navigator>,
    pub notifier: Arc<dyn Notifier>,
    pub capture: Arc<dyn CaptureDevice>,
    pub playback: Arc<dyn PlaybackSink>,
    pub clips: Arc<dyn ClipWriter>,
}

impl HostServices {
    /// Host ohne UI und ohne Audiogeräte, für den Headless-Betrieb
    pub fn headless(user_id: Option<String>, clip_dir: PathBuf) -> Self {
        Self {
            identity: Arc::new(SessionIdentity::new(user_id)),
            visibility: Arc::new(ForegroundFlag::new(true)),
            navigator: Arc::new(LogNavigator),
            notifier: Arc::new(LogNotifier),
            capture: Arc::new(NullCapture),
            playback: Arc::new(NullPlayback),
            clips: Arc::new(DirClipWriter::new(clip_dir)),
        }
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("user_id", &self.identity.user_id())
            .field("foreground", &self.visibility.is_foreground())
            .finish()
    }
}

// ============================================================================
// HEADLESS IMPLEMENTATIONS
// ============================================================================

/// Identität, die von außen gesetzt wird (Login/Logout)
#[derive(Debug, Default)]
pub struct SessionIdentity {
    user_id: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: RwLock::new(user_id),
        }
    }

    pub fn set(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id;
    }
}

impl IdentityProvider for SessionIdentity {
    fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}

/// Vordergrund-Flag, das vom Host umgeschaltet wird
#[derive(Debug)]
pub struct ForegroundFlag(AtomicBool);

impl ForegroundFlag {
    pub fn new(foreground: bool) -> Self {
        Self(AtomicBool::new(foreground))
    }

    pub fn set(&self, foreground: bool) {
        self.0.store(foreground, Ordering::SeqCst);
    }
}

impl AppVisibility for ForegroundFlag {
    fn is_foreground(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Navigator ohne UI, protokolliert nur
#[derive(Debug, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, screen: Screen) {
        tracing::info!("Navigate to {} {}", screen.name(), screen.params());
    }
}

/// Notifier ohne UI, protokolliert nur
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        tracing::warn!("{}: {}", notice.title, notice.message);
    }
}

/// Mikrofon-Ersatz, der nie Chunks liefert
#[derive(Debug, Default)]
pub struct NullCapture;

impl CaptureDevice for NullCapture {
    fn start(&self, config: &CaptureConfig, _on_chunk: ChunkCallback) -> Result<(), DeviceError> {
        tracing::info!(
            "Capture requested ({} Hz, {} channel(s)) but no microphone is attached",
            config.sample_rate,
            config.channels
        );
        Ok(())
    }

    fn stop(&self) {}
}

/// Wiedergabe-Ersatz, der nur die Clip-Dauer abwartet
#[derive(Debug, Default)]
pub struct NullPlayback;

impl PlaybackSink for NullPlayback {
    fn play_url(&self, uri: &str) -> BoxFuture<'static, Result<(), DeviceError>> {
        let path = uri.trim_start_matches("file://").to_string();
        Box::pin(async move {
            let duration = std::fs::metadata(&path)
                .map(|m| clip_duration(m.len() as usize))
                .map_err(|e| DeviceError::Failed(e.to_string()))?;
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }
}

/// Dauer eines 8kHz/16-Bit/Mono-WAV-Clips anhand seiner Dateigröße
pub fn clip_duration(wav_len: usize) -> std::time::Duration {
    let samples = wav_len.saturating_sub(crate::call_engine::WAV_HEADER_LEN) / 2;
    std::time::Duration::from_millis((samples as u64 * 1000) / 8000)
}

/// Schreibt Clips als `chunk-<uuid>.wav` in ein Verzeichnis
#[derive(Debug, Clone)]
pub struct DirClipWriter {
    dir: PathBuf,
}

impl DirClipWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ClipWriter for DirClipWriter {
    fn write_clip(&self, wav: &[u8]) -> Result<PathBuf, DeviceError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DeviceError::ClipWrite(e.to_string()))?;

        let path = self.dir.join(format!("chunk-{}.wav", uuid::Uuid::new_v4()));
        std::fs::write(&path, wav).map_err(|e| DeviceError::ClipWrite(e.to_string()))?;
        Ok(path)
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("Failed to remove clip {:?}: {}", path, e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
