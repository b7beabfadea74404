//! Test-Hilfen: Mock-Transport und aufzeichnende Host-Schnittstellen

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::SinkExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::CaptureConfig;
use crate::host::{
    AppVisibility, CaptureDevice, ChunkCallback, ClipWriter, DeviceError, HostServices,
    IdentityProvider, Navigator, Notice, Notifier, PlaybackSink, Screen,
};
use crate::transport::{Connector, Transport, TransportError};

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// Server-Seite einer Mock-Verbindung
pub struct MockPeer {
    pub url: String,
    /// Frames, die der Client gesendet hat
    pub outbound: fmpsc::UnboundedReceiver<String>,
    /// Frames an den Client
    pub inbound: fmpsc::UnboundedSender<Result<String, TransportError>>,
}

impl MockPeer {
    pub fn send_json(&self, value: serde_json::Value) {
        let _ = self.inbound.unbounded_send(Ok(value.to_string()));
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.inbound.unbounded_send(Ok(text.to_string()));
    }

    /// Schließt die Verbindung von Server-Seite
    pub fn close(&self) {
        self.inbound.close_channel();
    }

    /// Alle bisher empfangenen Frames als JSON
    pub fn drain_json(&mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(Some(text)) = self.outbound.try_next() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }
}

/// Connector, dessen Verbindungen der Test kontrolliert
pub struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    stall: AtomicBool,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            peers_tx,
            urls: Mutex::new(Vec::new()),
        });
        (connector, peers_rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Weitere Verbindungsversuche schlagen fehl
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Weitere Verbindungsversuche hängen im Handshake
    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());

        if self.refuse.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::ConnectionFailed("refused".to_string())) });
        }
        if self.stall.load(Ordering::SeqCst) {
            return Box::pin(futures::future::pending());
        }

        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<String, TransportError>>();

        let _ = self.peers_tx.send(MockPeer {
            url: url.to_string(),
            outbound: server_rx,
            inbound: server_tx,
        });

        let sink = client_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string()));

        Box::pin(async move {
            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(client_rx),
            })
        })
    }
}

/// Wartet (virtuelle Zeit) bis eine Bedingung erfüllt ist
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// RECORDING COLLABORATORS
// ============================================================================

/// Wiedergabe, die Aufrufe aufzeichnet und eine feste Dauer "spielt"
pub struct RecordingPlayback {
    duration: Duration,
    played: Mutex<Vec<String>>,
    starts: Mutex<Vec<Instant>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    fail_remaining: AtomicUsize,
}

impl RecordingPlayback {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            played: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            fail_remaining: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for RecordingPlayback {
    fn play_url(&self, uri: &str) -> BoxFuture<'static, Result<(), DeviceError>> {
        self.played.lock().push(uri.to_string());
        self.starts.lock().push(Instant::now());

        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Box::pin(async { Err(DeviceError::Failed("sink error".to_string())) });
        }

        let active = Arc::clone(&self.active);
        let max_active = Arc::clone(&self.max_active);
        let duration = self.duration;

        Box::pin(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Clip-Writer im Speicher
#[derive(Default)]
pub struct MemoryClips {
    written: Mutex<Vec<Vec<u8>>>,
    discarded: Mutex<Vec<PathBuf>>,
}

impl MemoryClips {
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.discarded.lock().clone()
    }
}

impl ClipWriter for MemoryClips {
    fn write_clip(&self, wav: &[u8]) -> Result<PathBuf, DeviceError> {
        let mut written = self.written.lock();
        written.push(wav.to_vec());
        Ok(PathBuf::from(format!("/mem/chunk-{}.wav", written.len())))
    }

    fn discard(&self, path: &Path) {
        self.discarded.lock().push(path.to_path_buf());
    }
}

/// Mikrofon, dem der Test Chunks einspeist
#[derive(Default)]
pub struct ScriptedCapture {
    callback: Mutex<Option<ChunkCallback>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
}

impl ScriptedCapture {
    /// Liefert einen Chunk (PCM16LE), als käme er vom Mikrofon
    pub fn emit(&self, pcm: &[u8]) {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(BASE64.encode(pcm));
        }
    }

    pub fn emit_raw(&self, chunk: &str) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(chunk.to_string());
        }
    }

    pub fn is_running(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

impl CaptureDevice for ScriptedCapture {
    fn start(&self, _config: &CaptureConfig, on_chunk: ChunkCallback) -> Result<(), DeviceError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable("no microphone".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock() = Some(on_chunk);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock() = None;
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    screens: Mutex<Vec<Screen>>,
}

impl RecordingNavigator {
    pub fn screens(&self) -> Vec<Screen> {
        self.screens.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, screen: Screen) {
        self.screens.lock().push(screen);
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

pub struct FixedIdentity(pub Option<String>);

impl IdentityProvider for FixedIdentity {
    fn user_id(&self) -> Option<String> {
        self.0.clone()
    }
}

pub struct FixedVisibility(pub AtomicBool);

impl AppVisibility for FixedVisibility {
    fn is_foreground(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Alle aufzeichnenden Schnittstellen, plus die gebündelten `HostServices`
pub struct TestHost {
    pub navigator: Arc<RecordingNavigator>,
    pub notifier: Arc<RecordingNotifier>,
    pub capture: Arc<ScriptedCapture>,
    pub playback: Arc<RecordingPlayback>,
    pub clips: Arc<MemoryClips>,
    pub visibility: Arc<FixedVisibility>,
    pub services: HostServices,
}

impl TestHost {
    pub fn new(user_id: &str, foreground: bool) -> Self {
        let navigator = Arc::new(RecordingNavigator::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let capture = Arc::new(ScriptedCapture::default());
        let playback = Arc::new(RecordingPlayback::new(Duration::from_millis(100)));
        let clips = Arc::new(MemoryClips::default());
        let visibility = Arc::new(FixedVisibility(AtomicBool::new(foreground)));

        let services = HostServices {
            identity: Arc::new(FixedIdentity(Some(user_id.to_string()))),
            visibility: visibility.clone(),
            navigator: navigator.clone(),
            notifier: notifier.clone(),
            capture: capture.clone(),
            playback: playback.clone(),
            clips: clips.clone(),
        };

        Self {
            navigator,
            notifier,
            capture,
            playback,
            clips,
            visibility,
            services,
        }
    }
}
