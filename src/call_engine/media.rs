//! Media Session - die Audio-Verbindung eines Anrufs
//!
//! Öffnet die Media-Verbindung, sendet den `start`-Frame und verbindet
//! eingehendes Audio mit dem `PlaybackScheduler` und das Mikrofon (über den
//! `MicRelay`) mit der Leitung. Pro Anruf genau eine Instanz.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::codec::{AudioFrame, CodecError, WireEncoding};
use super::mic::MicRelay;
use super::playback::PlaybackScheduler;
use crate::config::CaptureConfig;
use crate::host::DeviceError;
use crate::transport::{Connector, Transport, TransportError};

/// Abtastrate auf der Leitung
pub const MEDIA_SAMPLE_RATE: u32 = 8000;

/// Kanäle auf der Leitung
pub const MEDIA_CHANNELS: u16 = 1;

/// Größe der ausgehenden Warteschlange
const OUTBOUND_QUEUE: usize = 64;

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// Format-Metadaten im `start`-Frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: WireEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl MediaFormat {
    pub fn new(encoding: WireEncoding) -> Self {
        Self {
            encoding,
            sample_rate: MEDIA_SAMPLE_RATE,
            channels: MEDIA_CHANNELS,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartInfo<'a> {
    stream_sid: &'a str,
    media_format: MediaFormat,
}

#[derive(Serialize)]
struct StartFrame<'a> {
    event: &'static str,
    start: StartInfo<'a>,
}

#[derive(Serialize)]
struct OutboundPayload {
    payload: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMedia<'a> {
    event: &'static str,
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Deserialize)]
struct InboundPayload {
    payload: String,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    media: Option<InboundPayload>,
}

/// Wartet bis der Status auf "geschlossen" steht (oder der Sender weg ist)
async fn wait_closed(status: &mut watch::Receiver<bool>) {
    let _ = status.wait_for(|open| !*open).await;
}

// ============================================================================
// MEDIA LINK
// ============================================================================

/// Sendeseite einer offenen Media-Verbindung
///
/// Wird vom `MicRelay` gehalten; Senden ist nicht-blockierend und schlägt
/// fehl statt zu warten, sobald die Verbindung zu oder die Queue voll ist.
#[derive(Clone)]
pub struct MediaLink {
    status: Arc<watch::Sender<bool>>,
    tx: mpsc::Sender<String>,
    stream_sid: Arc<str>,
    encoding: WireEncoding,
}

impl MediaLink {
    pub(crate) fn new(
        status: Arc<watch::Sender<bool>>,
        tx: mpsc::Sender<String>,
        stream_sid: Arc<str>,
        encoding: WireEncoding,
    ) -> Self {
        Self {
            status,
            tx,
            stream_sid,
            encoding,
        }
    }

    pub fn is_open(&self) -> bool {
        *self.status.borrow()
    }

    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    /// Sendet einen bereits kodierten Payload als `media`-Frame
    ///
    /// Gibt `false` zurück, wenn der Frame verworfen wurde.
    pub fn send_media(&self, payload: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        let frame = OutboundMedia {
            event: "media",
            stream_sid: &self.stream_sid,
            media: OutboundPayload {
                payload: BASE64.encode(payload),
            },
        };

        match serde_json::to_string(&frame) {
            Ok(text) => self.tx.try_send(text).is_ok(),
            Err(e) => {
                tracing::warn!("Failed to serialize media frame: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for MediaLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLink")
            .field("stream_sid", &self.stream_sid)
            .field("encoding", &self.encoding)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

/// Eine offene Media-Verbindung mit Wiedergabe und optionalem Mikrofon
pub struct MediaSession {
    url: String,
    link: MediaLink,
    playback: PlaybackScheduler,
    mic: Option<MicRelay>,
}

impl MediaSession {
    /// Öffnet die Verbindung und sendet den `start`-Frame
    ///
    /// Eingehende `media`-Frames werden dekodiert und an `playback`
    /// übergeben, bis die Verbindung endet oder `close` aufgerufen wird.
    pub async fn open(
        connector: &dyn Connector,
        url: &str,
        encoding: WireEncoding,
        playback: PlaybackScheduler,
    ) -> Result<Self, TransportError> {
        let Transport { mut sink, stream } = connector.connect(url).await?;

        let stream_sid: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        let start = StartFrame {
            event: "start",
            start: StartInfo {
                stream_sid: &stream_sid,
                media_format: MediaFormat::new(encoding),
            },
        };
        let start = serde_json::to_string(&start)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        // start muss der erste Frame sein, daher vor dem Write-Task
        sink.send(start).await?;
        tracing::info!(
            "Media connection open ({}), stream {}",
            encoding.mime(),
            stream_sid
        );

        let (status_tx, _) = watch::channel(true);
        let status = Arc::new(status_tx);
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        // Write-Task
        let mut writer_status = status.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_closed(&mut writer_status) => break,
                    msg = rx.recv() => match msg {
                        Some(text) => {
                            if let Err(e) = sink.send(text).await {
                                tracing::warn!("Failed to send media frame: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        // Read-Task
        tokio::spawn(Self::read_loop(
            stream,
            encoding,
            playback.clone(),
            Arc::clone(&status),
        ));

        Ok(Self {
            url: url.to_string(),
            link: MediaLink::new(status, tx, stream_sid, encoding),
            playback,
            mic: None,
        })
    }

    /// Startet das Mikrofon und leitet es auf diese Verbindung
    ///
    /// Ein Fehler hier beendet den Anruf nicht; er läuft dann nur in eine
    /// Richtung weiter.
    pub fn attach_mic(&mut self, mic: MicRelay, capture: &CaptureConfig) -> Result<(), DeviceError> {
        if let Some(old) = self.mic.take() {
            old.stop();
        }
        mic.start(capture, self.link.clone())?;
        self.mic = Some(mic);
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stream_sid(&self) -> &str {
        self.link.stream_sid()
    }

    pub fn encoding(&self) -> WireEncoding {
        self.link.encoding()
    }

    pub fn link(&self) -> &MediaLink {
        &self.link
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Future, das endet sobald die Verbindung zu ist (lokal oder remote)
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut status = self.link.status.subscribe();
        async move { wait_closed(&mut status).await }
    }

    /// Schließt die Verbindung
    ///
    /// Mikrofon und Wiedergabe werden sofort gestoppt; ein laufender Clip
    /// darf noch zu Ende spielen. Mehrfacher Aufruf ist harmlos.
    pub fn close(&mut self) {
        if let Some(mic) = self.mic.take() {
            mic.stop();
        }
        self.playback.close();

        if self.link.status.send_replace(false) {
            tracing::info!("Media connection closed");
        }
    }

    async fn read_loop(
        mut stream: crate::transport::FrameStream,
        encoding: WireEncoding,
        playback: PlaybackScheduler,
        status: Arc<watch::Sender<bool>>,
    ) {
        let mut closed = status.subscribe();

        loop {
            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                msg = stream.next() => match msg {
                    Some(Ok(text)) => Self::handle_inbound(&text, encoding, &playback),
                    Some(Err(TransportError::Closed)) | None => {
                        tracing::info!("Media connection closed by remote");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Media connection error: {}", e);
                        break;
                    }
                },
            }
        }

        playback.close();
        status.send_replace(false);
    }

    /// Ein eingehender Frame; Fehler verwerfen nur diesen Frame
    fn handle_inbound(text: &str, encoding: WireEncoding, playback: &PlaybackScheduler) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Unparsable media frame: {}", e);
                return;
            }
        };

        if frame.event.as_deref() != Some("media") {
            tracing::debug!("Ignoring media event {:?}", frame.event);
            return;
        }
        let Some(media) = frame.media else {
            tracing::debug!("Media frame without payload");
            return;
        };

        let bytes = match BASE64.decode(media.payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Dropping media frame: {}", CodecError::InvalidPayload(e.to_string()));
                return;
            }
        };

        match AudioFrame::new(bytes, encoding).into_pcm16() {
            Ok(pcm) => {
                tracing::trace!("Received {} samples", pcm.sample_count());
                playback.enqueue(&pcm.data);
            }
            Err(e) => tracing::warn!("Dropping media frame: {}", e),
        }
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("url", &self.url)
            .field("link", &self.link)
            .field("mic", &self.mic.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::codec;
    use crate::config::PlaybackConfig;
    use crate::testing::{MemoryClips, MockConnector, RecordingPlayback, ScriptedCapture};
    use std::time::Duration;

    fn scheduler() -> (PlaybackScheduler, Arc<MemoryClips>) {
        let clips = Arc::new(MemoryClips::default());
        let scheduler = PlaybackScheduler::new(
            &PlaybackConfig {
                frame_bytes: 1600,
                ..PlaybackConfig::default()
            },
            Arc::new(RecordingPlayback::new(Duration::from_millis(100))),
            clips.clone(),
        );
        (scheduler, clips)
    }

    fn media_frame(payload: &[u8]) -> serde_json::Value {
        serde_json::json!({ "event": "media", "media": { "payload": BASE64.encode(payload) } })
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sends_start_frame_first() {
        let (connector, mut peers) = MockConnector::new();
        let (playback, _) = scheduler();

        let session = MediaSession::open(connector.as_ref(), "wss://x", WireEncoding::MuLaw, playback)
            .await
            .unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, "wss://x");

        let start = peer.drain_json();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0]["event"], "start");
        assert_eq!(start[0]["start"]["streamSid"], session.stream_sid());
        assert_eq!(
            start[0]["start"]["mediaFormat"],
            serde_json::json!({ "encoding": "audio/ulaw", "sampleRate": 8000, "channels": 1 })
        );
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_media_reaches_playback() {
        let (connector, mut peers) = MockConnector::new();
        let (playback, clips) = scheduler();

        let _session =
            MediaSession::open(connector.as_ref(), "wss://x", WireEncoding::MuLaw, playback.clone())
                .await
                .unwrap();
        let peer = peers.recv().await.unwrap();

        let ulaw = vec![0x80u8; 800];
        peer.send_text("garbage");
        peer.send_json(serde_json::json!({ "event": "media", "media": { "payload": "***" } }));
        peer.send_json(serde_json::json!({ "event": "mark" }));
        peer.send_json(media_frame(&ulaw));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let written = clips.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][44..], codec::decode(&ulaw)[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_resolves_closed() {
        let (connector, mut peers) = MockConnector::new();
        let (playback, _) = scheduler();

        let session =
            MediaSession::open(connector.as_ref(), "wss://x", WireEncoding::MuLaw, playback.clone())
                .await
                .unwrap();
        let peer = peers.recv().await.unwrap();
        let closed = session.closed();

        peer.close();
        closed.await;
        assert!(!session.is_open());
        assert!(playback.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_mic_and_playback() {
        let (connector, mut peers) = MockConnector::new();
        let (playback, _) = scheduler();
        let capture = Arc::new(ScriptedCapture::default());

        let mut session =
            MediaSession::open(connector.as_ref(), "wss://x", WireEncoding::MuLaw, playback.clone())
                .await
                .unwrap();
        let mut peer = peers.recv().await.unwrap();
        session
            .attach_mic(MicRelay::new(capture.clone()), &CaptureConfig::default())
            .unwrap();

        capture.emit(&[0, 0, 0x10, 0x00]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frames = peer.drain_json();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["event"], "media");
        assert_eq!(frames[1]["streamSid"], session.stream_sid());

        session.close();
        assert!(!session.is_open());
        assert!(!capture.is_running());
        assert_eq!(capture.stops(), 1);
        assert!(playback.is_closed());

        // Writer schließt die Leitung
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(peer.outbound.try_next(), Ok(None)));

        session.close();
        assert_eq!(capture.stops(), 1);
    }
}
