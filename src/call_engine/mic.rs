//! Mic Relay - Mikrofon auf die Media-Verbindung leiten
//!
//! Jeder Chunk des Aufnahmegeräts wird (falls nötig) nach μ-law kodiert und
//! sofort gesendet. Ist die Verbindung nicht offen, wird der Chunk verworfen;
//! gepuffert wird nichts.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::codec::{AudioFrame, WireEncoding};
use super::media::MediaLink;
use crate::config::CaptureConfig;
use crate::host::{CaptureDevice, ChunkCallback, DeviceError};

#[derive(Debug, Default)]
struct RelayStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Leitet Mikrofon-Chunks an eine `MediaLink` weiter
#[derive(Clone)]
pub struct MicRelay {
    device: Arc<dyn CaptureDevice>,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
}

impl MicRelay {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RelayStats::default()),
        }
    }

    /// Startet die Aufnahme und sendet jeden Chunk über `link`
    pub fn start(&self, config: &CaptureConfig, link: MediaLink) -> Result<(), DeviceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Mic relay already running");
            return Ok(());
        }

        let stats = Arc::clone(&self.stats);
        let on_chunk: ChunkCallback = Arc::new(move |chunk: String| {
            Self::relay_chunk(&link, &stats, &chunk);
        });

        if let Err(e) = self.device.start(config, on_chunk) {
            self.running.store(false, Ordering::SeqCst);
            tracing::warn!("Failed to start microphone: {}", e);
            return Err(e);
        }

        tracing::info!(
            "Microphone started ({} Hz, {} channel(s), {} bit)",
            config.sample_rate,
            config.channels,
            config.bits_per_sample
        );
        Ok(())
    }

    /// Stoppt die Aufnahme; ohne vorheriges `start` passiert nichts
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.device.stop();
            tracing::info!(
                "Microphone stopped ({} chunks sent, {} dropped)",
                self.chunks_sent(),
                self.chunks_dropped()
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn chunks_sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    fn relay_chunk(link: &MediaLink, stats: &RelayStats, chunk: &str) {
        if !link.is_open() {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let pcm = match BASE64.decode(chunk.as_bytes()) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!("Dropping capture chunk: {}", e);
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let frame = match AudioFrame::new(pcm, WireEncoding::Pcm16Le).encode_as(link.encoding()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping capture chunk: {}", e);
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if link.send_media(&frame.data) {
            stats.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MicRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicRelay")
            .field("running", &self.is_running())
            .field("sent", &self.chunks_sent())
            .field("dropped", &self.chunks_dropped())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
