//! Playback Scheduler - gepufferte, getaktete Wiedergabe
//!
//! Empfangenes Audio kommt in kleinen Stücken an. Der Scheduler sammelt es
//! im `PlaybackBuffer` und spielt es in festen Frames ab, einen Clip nach
//! dem anderen: die Wiedergabe des Hosts ist fire-and-forget pro Datei, zwei
//! gleichzeitige Clips würden sich gegenseitig abschneiden.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::codec::{wrap_wav, WavSpec};
use crate::config::PlaybackConfig;
use crate::host::{ClipWriter, PlaybackSink};

// ============================================================================
// PLAYBACK BUFFER
// ============================================================================

/// Geordneter Byte-Puffer für PCM16LE-Samples
///
/// Anhängen nur am Ende, Entnehmen nur vorne in ganzen Frames. Läuft der
/// Puffer über, werden die ältesten Bytes verworfen (immer eine gerade
/// Anzahl, damit Samples nicht zerschnitten werden).
#[derive(Debug)]
pub struct PlaybackBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl PlaybackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(1 << 20)),
            capacity,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Anzahl der bisher wegen Überlauf verworfenen Bytes
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Hängt Bytes an; gibt die Anzahl verworfener (ältester) Bytes zurück
    pub fn push(&mut self, data: &[u8]) -> usize {
        self.bytes.extend(data.iter().copied());

        let mut overflow = self.bytes.len().saturating_sub(self.capacity);
        if overflow % 2 != 0 {
            overflow += 1;
        }
        let overflow = overflow.min(self.bytes.len());

        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        overflow
    }

    /// Entnimmt genau einen Frame, falls genug Daten vorhanden sind
    pub fn pop_frame(&mut self, frame_size: usize) -> Option<Vec<u8>> {
        if frame_size == 0 || self.bytes.len() < frame_size {
            return None;
        }
        Some(self.bytes.drain(..frame_size).collect())
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[derive(Debug)]
struct SchedulerState {
    buffer: PlaybackBuffer,
    /// Läuft gerade eine Drain-Schleife?
    busy: bool,
    closed: bool,
    frames_played: u64,
    frames_failed: u64,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    sink: Arc<dyn PlaybackSink>,
    clips: Arc<dyn ClipWriter>,
    frame_size: usize,
    settle: Duration,
    wav_spec: WavSpec,
}

/// Sammelt dekodiertes PCM und spielt es Frame für Frame ab
///
/// Eine Instanz gehört zu genau einer Media-Verbindung.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<SchedulerInner>,
}

impl PlaybackScheduler {
    pub fn new(
        config: &PlaybackConfig,
        sink: Arc<dyn PlaybackSink>,
        clips: Arc<dyn ClipWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    buffer: PlaybackBuffer::new(config.max_buffered_bytes),
                    busy: false,
                    closed: false,
                    frames_played: 0,
                    frames_failed: 0,
                }),
                sink,
                clips,
                frame_size: config.frame_bytes,
                settle: config.settle(),
                wav_spec: WavSpec::default(),
            }),
        }
    }

    /// Hängt PCM16LE an und startet bei Bedarf die Drain-Schleife
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn enqueue(&self, pcm: &[u8]) {
        let start_drain = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }

            let dropped = state.buffer.push(pcm);
            if dropped > 0 {
                tracing::warn!("Playback buffer full, dropped {} oldest bytes", dropped);
            }

            if state.busy || state.buffer.len() < self.inner.frame_size {
                false
            } else {
                state.busy = true;
                true
            }
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                Self::drain(inner).await;
            });
        }
    }

    /// Beendet die Wiedergabe: Buffer leeren, keine neuen Clips mehr
    ///
    /// Ein laufender Clip darf zu Ende spielen.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Bytes, die noch auf einen vollen Frame warten
    pub fn buffered_len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().busy
    }

    /// Frames, die vollständig abgespielt wurden
    pub fn frames_played(&self) -> u64 {
        self.inner.state.lock().frames_played
    }

    /// Frames, die beim Schreiben oder Abspielen gescheitert sind
    pub fn frames_failed(&self) -> u64 {
        self.inner.state.lock().frames_failed
    }

    /// Spielt Frames ab, solange genug Daten da sind
    async fn drain(inner: Arc<SchedulerInner>) {
        loop {
            // busy wird unter demselben Lock zurückgesetzt, unter dem enqueue prüft
            let frame = {
                let mut state = inner.state.lock();
                let frame = if state.closed {
                    None
                } else {
                    state.buffer.pop_frame(inner.frame_size)
                };
                if frame.is_none() {
                    state.busy = false;
                }
                frame
            };

            let Some(frame) = frame else {
                break;
            };

            let played = Self::play_frame(&inner, &frame).await;
            {
                let mut state = inner.state.lock();
                if played {
                    state.frames_played += 1;
                } else {
                    state.frames_failed += 1;
                }
            }

            tokio::time::sleep(inner.settle).await;
        }
    }

    /// Ein Frame: WAV schreiben, abspielen, Datei wieder entfernen
    async fn play_frame(inner: &SchedulerInner, frame: &[u8]) -> bool {
        let wav = wrap_wav(frame, inner.wav_spec);

        let path = match inner.clips.write_clip(&wav) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Skipping playback frame: {}", e);
                return false;
            }
        };

        let uri = format!("file://{}", path.display());
        tracing::debug!("Playing chunk: {}", uri);

        let played = match inner.sink.play_url(&uri).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Playback failed: {}", e);
                false
            }
        };

        inner.clips.discard(&path);
        played
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PlaybackScheduler")
            .field("buffered", &state.buffer.len())
            .field("busy", &state.busy)
            .field("closed", &state.closed)
            .field("frame_size", &self.inner.frame_size)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
