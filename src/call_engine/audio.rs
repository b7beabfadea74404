//! Audio Backend - Mikrofon und Lautsprecher über cpal
//!
//! Desktop-Ersatz für Recorder und Player der Mobile-App:
//! - `CpalCapture` liefert 8kHz/16-Bit/Mono-Chunks als Base64
//! - `CpalPlayback` spielt die WAV-Clips des `PlaybackScheduler`
//!
//! cpal-Streams sind nicht Send; jeder Stream lebt daher auf einem eigenen
//! Thread, der ihn bis zum Stopp festhält.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::codec::WAV_HEADER_LEN;
use crate::config::CaptureConfig;
use crate::host::{CaptureDevice, ChunkCallback, DeviceError, PlaybackSink};

/// Sekunden Audio, die der Ausgabepuffer fasst
const PLAYBACK_BUFFER_SECONDS: usize = 4;

// ============================================================================
// CAPTURE
// ============================================================================

struct CaptureHandle {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Mikrofon über das Standard-Eingabegerät
#[derive(Default)]
pub struct CpalCapture {
    running: Mutex<Option<CaptureHandle>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&self, config: &CaptureConfig, on_chunk: ChunkCallback) -> Result<(), DeviceError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let target_rate = config.sample_rate;
        let chunk_bytes = config.buffer_size.max(2);

        let thread = std::thread::spawn(move || {
            let stream = match build_capture_stream(target_rate, chunk_bytes, on_chunk) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Stream lebt bis stop() den Sender fallen lässt
            let _ = stop_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *running = Some(CaptureHandle { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Failed("capture thread exited".to_string())),
        }
    }

    fn stop(&self) {
        if let Some(handle) = self.running.lock().take() {
            drop(handle.stop_tx);
            if handle.thread.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
            tracing::info!("Audio capture stopped");
        }
    }
}

fn build_capture_stream(
    target_rate: u32,
    chunk_bytes: usize,
    on_chunk: ChunkCallback,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceError::Unavailable("no audio input device".to_string()))?;

    let config = find_best_input_config(&device, target_rate)?;
    let source_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels -> {} Hz mono",
        source_rate,
        channels,
        target_rate
    );

    let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes * 2);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                let samples = resample_linear(&mono, source_rate, target_rate);
                pending.extend(samples.iter().flat_map(|s| f32_to_i16(*s).to_le_bytes()));

                while pending.len() >= chunk_bytes {
                    let chunk: Vec<u8> = pending.drain(..chunk_bytes).collect();
                    on_chunk(BASE64.encode(chunk));
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| DeviceError::Failed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::Failed(e.to_string()))?;

    Ok(stream)
}

// ============================================================================
// PLAYBACK
// ============================================================================

struct OutputHandle {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    sample_rate: u32,
    _stop_tx: std_mpsc::Sender<()>,
}

/// Lautsprecher über das Standard-Ausgabegerät
///
/// Der Ausgabestream wird beim ersten Clip geöffnet und bleibt offen.
#[derive(Default)]
pub struct CpalPlayback {
    output: Mutex<Option<OutputHandle>>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_output(&self) -> Result<(Arc<Mutex<HeapRb<f32>>>, u32), DeviceError> {
        let mut output = self.output.lock();
        if let Some(handle) = output.as_ref() {
            return Ok((Arc::clone(&handle.buffer), handle.sample_rate));
        }

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::spawn(move || {
            let (stream, buffer, rate) = match build_output_stream() {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok((buffer, rate)));
            let _ = stop_rx.recv();
            drop(stream);
        });

        let (buffer, sample_rate) = ready_rx
            .recv()
            .map_err(|_| DeviceError::Failed("playback thread exited".to_string()))??;

        *output = Some(OutputHandle {
            buffer: Arc::clone(&buffer),
            sample_rate,
            _stop_tx: stop_tx,
        });
        Ok((buffer, sample_rate))
    }

    /// Liest den Clip und schiebt ihn in den Ausgabepuffer
    fn enqueue_clip(&self, uri: &str) -> Result<Duration, DeviceError> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let wav = std::fs::read(path).map_err(|e| DeviceError::Failed(e.to_string()))?;
        let clip = parse_wav(&wav)?;

        let (buffer, device_rate) = self.ensure_output()?;
        let samples = resample_linear(&clip.samples, clip.sample_rate, device_rate);

        let mut buffer = buffer.lock();
        let mut overflow = 0usize;
        for sample in samples {
            if buffer.try_push(sample).is_err() {
                overflow += 1;
            }
        }
        if overflow > 0 {
            tracing::warn!("Playback buffer full, {} samples dropped", overflow);
        }

        Ok(clip.duration())
    }
}

impl PlaybackSink for CpalPlayback {
    fn play_url(&self, uri: &str) -> BoxFuture<'static, Result<(), DeviceError>> {
        let queued = self.enqueue_clip(uri);
        Box::pin(async move {
            let duration = queued?;
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }
}

fn build_output_stream() -> Result<(cpal::Stream, Arc<Mutex<HeapRb<f32>>>, u32), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::Unavailable("no audio output device".to_string()))?;

    let config = find_best_output_config(&device)?;
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channels",
        sample_rate,
        channels
    );

    let buffer = Arc::new(Mutex::new(HeapRb::new(
        sample_rate as usize * PLAYBACK_BUFFER_SECONDS,
    )));
    let playback_buffer = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buffer = playback_buffer.lock();
                // Mono auf alle Kanäle verteilen
                for frame in data.chunks_mut(channels.max(1)) {
                    let sample = buffer.try_pop().unwrap_or(0.0);
                    for s in frame.iter_mut() {
                        *s = sample;
                    }
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| DeviceError::Failed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::Failed(e.to_string()))?;

    Ok((stream, buffer, sample_rate))
}

// ============================================================================
// SAMPLE HELPERS
// ============================================================================

/// Dekodierter WAV-Clip, auf Mono gemischt
#[derive(Debug, Clone, PartialEq)]
struct Clip {
    sample_rate: u32,
    samples: Vec<f32>,
}

impl Clip {
    fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Liest einen kanonischen 16-Bit-PCM WAV-Clip
fn parse_wav(wav: &[u8]) -> Result<Clip, DeviceError> {
    if wav.len() < WAV_HEADER_LEN || &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err(DeviceError::Failed("not a WAV clip".to_string()));
    }

    let channels = u16::from_le_bytes([wav[22], wav[23]]).max(1) as usize;
    let sample_rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
    let bits = u16::from_le_bytes([wav[34], wav[35]]);
    if bits != 16 {
        return Err(DeviceError::Failed(format!("unsupported bit depth {}", bits)));
    }

    let interleaved: Vec<f32> = wav[WAV_HEADER_LEN..]
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    Ok(Clip {
        sample_rate,
        samples: downmix(&interleaved, channels),
    })
}

/// Mischt interleaved Samples auf Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return data.to_vec();
    }

    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// ============================================================================
// DEVICE CONFIGURATION
// ============================================================================

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device, target_rate: u32) -> Result<StreamConfig, DeviceError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    select_best_config(configs.collect(), target_rate)
}

/// Findet die beste Output-Konfiguration
fn find_best_output_config(device: &Device) -> Result<StreamConfig, DeviceError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    // Ausgabe in der nativen Rate, resampled wird beim Einreihen
    select_best_config(configs.collect(), 48_000)
}

/// Wählt die beste F32-Konfiguration, bevorzugt mit der Zielrate
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<StreamConfig, DeviceError> {
    let target = cpal::SampleRate(target_rate);

    let f32_configs = configs
        .iter()
        .filter(|config| config.sample_format() == SampleFormat::F32);

    for config in f32_configs.clone() {
        if config.min_sample_rate() <= target && config.max_sample_rate() >= target {
            return Ok(config.clone().with_sample_rate(target).into());
        }
    }

    // Sonst die höchste Rate; runter wird per Resampling gerechnet
    if let Some(config) = f32_configs.max_by_key(|config| config.max_sample_rate().0) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(DeviceError::Unavailable(
        "No F32 audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
