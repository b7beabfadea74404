//! Call Engine Module - Anrufsteuerung und Audio
//!
//! Dieses Modul verwaltet:
//! - G.711 μ-law Codec und WAV-Clips
//! - Gepufferte, getaktete Wiedergabe
//! - Mikrofon-Weiterleitung auf die Media-Verbindung
//! - Die Zustandsmaschine eines Anrufs

#[cfg(feature = "cpal-audio")]
mod audio;
mod codec;
mod media;
mod mic;
mod playback;
mod session;

#[cfg(feature = "cpal-audio")]
pub use audio::{CpalCapture, CpalPlayback};
pub use codec::{
    decode, encode, linear_to_ulaw, ulaw_to_linear, wrap_wav, AudioFrame, CodecError, WavSpec,
    WireEncoding, WAV_HEADER_LEN,
};
pub use media::{MediaFormat, MediaLink, MediaSession, MEDIA_CHANNELS, MEDIA_SAMPLE_RATE};
pub use mic::MicRelay;
pub use playback::{PlaybackBuffer, PlaybackScheduler};
pub use session::{
    CallDirection, CallError, CallEvent, CallSessionController, CallSnapshot, CallState,
};
