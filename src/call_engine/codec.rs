//! Audio Codec - G.711 μ-law und WAV-Container
//!
//! Zustandslose Umwandlung zwischen μ-law (8 Bit pro Sample) und linearem
//! PCM16 Little-Endian, sowie der 44-Byte RIFF/WAVE-Header für lokal
//! abgespielte Clips.
//!
//! Die Formeln folgen der ITU-T G.711 Referenz (Bias 0x84, Clip 32635).

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bias, der vor der Quantisierung addiert wird
const ULAW_BIAS: i32 = 0x84;

/// Größter Betrag, der noch ohne Übersteuerung kodiert wird
const ULAW_CLIP: i32 = 32635;

/// Größe des kanonischen WAV-Headers
pub const WAV_HEADER_LEN: usize = 44;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("PCM16 input must have an even length, got {0} bytes")]
    OddLength(usize),

    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(String),
}

// ============================================================================
// FRAME TYPES
// ============================================================================

/// Encoding eines Audio-Payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireEncoding {
    /// G.711 μ-law, 8kHz mono
    #[serde(rename = "audio/ulaw")]
    MuLaw,
    /// Lineares PCM16 Little-Endian
    #[serde(rename = "audio/L16")]
    Pcm16Le,
}

impl WireEncoding {
    /// MIME-Name, wie er im `start`-Frame steht
    pub fn mime(&self) -> &'static str {
        match self {
            WireEncoding::MuLaw => "audio/ulaw",
            WireEncoding::Pcm16Le => "audio/L16",
        }
    }

    /// Bytes pro Sample auf der Leitung
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            WireEncoding::MuLaw => 1,
            WireEncoding::Pcm16Le => 2,
        }
    }
}

/// Eine Einheit Audio-Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub encoding: WireEncoding,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, encoding: WireEncoding) -> Self {
        Self { data, encoding }
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / self.encoding.bytes_per_sample()
    }

    /// Wandelt den Frame nach PCM16LE (für die Wiedergabe)
    pub fn into_pcm16(self) -> Result<AudioFrame, CodecError> {
        match self.encoding {
            WireEncoding::MuLaw => Ok(AudioFrame::new(decode(&self.data), WireEncoding::Pcm16Le)),
            WireEncoding::Pcm16Le if self.data.len() % 2 != 0 => {
                Err(CodecError::OddLength(self.data.len()))
            }
            WireEncoding::Pcm16Le => Ok(self),
        }
    }

    /// Wandelt einen PCM16LE-Frame in das gewünschte Leitungs-Encoding
    pub fn encode_as(self, target: WireEncoding) -> Result<AudioFrame, CodecError> {
        match (self.encoding, target) {
            (WireEncoding::Pcm16Le, WireEncoding::MuLaw) => {
                Ok(AudioFrame::new(encode(&self.data)?, WireEncoding::MuLaw))
            }
            (WireEncoding::MuLaw, WireEncoding::Pcm16Le) => self.into_pcm16(),
            _ => Ok(self),
        }
    }
}

// ============================================================================
// SAMPLE CONVERSION
// ============================================================================

/// Dekodiert ein μ-law Byte zu einem linearen Sample
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Kodiert ein lineares Sample als μ-law Byte
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let sample = sample as i32;
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };

    let magnitude = sample.abs().min(ULAW_CLIP) + ULAW_BIAS;

    // Position des höchsten gesetzten Bits oberhalb von Bit 7
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

// ============================================================================
// BUFFER CONVERSION
// ============================================================================

/// μ-law Bytes → PCM16LE Bytes (Ausgabe ist immer doppelt so lang)
pub fn decode(ulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(ulaw.len() * 2);
    for &byte in ulaw {
        pcm.extend_from_slice(&ulaw_to_linear(byte).to_le_bytes());
    }
    pcm
}

/// PCM16LE Bytes → μ-law Bytes
///
/// Eine ungerade Eingabelänge ist ein Vertragsbruch des Aufrufers und wird
/// abgelehnt statt abgeschnitten.
pub fn encode(pcm: &[u8]) -> Result<Vec<u8>, CodecError> {
    if pcm.len() % 2 != 0 {
        return Err(CodecError::OddLength(pcm.len()));
    }

    Ok(pcm
        .chunks_exact(2)
        .map(|pair| linear_to_ulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

// ============================================================================
// WAV CONTAINER
// ============================================================================

/// Format-Parameter für den WAV-Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for WavSpec {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl WavSpec {
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }
}

/// Verpackt PCM-Samples in einen kanonischen RIFF/WAVE-Container
pub fn wrap_wav(pcm: &[u8], spec: WavSpec) -> Vec<u8> {
    let data_size = pcm.len() as u32;
    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&spec.channels.to_le_bytes());
    wav.extend_from_slice(&spec.sample_rate.to_le_bytes());
    wav.extend_from_slice(&spec.byte_rate().to_le_bytes());
    wav.extend_from_slice(&spec.block_align().to_le_bytes());
    wav.extend_from_slice(&spec.bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

// ============================================================================
// TESTS
// ============================================================================
