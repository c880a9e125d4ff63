//! PCM framing: resampling, 16-bit encoding, and chunking for the wire

use crate::Result;

/// Sample rate the ASR protocol requires (16kHz mono)
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per encoded sample (16-bit little-endian)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Resample a frame to [`SAMPLE_RATE`] with linear interpolation
///
/// The output holds `floor(len * 16000 / from_rate)` samples. Each output
/// sample interpolates between the two nearest input samples.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample(frame: &[f32], from_rate: u32) -> Vec<f32> {
    if from_rate == 0 || frame.is_empty() {
        return Vec::new();
    }
    if from_rate == SAMPLE_RATE {
        return frame.to_vec();
    }

    let out_len = (frame.len() as u64 * u64::from(SAMPLE_RATE) / u64::from(from_rate)) as usize;
    let ratio = f64::from(from_rate) / f64::from(SAMPLE_RATE);
    let last = frame.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let fraction = (position - index as f64) as f32;
            let current = frame[index];
            let next = frame[(index + 1).min(last)];
            (next - current).mul_add(fraction, current)
        })
        .collect()
}

/// Encode samples in `[-1, 1]` as little-endian signed 16-bit PCM
///
/// Samples are clipped first. Negative values scale by 32768 and the rest by
/// 32767 so full scale maps onto the whole `i16` range without overflow.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let clipped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if clipped < 0.0 {
            clipped * 32768.0
        } else {
            clipped * 32767.0
        };
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// Decode little-endian PCM16 back to floats, inverting [`encode_pcm16`]
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| {
            let value = f32::from(i16::from_le_bytes([pair[0], pair[1]]));
            if value < 0.0 {
                value / 32768.0
            } else {
                value / 32767.0
            }
        })
        .collect()
}

/// Collects encoded PCM and hands it out in fixed-size wire chunks
#[derive(Debug)]
pub struct PcmChunker {
    chunk_bytes: usize,
    pending: Vec<u8>,
}

impl PcmChunker {
    /// Chunker emitting `chunk` worth of 16kHz audio per frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(chunk: std::time::Duration) -> Self {
        let samples = (u128::from(SAMPLE_RATE) * chunk.as_millis() / 1000) as usize;
        let chunk_bytes = samples.max(1) * BYTES_PER_SAMPLE;
        Self {
            chunk_bytes,
            pending: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    /// Size of one full chunk in bytes
    #[must_use]
    pub const fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Append encoded bytes and return every full chunk now available
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_bytes {
            let rest = self.pending.split_off(self.chunk_bytes);
            chunks.push(std::mem::replace(&mut self.pending, rest));
        }
        chunks
    }

    /// Take whatever is buffered, if anything
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for pair in encode_pcm16(samples).chunks_exact(BYTES_PER_SAMPLE) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}
