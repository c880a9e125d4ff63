//! Voice processing module
//!
//! Handles microphone capture, PCM framing for the wire, and matching
//! transcripts against an expected utterance.

mod capture;
pub mod matcher;
pub mod pcm;

pub use capture::{
    AudioFrame, AudioSource, AudioStream, AudioTap, CaptureConstraints, CpalSource, CpalStream,
    Microphone, TapSlot, TrackState, is_usable,
};
pub use matcher::{contains_expected, matches, normalize};
pub use pcm::{PcmChunker, SAMPLE_RATE, decode_pcm16, encode_pcm16, resample, samples_to_wav};
