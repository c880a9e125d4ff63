//! Microphone capture with an explicit acquire-once lifecycle
//!
//! A [`Microphone`] owns at most one live [`AudioStream`]. `ensure_stream`
//! is the only operation that may prompt for hardware access; every
//! recognition attempt afterwards goes through `get_stream`, a pure lookup.
//! Consumers read audio through an [`AudioTap`], and only one tap may be
//! attached to a stream at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::pcm::SAMPLE_RATE;
use crate::SpeechError;

/// Frames buffered between the capture callback and the session
const TAP_CAPACITY: usize = 64;

/// One block of mono samples as delivered by the hardware
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Mono samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Rate the samples were captured at
    pub sample_rate: u32,
}

/// Ready state of one hardware track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Delivering audio
    Live,
    /// Stopped or lost
    Ended,
}

/// What to ask the hardware for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Required channel count, if any
    pub channels: Option<u16>,
    /// Required sample rate, if any
    pub sample_rate: Option<u32>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono at the protocol rate with voice processing on
    #[must_use]
    pub const fn speech() -> Self {
        Self {
            channels: Some(1),
            sample_rate: Some(SAMPLE_RATE),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// Any audio input at all
    #[must_use]
    pub const fn relaxed() -> Self {
        Self {
            channels: None,
            sample_rate: None,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }
}

/// A live handle to one or more hardware audio tracks
pub trait AudioStream: Send + Sync {
    /// Whether the stream as a whole is running
    fn is_active(&self) -> bool;

    /// Ready state of each constituent track
    fn track_states(&self) -> Vec<TrackState>;

    /// Attach the single consumer of this stream's audio
    ///
    /// # Errors
    ///
    /// Returns `MicrophoneUnavailable` if another tap is already attached
    fn tap(&self) -> Result<AudioTap, SpeechError>;

    /// Stop every track; the stream is unusable afterwards
    fn stop(&self);
}

/// Platform capability to open capture streams
pub trait AudioSource: Send + Sync {
    /// Request a stream satisfying `constraints`; this may prompt the user
    ///
    /// # Errors
    ///
    /// Returns a microphone error describing why the request failed
    fn request(&self, constraints: &CaptureConstraints)
    -> Result<Arc<dyn AudioStream>, SpeechError>;
}

/// A stream is usable only if it is active and every one of its
/// (at least one) tracks is live
#[must_use]
pub fn is_usable(stream: &dyn AudioStream) -> bool {
    if !stream.is_active() {
        return false;
    }
    let tracks = stream.track_states();
    !tracks.is_empty() && tracks.iter().all(|t| *t == TrackState::Live)
}

/// Shared slot a capture callback publishes frames into
///
/// Frames published while nothing is attached are dropped.
#[derive(Debug, Clone, Default)]
pub struct TapSlot {
    current: Arc<Mutex<Option<(u64, mpsc::Sender<AudioFrame>)>>>,
    next_id: Arc<AtomicU64>,
}

impl TapSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new consumer
    ///
    /// # Errors
    ///
    /// Returns `MicrophoneUnavailable` if a consumer is already attached
    pub fn attach(&self) -> Result<AudioTap, SpeechError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|(_, tx)| !tx.is_closed()) {
            return Err(SpeechError::MicrophoneUnavailable(
                "stream is already in use by another session".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        *current = Some((id, tx));

        Ok(AudioTap {
            id,
            rx,
            slot: self.clone(),
        })
    }

    /// Deliver a frame to the attached consumer, if any
    ///
    /// Never blocks. Returns false if the frame was dropped.
    pub fn publish(&self, frame: AudioFrame) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current
            .as_ref()
            .is_some_and(|(_, tx)| tx.try_send(frame).is_ok())
    }

    /// Whether a consumer is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
    }

    /// Drop the attached consumer's sender so its `recv` returns `None`
    pub fn close(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn detach(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|(owner, _)| *owner == id) {
            *current = None;
        }
    }
}

/// Exclusive consumer of a stream's audio; detaches when dropped
#[derive(Debug)]
pub struct AudioTap {
    id: u64,
    rx: mpsc::Receiver<AudioFrame>,
    slot: TapSlot,
}

impl AudioTap {
    /// Next captured frame, or `None` once the stream has gone away
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }
}

impl Drop for AudioTap {
    fn drop(&mut self) {
        self.rx.close();
        self.slot.detach(self.id);
    }
}

/// Process-wide microphone handle: acquire once, share, release once
pub struct Microphone {
    source: Box<dyn AudioSource>,
    stream: Mutex<Option<Arc<dyn AudioStream>>>,
}

impl Microphone {
    /// Create a handle over the given capture capability
    #[must_use]
    pub fn new(source: impl AudioSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            stream: Mutex::new(None),
        }
    }

    /// Handle backed by the default cpal host
    #[must_use]
    pub fn system() -> Self {
        Self::new(CpalSource)
    }

    /// Return the live stream, acquiring one if needed
    ///
    /// A usable stream is returned unchanged. Otherwise the hardware is asked
    /// for [`CaptureConstraints::speech`], retrying once with
    /// [`CaptureConstraints::relaxed`] if the constraints can't be met.
    ///
    /// # Errors
    ///
    /// Returns `MicrophoneUnavailable`, `MicrophoneConstraintError`, or
    /// `MicrophoneUnsupported`
    pub fn ensure_stream(&self) -> Result<Arc<dyn AudioStream>, SpeechError> {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(stream) = slot.as_ref() {
            if is_usable(&**stream) {
                return Ok(Arc::clone(stream));
            }
            tracing::debug!("existing capture stream is dead, reacquiring");
            stream.stop();
            *slot = None;
        }

        let stream = match self.source.request(&CaptureConstraints::speech()) {
            Err(SpeechError::MicrophoneConstraintError(reason)) => {
                tracing::warn!(
                    reason = %reason,
                    "speech constraints unsatisfied, retrying relaxed"
                );
                self.source.request(&CaptureConstraints::relaxed())?
            }
            other => other?,
        };

        tracing::info!("microphone stream acquired");
        *slot = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// Look up the live stream without touching the hardware
    ///
    /// # Errors
    ///
    /// Returns `MicrophoneNotInitialized` if no usable stream exists
    pub fn get_stream(&self) -> Result<Arc<dyn AudioStream>, SpeechError> {
        match self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(stream) if is_usable(&**stream) => Ok(Arc::clone(stream)),
            _ => Err(SpeechError::MicrophoneNotInitialized),
        }
    }

    /// Stop all tracks and clear the shared handle
    pub fn release_stream(&self) {
        if let Some(stream) = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            stream.stop();
            tracing::info!("microphone stream released");
        }
    }
}

/// Capture from the default cpal input device
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSource;

impl AudioSource for CpalSource {
    fn request(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn AudioStream>, SpeechError> {
        CpalStream::open(*constraints).map(|s| Arc::new(s) as Arc<dyn AudioStream>)
    }
}

/// A cpal input stream parked on its own thread
///
/// The cpal `Stream` isn't `Send`, so it lives on a dedicated thread until
/// the stop channel is dropped.
pub struct CpalStream {
    slot: TapSlot,
    active: Arc<AtomicBool>,
    track_live: Arc<AtomicBool>,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl CpalStream {
    fn open(constraints: CaptureConstraints) -> Result<Self, SpeechError> {
        let slot = TapSlot::new();
        let track_live = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread_slot = slot.clone();
        let thread_live = Arc::clone(&track_live);
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&constraints, thread_slot, thread_live) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(SpeechError::MicrophoneUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stop() drops the sender
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| SpeechError::MicrophoneUnavailable(format!("capture thread: {e}")))?;

        ready_rx.recv().map_err(|_| {
            SpeechError::MicrophoneUnavailable("capture thread exited early".to_string())
        })??;

        Ok(Self {
            slot,
            active: Arc::new(AtomicBool::new(true)),
            track_live,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }
}

impl AudioStream for CpalStream {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn track_states(&self) -> Vec<TrackState> {
        let state = if self.track_live.load(Ordering::SeqCst) {
            TrackState::Live
        } else {
            TrackState::Ended
        };
        vec![state]
    }

    fn tap(&self) -> Result<AudioTap, SpeechError> {
        self.slot.attach()
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.track_live.store(false, Ordering::SeqCst);
        self.slot.close();
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick a device config and build the input stream
fn build_input_stream(
    constraints: &CaptureConstraints,
    slot: TapSlot,
    track_live: Arc<AtomicBool>,
) -> Result<cpal::Stream, SpeechError> {
    let host = cpal::default_host();

    let mut devices = host
        .input_devices()
        .map_err(|e| SpeechError::MicrophoneUnsupported(e.to_string()))?;
    if devices.next().is_none() {
        return Err(SpeechError::MicrophoneUnsupported(format!(
            "{} host has no input devices",
            host.id().name()
        )));
    }

    let device = host
        .default_input_device()
        .ok_or_else(|| SpeechError::MicrophoneUnavailable("no default input device".to_string()))?;

    let supported = select_config(&device, constraints)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    if constraints.echo_cancellation
        || constraints.noise_suppression
        || constraints.auto_gain_control
    {
        tracing::debug!("voice processing is left to the platform input chain");
    }

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "audio capture initialized"
    );

    let channels = usize::from(config.channels.max(1));
    let rate = config.sample_rate.0;
    let err_live = Arc::clone(&track_live);
    let on_error = move |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            err_live.store(false, Ordering::SeqCst);
        }
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                slot.publish(AudioFrame {
                    samples: downmix(data, channels),
                    sample_rate: rate,
                });
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                slot.publish(AudioFrame {
                    samples: downmix(&floats, channels),
                    sample_rate: rate,
                });
            },
            on_error,
            None,
        ),
        other => {
            return Err(SpeechError::MicrophoneConstraintError(format!(
                "unsupported sample format {other:?}"
            )));
        }
    };

    stream.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            SpeechError::MicrophoneUnavailable(e.to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => {
            SpeechError::MicrophoneConstraintError(e.to_string())
        }
        other => SpeechError::MicrophoneUnavailable(other.to_string()),
    })
}

/// Find a supported config honouring the channel and rate constraints
fn select_config(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
) -> Result<cpal::SupportedStreamConfig, SpeechError> {
    if constraints.channels.is_none() && constraints.sample_rate.is_none() {
        return device
            .default_input_config()
            .map_err(|e| SpeechError::MicrophoneConstraintError(e.to_string()));
    }

    let configs = device
        .supported_input_configs()
        .map_err(|e| SpeechError::MicrophoneUnavailable(e.to_string()))?;

    configs
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .find(|c| {
            constraints.channels.is_none_or(|ch| c.channels() == ch)
                && constraints.sample_rate.is_none_or(|rate| {
                    c.min_sample_rate() <= SampleRate(rate)
                        && c.max_sample_rate() >= SampleRate(rate)
                })
        })
        .map(|c| match constraints.sample_rate {
            Some(rate) => c.with_sample_rate(SampleRate(rate)),
            None => c.with_max_sample_rate(),
        })
        .ok_or_else(|| {
            SpeechError::MicrophoneConstraintError(
                "no input config satisfies constraints".to_string(),
            )
        })
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
