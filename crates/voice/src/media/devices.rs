//! Audio capture devices

use super::{MediaStream, MediaTrack};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// 20 ms at 48 kHz mono
const FRAME_SAMPLES: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const SAMPLE_RATE: f32 = 48_000.0;

/// Opus DTX silence frame
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Source of local capture streams
///
/// Every call returns a fresh stream; streams are never shared between
/// transport sessions. Acquisition may be gated on user interaction and
/// can resolve arbitrarily late.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_audio_stream(&self) -> Result<MediaStream>;
}

/// What a synthetic device produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceMode {
    /// A live track that never delivers frames
    Silent,
    /// A sine tone captured in 20 ms frames
    Tone { frequency_hz: f32, amplitude: f32 },
    /// Permission denied on every acquisition
    Denied,
}

/// In-process capture device for demos and tests
pub struct SyntheticMediaDevices {
    mode: Mutex<DeviceMode>,
    deny_next: AtomicUsize,
    acquired: Mutex<Vec<MediaStream>>,
}

impl SyntheticMediaDevices {
    pub fn new(mode: DeviceMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            deny_next: AtomicUsize::new(0),
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self::new(DeviceMode::Silent)
    }

    pub fn tone(frequency_hz: f32, amplitude: f32) -> Self {
        Self::new(DeviceMode::Tone {
            frequency_hz,
            amplitude,
        })
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        *self.mode.lock() = mode;
    }

    /// Deny the next `times` acquisitions regardless of mode
    pub fn deny_next(&self, times: usize) {
        self.deny_next.store(times, Ordering::SeqCst);
    }

    /// Streams handed out, minus those already stopped when a later one
    /// was acquired
    pub fn acquired_streams(&self) -> Vec<MediaStream> {
        self.acquired.lock().clone()
    }

    fn take_denial(&self) -> bool {
        self.deny_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn acquire_audio_stream(&self) -> Result<MediaStream> {
        let mode = *self.mode.lock();
        if mode == DeviceMode::Denied || self.take_denial() {
            return Err(Error::MediaAcquisition(
                "microphone permission denied".to_string(),
            ));
        }

        let stream = MediaStream::new();
        let track = MediaTrack::new(uuid::Uuid::new_v4().to_string(), "synthetic microphone");
        stream.add_track(track.clone());

        if let DeviceMode::Tone {
            frequency_hz,
            amplitude,
        } = mode
        {
            tokio::spawn(run_tone(track, frequency_hz, amplitude));
        }

        debug!("Acquired synthetic audio stream {}", stream.id());
        let mut acquired = self.acquired.lock();
        acquired.retain(|earlier| !earlier.all_stopped());
        acquired.push(stream.clone());
        Ok(stream)
    }
}

async fn run_tone(track: MediaTrack, frequency_hz: f32, amplitude: f32) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let step = 2.0 * std::f32::consts::PI * frequency_hz / SAMPLE_RATE;
    let mut phase = 0.0f32;
    let mut frame = vec![0.0f32; FRAME_SAMPLES];

    loop {
        ticker.tick().await;
        if track.is_stopped() {
            break;
        }
        for sample in frame.iter_mut() {
            *sample = amplitude * phase.sin();
            phase = (phase + step) % (2.0 * std::f32::consts::PI);
        }
        track.push_frame(&frame, Bytes::from_static(&OPUS_SILENCE), FRAME_DURATION);
    }

    debug!("Synthetic capture for track {} ended", track.id());
}
