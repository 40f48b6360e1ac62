//! Local and remote audio media handles
//!
//! A [`MediaStream`] groups [`MediaTrack`]s. Tracks are cheap handles over
//! shared state: cloning one does not duplicate the underlying capture or
//! receive pipeline. Each stream is owned by exactly one transport session.

pub mod devices;
pub mod level;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub use devices::{DeviceMode, MediaDevices, SyntheticMediaDevices};

/// Encoded samples buffered per track before slow readers start lagging
const SAMPLE_BUFFER: usize = 64;

/// One encoded audio frame ready for RTP packetization
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Opus payload
    pub data: Bytes,
    pub duration: Duration,
    /// Frame level in -dBov (0 loudest, 127 silence)
    pub audio_level: u8,
}

struct TrackInner {
    id: String,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    /// Most recent PCM frame, read by the speaking analyser
    latest_frame: Mutex<Option<Vec<f32>>>,
    samples: broadcast::Sender<MediaSample>,
}

/// Handle to a single audio track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                latest_frame: Mutex::new(None),
                samples,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Disabled tracks keep running but carry silence
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the track permanently
    ///
    /// Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        let transitioned = !self.inner.stopped.swap(true, Ordering::AcqRel);
        if transitioned {
            *self.inner.latest_frame.lock() = None;
        }
        transitioned
    }

    /// Deliver a captured frame: PCM for analysis plus its encoded payload
    pub fn push_frame(&self, pcm: &[f32], encoded: Bytes, duration: Duration) {
        if self.is_stopped() {
            return;
        }
        let audio_level = level::rms_to_dbov(level::rms(pcm));
        *self.inner.latest_frame.lock() = Some(pcm.to_vec());
        self.push_sample(MediaSample {
            data: encoded,
            duration,
            audio_level,
        });
    }

    /// Deliver an already-encoded frame (remote tracks)
    pub fn push_sample(&self, sample: MediaSample) {
        if self.is_stopped() {
            return;
        }
        // No receivers is normal before the track is attached
        let _ = self.inner.samples.send(sample);
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// RMS of the latest captured frame
    ///
    /// `None` before the first frame or after the track stopped; `0.0`
    /// while the track is disabled.
    pub fn analysis_rms(&self) -> Option<f64> {
        if self.is_stopped() {
            return None;
        }
        let frame = self.inner.latest_frame.lock();
        let frame = frame.as_ref()?;
        if !self.is_enabled() {
            return Some(0.0);
        }
        Some(level::rms(frame))
    }

    /// True when both handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Ordered set of tracks with a shared identity
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track unless the same track is already present
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.same_track(&track)) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    pub fn first_track(&self) -> Option<MediaTrack> {
        self.tracks.read().first().cloned()
    }

    /// Stop every track, returning how many were still live
    pub fn stop_all(&self) -> usize {
        self.tracks.read().iter().filter(|t| t.stop()).count()
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in self.tracks.read().iter() {
            track.set_enabled(enabled);
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.read().iter().all(MediaTrack::is_stopped)
    }

    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let track = MediaTrack::new("t1", "mic");
        assert!(!track.is_stopped());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[test]
    fn test_stream_stop_all_counts_live_tracks() {
        let stream = MediaStream::new();
        let a = MediaTrack::new("a", "mic");
        let b = MediaTrack::new("b", "mic");
        stream.add_track(a.clone());
        stream.add_track(b.clone());
        stream.add_track(a.clone());
        assert_eq!(stream.tracks().len(), 2);

        b.stop();
        assert_eq!(stream.stop_all(), 1);
        assert_eq!(stream.stop_all(), 0);
        assert!(stream.all_stopped());
    }

    #[test]
    fn test_analysis_rms() {
        let track = MediaTrack::new("t1", "mic");
        assert_eq!(track.analysis_rms(), None);

        track.push_frame(&[0.5; 480], Bytes::from_static(&[0xF8]), Duration::from_millis(10));
        let rms = track.analysis_rms().unwrap();
        assert!((rms - 0.5).abs() < 1e-6);

        track.set_enabled(false);
        assert_eq!(track.analysis_rms(), Some(0.0));

        track.stop();
        assert_eq!(track.analysis_rms(), None);
    }

    #[tokio::test]
    async fn test_samples_fan_out() {
        let track = MediaTrack::new("t1", "mic");
        let mut rx = track.subscribe_samples();

        track.push_frame(&[0.0; 480], Bytes::from_static(&[0xF8, 0xFF, 0xFE]), Duration::from_millis(10));
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.audio_level, 127);
        assert_eq!(sample.data.len(), 3);

        track.stop();
        track.push_frame(&[0.5; 480], Bytes::new(), Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let stream = MediaStream::new();
        let copy = stream.clone();
        copy.add_track(MediaTrack::new("t1", "mic"));
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.same_stream(&copy));
        assert!(!stream.same_stream(&MediaStream::new()));

        stream.set_enabled(false);
        assert!(!copy.tracks()[0].is_enabled());
    }
}
