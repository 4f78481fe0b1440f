//! Local and remote media model.
//!
//! Tracks are cheap handles around shared state so the capture controller, the
//! peer connection and the recorder can all refer to the same device track.
//! Stopping a track is idempotent and runs the device release hook exactly once.
//! Capture devices push encoded frames into a track with [`MediaTrack::push_sample`];
//! every sender the track is attached to receives them.

pub mod capture;

pub use capture::{LocalMediaState, MediaCaptureController};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::DeviceError;
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's media originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    Remote,
}

/// Frames buffered per subscriber before the slowest one starts skipping.
const SAMPLE_BACKLOG: usize = 64;

/// One encoded frame (an Opus packet or a VP8 frame) and how long it plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
    samples: broadcast::Sender<MediaSample>,
    on_stop: Mutex<Option<StopHook>>,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        Self::with_id(random_id(), kind, source, label)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
    ) -> Self {
        let (live, _) = watch::channel(true);
        let (samples, _) = broadcast::channel(SAMPLE_BACKLOG);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live,
                samples,
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Track received from the remote peer.
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_id(id, kind, TrackSource::Remote, "remote")
    }

    /// Registers the device release hook run when the track is stopped.
    pub fn on_stop<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.on_stop.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes the track without touching the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Ends the track and releases the device. Returns false if it had already ended.
    pub fn stop(&self) -> bool {
        let was_live = self.inner.live.send_replace(false);
        if was_live {
            if let Some(hook) = self.inner.on_stop.lock().take() {
                hook();
            }
        }
        was_live
    }

    /// Hands a captured frame to every attached sender. Frames pushed after
    /// the track ended are discarded. Returns how many senders received it.
    pub fn push_sample(&self, sample: MediaSample) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.inner.samples.send(sample).unwrap_or(0)
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// Resolves once the track has ended, whoever ended it.
    pub async fn ended(&self) {
        let mut rx = self.inner.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: random_id(),
            tracks,
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video_tracks().next()
    }

    pub fn has_video(&self) -> bool {
        self.video_track().is_some()
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Stops every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: MediaConstraints = MediaConstraints {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: MediaConstraints = MediaConstraints {
        audio: true,
        video: false,
    };
}

/// Platform capture devices (camera, microphone, display).
///
/// Implementations keep encoding while a track is live and feed each frame
/// through [`MediaTrack::push_sample`].
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, DeviceError>;
    async fn display_media(&self) -> Result<MediaStream, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_runs_release_hook_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam").on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.is_live());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enablement_is_shared_between_clones() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&clone));
    }

    #[test]
    fn stream_counts_live_tracks() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"),
            MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam"),
        ]);
        assert!(stream.has_video());
        assert_eq!(stream.live_track_count(), 2);
        assert_eq!(stream.stop_all(), 2);
        assert_eq!(stream.live_track_count(), 0);
        assert_eq!(stream.stop_all(), 0);
    }

    #[tokio::test]
    async fn samples_reach_every_subscriber_until_stop() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let frame = MediaSample::new(vec![0xf8u8, 0xff, 0xfe], Duration::from_millis(20));
        assert_eq!(track.push_sample(frame.clone()), 0);

        let mut first = track.subscribe_samples();
        let mut second = track.clone().subscribe_samples();
        assert_eq!(track.push_sample(frame.clone()), 2);
        assert_eq!(first.recv().await.expect("sample"), frame);
        assert_eq!(second.recv().await.expect("sample"), frame);

        track.stop();
        assert_eq!(track.push_sample(frame), 0);
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        waiter.await.expect("join");
    }
}
