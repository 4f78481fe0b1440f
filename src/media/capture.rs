use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{MediaConstraints, MediaDevices, MediaStream, MediaTrack};
use crate::error::{DeviceError, MediaError};

/// Local capture owned by one call.
#[derive(Debug, Default)]
pub struct LocalMediaState {
    pub camera: Option<MediaStream>,
    pub screen: Option<MediaStream>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl LocalMediaState {
    pub fn live_track_count(&self) -> usize {
        self.camera.as_ref().map_or(0, MediaStream::live_track_count)
            + self.screen.as_ref().map_or(0, MediaStream::live_track_count)
    }
}

/// Acquires and releases the local camera, microphone and display capture.
///
/// Every stream handed out stays owned here until [`release`](Self::release);
/// dropping the controller releases as well, so devices are never left locked.
pub struct MediaCaptureController {
    devices: Arc<dyn MediaDevices>,
    state: LocalMediaState,
}

impl MediaCaptureController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: LocalMediaState::default(),
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn camera_stream(&self) -> Option<&MediaStream> {
        self.state.camera.as_ref()
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.state.screen.as_ref()
    }

    /// Camera and microphone, falling back to microphone only.
    pub async fn acquire(&mut self) -> Result<&MediaStream, MediaError> {
        if self.state.camera.is_some() {
            warn!("local media already acquired, reusing existing stream");
        } else {
            let stream = match self.devices.user_media(MediaConstraints::AUDIO_VIDEO).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "camera+mic unavailable, retrying audio only");
                    self.devices
                        .user_media(MediaConstraints::AUDIO_ONLY)
                        .await
                        .map_err(|fallback| {
                            warn!(error = %fallback, "audio-only capture failed");
                            match fallback {
                                DeviceError::PermissionDenied => MediaError::PermissionDenied,
                                _ => MediaError::NoMediaDevice,
                            }
                        })?
                }
            };
            if stream.tracks().is_empty() {
                return Err(MediaError::NoMediaDevice);
            }
            info!(
                audio = stream.audio_tracks().count(),
                video = stream.video_tracks().count(),
                "local media acquired"
            );
            self.state.audio_enabled = stream.audio_tracks().any(MediaTrack::is_enabled);
            self.state.video_enabled = stream.video_tracks().any(MediaTrack::is_enabled);
            self.state.camera = Some(stream);
        }
        self.state.camera.as_ref().ok_or(MediaError::NoMediaDevice)
    }

    /// Flips the microphone on or off; returns the new flag.
    pub fn toggle_audio(&mut self) -> bool {
        let Some(stream) = self.state.camera.as_ref() else {
            return false;
        };
        let enabled = !self.state.audio_enabled;
        stream.audio_tracks().for_each(|t| t.set_enabled(enabled));
        self.state.audio_enabled = enabled;
        debug!(enabled, "audio toggled");
        enabled
    }

    /// Flips the camera on or off; returns the new flag.
    pub fn toggle_video(&mut self) -> bool {
        let Some(stream) = self.state.camera.as_ref() else {
            return false;
        };
        if !stream.has_video() {
            return false;
        }
        let enabled = !self.state.video_enabled;
        stream.video_tracks().for_each(|t| t.set_enabled(enabled));
        self.state.video_enabled = enabled;
        debug!(enabled, "video toggled");
        enabled
    }

    /// Display capture. The returned video track ends when the user stops sharing.
    pub async fn acquire_screen_share(&mut self) -> Result<MediaStream, MediaError> {
        if let Some(stream) = self.state.screen.as_ref() {
            return Ok(stream.clone());
        }
        let stream = self.devices.display_media().await.map_err(|err| {
            warn!(error = %err, "display capture failed");
            MediaError::from(err)
        })?;
        if !stream.has_video() {
            stream.stop_all();
            return Err(MediaError::NoMediaDevice);
        }
        info!("screen share acquired");
        self.state.screen = Some(stream.clone());
        Ok(stream)
    }

    /// Stops the screen share, keeping the camera.
    pub fn release_screen_share(&mut self) -> usize {
        self.state
            .screen
            .take()
            .map_or(0, |stream| stream.stop_all())
    }

    /// Stops every track of every stream acquired here.
    pub fn release(&mut self) -> usize {
        let mut stopped = self.release_screen_share();
        if let Some(stream) = self.state.camera.take() {
            stopped += stream.stop_all();
        }
        if stopped > 0 {
            info!(stopped, "local media released");
        }
        self.state.audio_enabled = false;
        self.state.video_enabled = false;
        stopped
    }
}

impl Drop for MediaCaptureController {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevices;

    #[tokio::test]
    async fn acquires_camera_and_microphone() {
        let devices = Arc::new(FakeDevices::new());
        let mut media = MediaCaptureController::new(devices.clone());
        let stream = media.acquire().await.expect("media");
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(media.state().audio_enabled);
        assert!(media.state().video_enabled);
    }

    #[tokio::test]
    async fn falls_back_to_audio_only_without_camera() {
        let devices = Arc::new(FakeDevices::new().without_camera());
        let mut media = MediaCaptureController::new(devices.clone());
        let stream = media.acquire().await.expect("media");
        assert_eq!(stream.audio_tracks().count(), 1);
        assert!(!stream.has_video());
        assert!(!media.state().video_enabled);
        assert!(!media.toggle_video());
    }

    #[tokio::test]
    async fn no_devices_is_reported() {
        let devices = Arc::new(FakeDevices::new().without_camera().without_microphone());
        let mut media = MediaCaptureController::new(devices);
        assert_eq!(media.acquire().await.err(), Some(MediaError::NoMediaDevice));
    }

    #[tokio::test]
    async fn denied_permission_is_reported() {
        let devices = Arc::new(FakeDevices::new().deny_permission());
        let mut media = MediaCaptureController::new(devices);
        assert_eq!(media.acquire().await.err(), Some(MediaError::PermissionDenied));
    }

    #[tokio::test]
    async fn toggles_flip_track_enablement() {
        let devices = Arc::new(FakeDevices::new());
        let mut media = MediaCaptureController::new(devices);
        media.acquire().await.expect("media");
        assert!(!media.toggle_audio());
        assert!(!media.toggle_video());
        let stream = media.camera_stream().cloned().expect("stream");
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
        assert!(media.toggle_audio());
        assert!(stream.audio_tracks().all(MediaTrack::is_enabled));
    }

    #[tokio::test]
    async fn release_stops_every_acquired_track() {
        let devices = Arc::new(FakeDevices::new());
        let mut media = MediaCaptureController::new(devices.clone());
        media.acquire().await.expect("media");
        media.acquire_screen_share().await.expect("screen");
        assert_eq!(media.state().live_track_count(), 3);

        assert_eq!(media.release(), 3);
        assert_eq!(media.state().live_track_count(), 0);
        assert_eq!(devices.stopped_tracks(), devices.issued_tracks());
        assert_eq!(media.release(), 0);
    }

    #[tokio::test]
    async fn dropping_controller_releases_devices() {
        let devices = Arc::new(FakeDevices::new());
        {
            let mut media = MediaCaptureController::new(devices.clone());
            media.acquire().await.expect("media");
        }
        assert_eq!(devices.issued_tracks(), 2);
        assert_eq!(devices.stopped_tracks(), 2);
    }

    #[tokio::test]
    async fn screen_share_failure_keeps_camera() {
        let devices = Arc::new(FakeDevices::new().without_display());
        let mut media = MediaCaptureController::new(devices);
        media.acquire().await.expect("media");
        assert!(media.acquire_screen_share().await.is_err());
        assert_eq!(media.state().live_track_count(), 2);
    }
}
