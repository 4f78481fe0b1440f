//! Local call recorder.
//!
//! Mixes the local stream and the remote tracks into one stream, hands it to
//! the platform encoder and writes the encoded container to the recordings
//! directory on stop. Recording is best effort: every failure is logged and
//! reported as "not recording", never as a call error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RecorderError;
use crate::media::{MediaStream, MediaTrack};
use crate::session::SessionId;

/// Containers tried in order.
pub const PREFERRED_MIME_TYPES: [&str; 3] = [
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
];

/// Platform media encoder.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Starts encoding `stream`; encoded chunks go to `chunks` until the session is stopped.
    async fn start(
        &self,
        stream: &MediaStream,
        mime_type: &str,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn EncoderSession>, RecorderError>;
}

#[async_trait]
pub trait EncoderSession: Send {
    /// Flushes the encoder. Every chunk has been sent once this returns.
    async fn stop(self: Box<Self>) -> Result<(), RecorderError>;
}

/// All local tracks followed by the remote ones, skipping ended tracks.
pub fn compose_stream(local: &MediaStream, remote: &[MediaTrack]) -> MediaStream {
    let mut stream = MediaStream::new(Vec::new());
    for track in local.tracks().iter().chain(remote) {
        if track.is_live() {
            stream.add_track(track.clone());
        }
    }
    stream
}

struct ActiveRecording {
    session: Box<dyn EncoderSession>,
    chunks: mpsc::UnboundedReceiver<Bytes>,
    mime_type: &'static str,
}

pub struct LocalRecorder {
    encoder: Arc<dyn MediaEncoder>,
    dir: PathBuf,
    session_id: SessionId,
    active: Option<ActiveRecording>,
}

impl LocalRecorder {
    pub fn new(encoder: Arc<dyn MediaEncoder>, dir: impl Into<PathBuf>, session_id: SessionId) -> Self {
        Self {
            encoder,
            dir: dir.into(),
            session_id,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn pick_mime_type(&self) -> Option<&'static str> {
        PREFERRED_MIME_TYPES
            .into_iter()
            .find(|mime| self.encoder.is_type_supported(mime))
    }

    /// Returns whether a recording is running afterwards.
    pub async fn start(&mut self, local: &MediaStream, remote: &[MediaTrack]) -> bool {
        if self.active.is_some() {
            warn!("recording already in progress");
            return true;
        }
        match self.begin(local, remote).await {
            Ok(recording) => {
                info!(mime = recording.mime_type, "recording started");
                self.active = Some(recording);
                true
            }
            Err(err) => {
                warn!(error = %err, "recording not started");
                false
            }
        }
    }

    async fn begin(
        &self,
        local: &MediaStream,
        remote: &[MediaTrack],
    ) -> Result<ActiveRecording, RecorderError> {
        let mime_type = self.pick_mime_type().ok_or(RecorderError::Unsupported)?;
        let stream = compose_stream(local, remote);
        debug!(tracks = stream.tracks().len(), mime_type, "composed recording stream");
        let (tx, chunks) = mpsc::unbounded_channel();
        let session = self.encoder.start(&stream, mime_type, tx).await?;
        Ok(ActiveRecording {
            session,
            chunks,
            mime_type,
        })
    }

    /// Finalises the recording and writes it out. `None` if nothing was recording
    /// or the file could not be produced.
    pub async fn stop(&mut self) -> Option<PathBuf> {
        let recording = self.active.take()?;
        match self.finish(recording).await {
            Ok(path) => {
                info!(path = %path.display(), "recording saved");
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, "recording lost");
                None
            }
        }
    }

    async fn finish(&self, recording: ActiveRecording) -> Result<PathBuf, RecorderError> {
        let ActiveRecording {
            session,
            mut chunks,
            ..
        } = recording;
        session.stop().await?;
        let mut data = BytesMut::new();
        while let Ok(chunk) = chunks.try_recv() {
            data.extend_from_slice(&chunk);
        }
        if data.is_empty() {
            return Err(RecorderError::Encoder("no data encoded".into()));
        }
        let path = recording_path(&self.dir, &self.session_id);
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &data).await?;
        Ok(path)
    }
}

fn recording_path(dir: &Path, session_id: &SessionId) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    dir.join(format!("session-{session_id}-{stamp}.webm"))
}
