use std::sync::Arc;

use huddle_core::options::VideoConstraints;
use huddle_core::provider::{MediaTrack, TrackKind, TrackPriority};
use huddle_core::{ProviderError, SurfaceId};
use livekit::track::{
    LocalAudioTrack, LocalTrack, LocalVideoTrack, RemoteTrack, TrackKind as LkTrackKind,
};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::video_source::native::NativeVideoSource;

use crate::renderer::MediaRenderer;

/// Platform camera pipeline feeding a LiveKit video source.
///
/// `open` starts pushing captured frames into `source`; `close` releases
/// the device. Both are called from the session task.
pub trait CameraDevice: Send + Sync {
    fn open(
        &self,
        constraints: &VideoConstraints,
        source: NativeVideoSource,
    ) -> Result<(), ProviderError>;

    fn close(&self);
}

/// Platform audio capture feeding a LiveKit audio source (48 kHz mono).
pub trait MicrophoneDevice: Send + Sync {
    fn open(&self, device_id: Option<&str>, source: NativeAudioSource) -> Result<(), ProviderError>;

    fn close(&self);
}

#[derive(Clone)]
enum TrackMedia {
    Remote(RemoteTrack),
    /// A local track published by someone else (e.g. the host's microphone).
    Local(LocalTrack),
    /// A camera track this crate created and owns the device for.
    Camera {
        track: LocalVideoTrack,
        device: Arc<dyn CameraDevice>,
    },
    Microphone {
        track: LocalAudioTrack,
        device: Arc<dyn MicrophoneDevice>,
    },
}

/// LiveKit track handle as seen by the core.
#[derive(Clone)]
pub struct LiveKitTrack {
    media: TrackMedia,
    renderer: MediaRenderer,
}

impl LiveKitTrack {
    pub(crate) fn remote(track: RemoteTrack, renderer: MediaRenderer) -> Self {
        Self {
            media: TrackMedia::Remote(track),
            renderer,
        }
    }

    pub(crate) fn local(track: LocalTrack, renderer: MediaRenderer) -> Self {
        Self {
            media: TrackMedia::Local(track),
            renderer,
        }
    }

    pub(crate) fn camera(
        track: LocalVideoTrack,
        device: Arc<dyn CameraDevice>,
        renderer: MediaRenderer,
    ) -> Self {
        Self {
            media: TrackMedia::Camera { track, device },
            renderer,
        }
    }

    pub(crate) fn microphone(
        track: LocalAudioTrack,
        device: Arc<dyn MicrophoneDevice>,
        renderer: MediaRenderer,
    ) -> Self {
        Self {
            media: TrackMedia::Microphone { track, device },
            renderer,
        }
    }

    /// The publishable handle, for local tracks only.
    pub(crate) fn local_track(&self) -> Option<LocalTrack> {
        match &self.media {
            TrackMedia::Remote(_) => None,
            TrackMedia::Local(track) => Some(track.clone()),
            TrackMedia::Camera { track, .. } => Some(LocalTrack::Video(track.clone())),
            TrackMedia::Microphone { track, .. } => Some(LocalTrack::Audio(track.clone())),
        }
    }
}

pub(crate) fn track_kind(kind: LkTrackKind) -> TrackKind {
    match kind {
        LkTrackKind::Audio => TrackKind::Audio,
        LkTrackKind::Video => TrackKind::Video,
    }
}

impl MediaTrack for LiveKitTrack {
    fn sid(&self) -> String {
        // Local SIDs are only assigned on publish, so never cache them.
        match &self.media {
            TrackMedia::Remote(track) => track.sid().to_string(),
            TrackMedia::Local(track) => track.sid().to_string(),
            TrackMedia::Camera { track, .. } => track.sid().to_string(),
            TrackMedia::Microphone { track, .. } => track.sid().to_string(),
        }
    }

    fn kind(&self) -> TrackKind {
        match &self.media {
            TrackMedia::Remote(track) => track_kind(track.kind()),
            TrackMedia::Local(track) => track_kind(track.kind()),
            TrackMedia::Camera { .. } => TrackKind::Video,
            TrackMedia::Microphone { .. } => TrackKind::Audio,
        }
    }

    fn attach(&self, surface: SurfaceId) {
        let sid = self.sid();
        match &self.media {
            TrackMedia::Remote(RemoteTrack::Video(track)) => {
                self.renderer.start_video(sid, track.rtc_track(), surface);
            }
            TrackMedia::Remote(RemoteTrack::Audio(track)) => {
                self.renderer.start_audio(sid, track.rtc_track(), surface);
            }
            TrackMedia::Local(LocalTrack::Video(track)) | TrackMedia::Camera { track, .. } => {
                self.renderer.start_video(sid, track.rtc_track(), surface);
            }
            // Never play our own microphone back.
            TrackMedia::Local(LocalTrack::Audio(_)) | TrackMedia::Microphone { .. } => {}
        }
    }

    fn detach(&self, surface: SurfaceId) {
        self.renderer.stop(&self.sid(), surface);
    }

    fn set_priority(&self, _priority: Option<TrackPriority>) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("track priority"))
    }

    fn stop(&self) -> Result<(), ProviderError> {
        match &self.media {
            TrackMedia::Remote(_) => Ok(()),
            TrackMedia::Local(_) => {
                self.renderer.stop_track(&self.sid());
                Ok(())
            }
            TrackMedia::Camera { device, .. } => {
                self.renderer.stop_track(&self.sid());
                device.close();
                tracing::debug!(track_sid = %self.sid(), "camera device closed");
                Ok(())
            }
            TrackMedia::Microphone { device, .. } => {
                device.close();
                tracing::debug!(track_sid = %self.sid(), "microphone device closed");
                Ok(())
            }
        }
    }
}
