//! Seams to the session provider and to the rendering host.
//!
//! The core never talks to a transport or a DOM directly. A provider crate
//! (e.g. `huddle-livekit`) implements [`SessionConnector`], [`Session`] and
//! [`MediaTrack`]; the UI shell implements [`SurfaceHost`].

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ProviderError;
use crate::options::{ConnectOptions, VideoConstraints};

/// Opaque handle to a rendering target owned by the [`SurfaceHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Quality-of-service hint forwarded to the provider for a participant's video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackPriority {
    Low,
    Standard,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct PublicationSnapshot<T> {
    pub sid: String,
    pub kind: TrackKind,
    /// Present once the track is subscribed (always present for local tracks).
    pub track: Option<T>,
}

#[derive(Debug, Clone)]
pub struct ParticipantSnapshot<T> {
    pub info: ParticipantInfo,
    pub publications: Vec<PublicationSnapshot<T>>,
}

/// Everything the provider can tell the core after connecting.
#[derive(Debug, Clone)]
pub enum SessionEvent<T> {
    ParticipantConnected(ParticipantSnapshot<T>),
    ParticipantDisconnected {
        participant_sid: String,
    },
    /// `None` when the provider clears the dominant speaker.
    DominantSpeakerChanged {
        participant_sid: Option<String>,
    },
    TrackPublished {
        participant_sid: String,
        publication: PublicationSnapshot<T>,
    },
    TrackSubscribed {
        participant_sid: String,
        publication_sid: String,
        track: T,
    },
    TrackUnsubscribed {
        participant_sid: String,
        publication_sid: String,
        track: T,
    },
    /// `error` is `None` for a graceful disconnect.
    Disconnected {
        error: Option<String>,
    },
}

pub type SessionEvents<T> = mpsc::UnboundedReceiver<SessionEvent<T>>;

/// Token and server address used to join a session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub url: String,
    pub token: String,
}

/// A local or remote media track as exposed by the provider.
pub trait MediaTrack: Clone {
    fn sid(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Start rendering (or playing) this track on `surface`.
    fn attach(&self, surface: SurfaceId);

    /// Stop rendering this track on `surface`.
    fn detach(&self, surface: SurfaceId);

    fn set_priority(&self, priority: Option<TrackPriority>) -> Result<(), ProviderError>;

    /// Release the underlying capture device (local tracks only).
    fn stop(&self) -> Result<(), ProviderError>;
}

/// A connected session.
pub trait Session {
    type Track: MediaTrack + 'static;

    fn local_participant(&self) -> ParticipantSnapshot<Self::Track>;

    /// Remote participants already present when the session was joined.
    fn participants(&self) -> Vec<ParticipantSnapshot<Self::Track>>;

    fn dominant_speaker(&self) -> Option<String>;

    fn create_camera_track(
        &self,
        constraints: &VideoConstraints,
    ) -> impl Future<Output = Result<Self::Track, ProviderError>>;

    fn publish_track(&self, track: &Self::Track) -> impl Future<Output = Result<(), ProviderError>>;

    fn unpublish_track(
        &self,
        track: &Self::Track,
    ) -> impl Future<Output = Result<(), ProviderError>>;

    fn disconnect(&self) -> impl Future<Output = ()>;
}

pub type TrackOf<S> = <S as Session>::Track;

pub trait SessionConnector {
    type Session: Session + 'static;

    fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> impl Future<
        Output = Result<(Self::Session, SessionEvents<TrackOf<Self::Session>>), ProviderError>,
    >;
}

/// What the host needs to build a participant's thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailSpec {
    pub participant_sid: String,
    pub identity: String,
    /// Local thumbnails must not play their own audio back.
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Highlight {
    pub active: bool,
    pub pinned: bool,
}

/// The rendering layer: owns every surface, the core only holds ids.
pub trait SurfaceHost {
    /// The process-lifetime primary surface.
    fn primary(&self) -> SurfaceId;

    fn create_thumbnail(&self, spec: &ThumbnailSpec) -> SurfaceId;

    fn destroy_thumbnail(&self, surface: SurfaceId);

    /// Blank the media element of `kind` so it renders nothing.
    fn clear(&self, surface: SurfaceId, kind: TrackKind);

    fn set_highlight(&self, surface: SurfaceId, highlight: Highlight);

    /// Label shown over the primary surface. Empty when nobody is shown.
    fn set_primary_identity(&self, identity: &str);
}
