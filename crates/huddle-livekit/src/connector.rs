use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use huddle_core::options::{ConnectOptions, VideoCodecPreference, VideoConstraints};
use huddle_core::provider::{
    Credentials, MediaTrack, ParticipantInfo, ParticipantSnapshot, PublicationSnapshot, Session,
    SessionConnector, SessionEvent, SessionEvents, TrackKind,
};
use huddle_core::ProviderError;
use livekit::options::{AudioEncoding, TrackPublishOptions, VideoCodec};
use livekit::prelude::{RemoteParticipant, RemoteTrackPublication, Room, RoomEvent, RoomOptions};
use livekit::track::{LocalAudioTrack, LocalVideoTrack, TrackSource as LkTrackSource};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::{AudioSourceOptions, RtcAudioSource, RtcVideoSource, VideoResolution};
use livekit::webrtc::video_source::native::NativeVideoSource;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::renderer::MediaRenderer;
use crate::track::{track_kind, CameraDevice, LiveKitTrack, MicrophoneDevice};

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

/// Opens LiveKit rooms for the core.
pub struct LiveKitConnector {
    renderer: MediaRenderer,
    camera: Option<Arc<dyn CameraDevice>>,
    microphone: Option<Arc<dyn MicrophoneDevice>>,
}

impl LiveKitConnector {
    pub fn new(renderer: MediaRenderer) -> Self {
        Self {
            renderer,
            camera: None,
            microphone: None,
        }
    }

    /// Publish a camera on join and allow reacquiring it later.
    pub fn with_camera(mut self, camera: Arc<dyn CameraDevice>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Publish a microphone on join.
    pub fn with_microphone(mut self, microphone: Arc<dyn MicrophoneDevice>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    /// Register frame sinks here for the surfaces the host creates.
    pub fn renderer(&self) -> &MediaRenderer {
        &self.renderer
    }
}

impl SessionConnector for LiveKitConnector {
    type Session = LiveKitSession;

    async fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<(LiveKitSession, SessionEvents<LiveKitTrack>), ProviderError> {
        let mut room_options = RoomOptions::default();
        room_options.auto_subscribe = true;
        room_options.adaptive_stream = true;
        room_options.dynacast = true;

        tracing::info!(room = %options.room_name, url = %credentials.url, "connecting to LiveKit");
        if let Some(cap) = options.max_subscription_bitrate {
            tracing::debug!(cap, "subscription cap left to adaptive stream");
        }

        let (room, room_events) = Room::connect(&credentials.url, &credentials.token, room_options)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        let local_sid = room.local_participant().sid().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let dominant = Arc::new(Mutex::new(None));
        let pump = self.renderer.runtime().spawn(pump_events(
            room_events,
            tx,
            self.renderer.clone(),
            local_sid,
            dominant.clone(),
        ));

        let session = LiveKitSession {
            room: Arc::new(room),
            renderer: self.renderer.clone(),
            camera: self.camera.clone(),
            publishing: PublishSettings::from_options(options),
            published: Mutex::new(HashMap::new()),
            dominant,
            pump,
        };
        if let Some(microphone) = &self.microphone {
            session
                .publish_initial_microphone(microphone.clone(), options.audio_device_id.as_deref())
                .await;
        }
        session.publish_initial_camera(&options.video).await;
        Ok((session, rx))
    }
}

/// Encoding choices applied to every track this session publishes.
struct PublishSettings {
    video_codec: VideoCodec,
    simulcast: bool,
    max_audio_bitrate: Option<u32>,
}

impl PublishSettings {
    fn from_options(options: &ConnectOptions) -> Self {
        let preferred = options.preferred_video_codecs.iter().find_map(|pref| {
            let codec = video_codec(&pref.codec);
            if codec.is_none() {
                tracing::warn!(codec = %pref.codec, "unsupported video codec preference");
            }
            codec.map(|codec| (codec, pref))
        });
        let (video_codec, simulcast) = match preferred {
            Some((codec, VideoCodecPreference { simulcast, .. })) => (codec, *simulcast),
            None => (VideoCodec::VP8, true),
        };
        Self {
            video_codec,
            simulcast,
            max_audio_bitrate: options.max_audio_bitrate,
        }
    }

    fn publish_options(&self, kind: TrackKind) -> TrackPublishOptions {
        match kind {
            TrackKind::Video => TrackPublishOptions {
                source: LkTrackSource::Camera,
                video_codec: self.video_codec.clone(),
                simulcast: self.simulcast,
                ..Default::default()
            },
            TrackKind::Audio => TrackPublishOptions {
                source: LkTrackSource::Microphone,
                audio_encoding: self.max_audio_bitrate.map(|max| AudioEncoding {
                    max_bitrate: u64::from(max),
                }),
                ..Default::default()
            },
        }
    }
}

fn video_codec(name: &str) -> Option<VideoCodec> {
    match name.to_ascii_uppercase().as_str() {
        "VP8" => Some(VideoCodec::VP8),
        "VP9" => Some(VideoCodec::VP9),
        "H264" => Some(VideoCodec::H264),
        "AV1" => Some(VideoCodec::AV1),
        _ => None,
    }
}

/// A connected LiveKit room.
pub struct LiveKitSession {
    room: Arc<Room>,
    renderer: MediaRenderer,
    camera: Option<Arc<dyn CameraDevice>>,
    publishing: PublishSettings,
    published: Mutex<HashMap<String, LiveKitTrack>>, // track SID -> track we published
    dominant: Arc<Mutex<Option<String>>>,
    pump: JoinHandle<()>,
}

impl LiveKitSession {
    async fn publish_initial_microphone(
        &self,
        device: Arc<dyn MicrophoneDevice>,
        device_id: Option<&str>,
    ) {
        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );
        if let Err(e) = device.open(device_id, source.clone()) {
            tracing::warn!("joining without microphone: {e}");
            return;
        }

        let track = LiveKitTrack::microphone(
            LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source)),
            device,
            self.renderer.clone(),
        );
        if let Err(e) = self.publish_track(&track).await {
            tracing::warn!("joining without microphone: {e}");
            if let Err(e) = track.stop() {
                tracing::warn!("failed to release microphone: {e}");
            }
        }
    }

    async fn publish_initial_camera(&self, constraints: &VideoConstraints) {
        if self.camera.is_none() {
            return;
        }
        let track = match self.create_camera_track(constraints).await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("joining without camera: {e}");
                return;
            }
        };
        if let Err(e) = self.publish_track(&track).await {
            tracing::warn!("joining without camera: {e}");
            if let Err(e) = track.stop() {
                tracing::warn!("failed to release camera: {e}");
            }
        }
    }

    fn published(&self) -> MutexGuard<'_, HashMap<String, LiveKitTrack>> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LiveKitSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl Session for LiveKitSession {
    type Track = LiveKitTrack;

    fn local_participant(&self) -> ParticipantSnapshot<LiveKitTrack> {
        let local = self.room.local_participant();
        let published = self.published();
        let publications = local
            .track_publications()
            .values()
            .map(|publication| {
                let sid = publication.sid().to_string();
                let track = published.get(&sid).cloned().or_else(|| {
                    publication
                        .track()
                        .map(|track| LiveKitTrack::local(track, self.renderer.clone()))
                });
                PublicationSnapshot {
                    sid,
                    kind: track_kind(publication.kind()),
                    track,
                }
            })
            .collect();

        ParticipantSnapshot {
            info: ParticipantInfo {
                sid: local.sid().to_string(),
                identity: local.identity().to_string(),
            },
            publications,
        }
    }

    fn participants(&self) -> Vec<ParticipantSnapshot<LiveKitTrack>> {
        self.room
            .remote_participants()
            .values()
            .map(|participant| remote_snapshot(participant, &self.renderer))
            .collect()
    }

    fn dominant_speaker(&self) -> Option<String> {
        self.dominant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn create_camera_track(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<LiveKitTrack, ProviderError> {
        let device = self
            .camera
            .clone()
            .ok_or_else(|| ProviderError::Capture("no camera device configured".into()))?;

        let source = NativeVideoSource::new(
            VideoResolution {
                width: constraints.width,
                height: constraints.height,
            },
            false, // not a screencast
        );
        device.open(constraints, source.clone())?;

        let track = LocalVideoTrack::create_video_track("camera", RtcVideoSource::Native(source));
        Ok(LiveKitTrack::camera(track, device, self.renderer.clone()))
    }

    async fn publish_track(&self, track: &LiveKitTrack) -> Result<(), ProviderError> {
        let local_track = track
            .local_track()
            .ok_or_else(|| ProviderError::Publish("remote tracks cannot be published".into()))?;
        self.room
            .local_participant()
            .publish_track(local_track, self.publishing.publish_options(track.kind()))
            .await
            .map_err(|e| ProviderError::Publish(e.to_string()))?;

        let sid = track.sid();
        tracing::info!(track_sid = %sid, "track published");
        self.published().insert(sid, track.clone());
        Ok(())
    }

    async fn unpublish_track(&self, track: &LiveKitTrack) -> Result<(), ProviderError> {
        let local_track = track
            .local_track()
            .ok_or_else(|| ProviderError::Unpublish("remote tracks cannot be unpublished".into()))?;
        self.published().remove(&track.sid());

        self.room
            .local_participant()
            .unpublish_track(&local_track.sid())
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Unpublish(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.room.close().await {
            tracing::warn!("error closing room: {e}");
        }
    }
}

fn remote_snapshot(
    participant: &RemoteParticipant,
    renderer: &MediaRenderer,
) -> ParticipantSnapshot<LiveKitTrack> {
    ParticipantSnapshot {
        info: ParticipantInfo {
            sid: participant.sid().to_string(),
            identity: participant.identity().to_string(),
        },
        publications: participant
            .track_publications()
            .values()
            .map(|publication| remote_publication(publication, renderer))
            .collect(),
    }
}

fn remote_publication(
    publication: &RemoteTrackPublication,
    renderer: &MediaRenderer,
) -> PublicationSnapshot<LiveKitTrack> {
    PublicationSnapshot {
        sid: publication.sid().to_string(),
        kind: track_kind(publication.kind()),
        track: publication
            .track()
            .map(|track| LiveKitTrack::remote(track, renderer.clone())),
    }
}

async fn pump_events(
    mut room_events: mpsc::UnboundedReceiver<RoomEvent>,
    events: mpsc::UnboundedSender<SessionEvent<LiveKitTrack>>,
    renderer: MediaRenderer,
    local_sid: String,
    dominant: Arc<Mutex<Option<String>>>,
) {
    while let Some(event) = room_events.recv().await {
        let Some(event) = convert_event(event, &renderer, &local_sid, &dominant) else {
            continue;
        };
        let terminal = matches!(event, SessionEvent::Disconnected { .. });
        if events.send(event).is_err() {
            tracing::debug!("session gone, stopping event pump");
            break;
        }
        if terminal {
            break;
        }
    }
    tracing::debug!("event pump exited");
}

fn convert_event(
    event: RoomEvent,
    renderer: &MediaRenderer,
    local_sid: &str,
    dominant: &Mutex<Option<String>>,
) -> Option<SessionEvent<LiveKitTrack>> {
    let event = match event {
        RoomEvent::ParticipantConnected(participant) => {
            SessionEvent::ParticipantConnected(remote_snapshot(&participant, renderer))
        }
        RoomEvent::ParticipantDisconnected(participant) => SessionEvent::ParticipantDisconnected {
            participant_sid: participant.sid().to_string(),
        },
        RoomEvent::TrackPublished {
            publication,
            participant,
        } => SessionEvent::TrackPublished {
            participant_sid: participant.sid().to_string(),
            publication: remote_publication(&publication, renderer),
        },
        RoomEvent::TrackSubscribed {
            track,
            publication,
            participant,
        } => SessionEvent::TrackSubscribed {
            participant_sid: participant.sid().to_string(),
            publication_sid: publication.sid().to_string(),
            track: LiveKitTrack::remote(track, renderer.clone()),
        },
        RoomEvent::TrackUnsubscribed {
            track,
            publication,
            participant,
        } => SessionEvent::TrackUnsubscribed {
            participant_sid: participant.sid().to_string(),
            publication_sid: publication.sid().to_string(),
            track: LiveKitTrack::remote(track, renderer.clone()),
        },
        RoomEvent::ActiveSpeakersChanged { speakers } => {
            let speakers: Vec<String> = speakers.iter().map(|p| p.sid().to_string()).collect();
            let mut last = dominant.lock().unwrap_or_else(PoisonError::into_inner);
            let speaker = next_dominant_speaker(last.as_deref(), &speakers, local_sid)?;
            *last = Some(speaker.clone());
            SessionEvent::DominantSpeakerChanged {
                participant_sid: Some(speaker),
            }
        }
        RoomEvent::Disconnected { reason } => {
            tracing::info!("room disconnected: {reason:?}");
            SessionEvent::Disconnected {
                error: disconnect_error(&format!("{reason:?}")),
            }
        }
        _ => return None,
    };
    Some(event)
}

/// The loudest remote speaker, if it differs from the last one reported.
///
/// The local participant is never the dominant speaker. Silence, or only
/// the local participant talking, keeps the last one.
fn next_dominant_speaker(last: Option<&str>, speakers: &[String], local_sid: &str) -> Option<String> {
    let speaker = speakers.iter().find(|sid| *sid != local_sid)?;
    (last != Some(speaker.as_str())).then(|| speaker.clone())
}

/// `None` for a disconnect we asked for.
fn disconnect_error(reason: &str) -> Option<String> {
    match reason {
        "ClientInitiated" => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_new_speakers_are_reported() {
        assert_eq!(next_dominant_speaker(None, &sids(&["PA_1"]), "PA_L"), Some("PA_1".into()));
        assert_eq!(
            next_dominant_speaker(Some("PA_1"), &sids(&["PA_2", "PA_1"]), "PA_L"),
            Some("PA_2".into())
        );
        assert_eq!(next_dominant_speaker(Some("PA_1"), &sids(&["PA_1"]), "PA_L"), None);
    }

    #[test]
    fn silence_keeps_the_last_speaker() {
        assert_eq!(next_dominant_speaker(Some("PA_1"), &[], "PA_L"), None);
        assert_eq!(next_dominant_speaker(None, &[], "PA_L"), None);
    }

    #[test]
    fn local_participant_is_never_dominant() {
        assert_eq!(
            next_dominant_speaker(Some("PA_B"), &sids(&["PA_L", "PA_B"]), "PA_L"),
            None
        );
        assert_eq!(next_dominant_speaker(Some("PA_B"), &sids(&["PA_L"]), "PA_L"), None);
        assert_eq!(
            next_dominant_speaker(Some("PA_B"), &sids(&["PA_L", "PA_C"]), "PA_L"),
            Some("PA_C".into())
        );
    }

    fn options_with_codecs(codecs: &[(&str, bool)]) -> ConnectOptions {
        let mut options = huddle_core::JoinConfig::new("standup", huddle_core::RuntimeContext::Desktop)
            .connect_options();
        options.preferred_video_codecs = codecs
            .iter()
            .map(|(codec, simulcast)| VideoCodecPreference {
                codec: codec.to_string(),
                simulcast: *simulcast,
            })
            .collect();
        options
    }

    #[test]
    fn camera_uses_the_first_supported_codec_preference() {
        let settings = PublishSettings::from_options(&options_with_codecs(&[("theora", true), ("h264", false)]));
        let publish = settings.publish_options(TrackKind::Video);
        assert!(matches!(publish.video_codec, VideoCodec::H264));
        assert!(!publish.simulcast);
        assert_eq!(publish.source, LkTrackSource::Camera);

        let fallback = PublishSettings::from_options(&options_with_codecs(&[]));
        assert!(matches!(fallback.video_codec, VideoCodec::VP8));
        assert!(fallback.simulcast);
    }

    #[test]
    fn microphone_is_capped_at_the_audio_bitrate() {
        let settings = PublishSettings::from_options(&options_with_codecs(&[("VP8", true)]));
        let publish = settings.publish_options(TrackKind::Audio);
        assert_eq!(publish.source, LkTrackSource::Microphone);
        assert_eq!(publish.audio_encoding.map(|e| e.max_bitrate), Some(16_000));
    }

    #[test]
    fn client_initiated_disconnect_is_graceful() {
        assert_eq!(disconnect_error("ClientInitiated"), None);
        assert_eq!(
            disconnect_error("ParticipantRemoved"),
            Some("ParticipantRemoved".to_string())
        );
    }
}
