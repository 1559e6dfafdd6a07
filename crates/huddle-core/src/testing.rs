//! In-memory provider and surface host used by the unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::errors::ProviderError;
use crate::events::{HuddleEvent, HuddleEventListener};
use crate::options::{ConnectOptions, VideoConstraints};
use crate::provider::{
    Credentials, Highlight, MediaTrack, ParticipantInfo, ParticipantSnapshot, PublicationSnapshot,
    Session, SessionConnector, SessionEvent, SessionEvents, SurfaceHost, SurfaceId,
    ThumbnailSpec, TrackKind, TrackPriority,
};

pub const PRIMARY: SurfaceId = SurfaceId(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOp {
    Attach { track: String, surface: SurfaceId },
    Detach { track: String, surface: SurfaceId },
    Clear { surface: SurfaceId, kind: TrackKind },
    Created { surface: SurfaceId, participant: String },
    Destroyed { surface: SurfaceId },
    Priority { track: String, priority: Option<TrackPriority> },
    Stopped { track: String },
}

#[derive(Debug, Default)]
struct StageState {
    next_surface: u64,
    sources: HashMap<SurfaceId, Vec<String>>,
    thumbnails: HashMap<SurfaceId, ThumbnailSpec>,
    highlights: HashMap<SurfaceId, Highlight>,
    primary_identity: String,
    ops: Vec<StageOp>,
    reject_priority: bool,
    failing_stops: HashSet<String>,
    destroyed_while_bound: Vec<SurfaceId>,
}

/// Recording surface host. Tracks created from it report their
/// attach/detach calls back into the same stage.
#[derive(Debug, Clone)]
pub struct Stage(Rc<RefCell<StageState>>);

impl Stage {
    pub fn new() -> Self {
        let mut state = StageState {
            next_surface: 1,
            ..Default::default()
        };
        state.sources.insert(PRIMARY, Vec::new());
        Self(Rc::new(RefCell::new(state)))
    }

    pub fn video(&self, sid: &str) -> FakeTrack {
        FakeTrack {
            sid: sid.to_string(),
            kind: TrackKind::Video,
            stage: self.clone(),
        }
    }

    pub fn audio(&self, sid: &str) -> FakeTrack {
        FakeTrack {
            sid: sid.to_string(),
            kind: TrackKind::Audio,
            stage: self.clone(),
        }
    }

    pub fn sources(&self, surface: SurfaceId) -> Vec<String> {
        self.0.borrow().sources.get(&surface).cloned().unwrap_or_default()
    }

    pub fn primary_sources(&self) -> Vec<String> {
        self.sources(PRIMARY)
    }

    pub fn thumbnail_count(&self) -> usize {
        self.0.borrow().thumbnails.len()
    }

    pub fn thumbnail_of(&self, participant_sid: &str) -> Option<SurfaceId> {
        self.0
            .borrow()
            .thumbnails
            .iter()
            .find(|(_, spec)| spec.participant_sid == participant_sid)
            .map(|(id, _)| *id)
    }

    pub fn thumbnail_spec(&self, participant_sid: &str) -> Option<ThumbnailSpec> {
        self.0
            .borrow()
            .thumbnails
            .values()
            .find(|spec| spec.participant_sid == participant_sid)
            .cloned()
    }

    pub fn highlight(&self, surface: SurfaceId) -> Highlight {
        self.0.borrow().highlights.get(&surface).copied().unwrap_or_default()
    }

    pub fn primary_identity(&self) -> String {
        self.0.borrow().primary_identity.clone()
    }

    pub fn ops(&self) -> Vec<StageOp> {
        self.0.borrow().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<StageOp> {
        std::mem::take(&mut self.0.borrow_mut().ops)
    }

    pub fn priorities(&self) -> Vec<(String, Option<TrackPriority>)> {
        self.0
            .borrow()
            .ops
            .iter()
            .filter_map(|op| match op {
                StageOp::Priority { track, priority } => Some((track.clone(), *priority)),
                _ => None,
            })
            .collect()
    }

    pub fn is_stopped(&self, track_sid: &str) -> bool {
        self.0
            .borrow()
            .ops
            .iter()
            .any(|op| matches!(op, StageOp::Stopped { track } if track == track_sid))
    }

    pub fn reject_priority(&self) {
        self.0.borrow_mut().reject_priority = true;
    }

    /// Make `stop` fail for `track_sid`. Failed stops are not recorded.
    pub fn fail_stop(&self, track_sid: &str) {
        self.0.borrow_mut().failing_stops.insert(track_sid.to_string());
    }

    pub fn destroyed_while_bound(&self) -> Vec<SurfaceId> {
        self.0.borrow().destroyed_while_bound.clone()
    }
}

impl SurfaceHost for Stage {
    fn primary(&self) -> SurfaceId {
        PRIMARY
    }

    fn create_thumbnail(&self, spec: &ThumbnailSpec) -> SurfaceId {
        let mut state = self.0.borrow_mut();
        let id = SurfaceId(state.next_surface);
        state.next_surface += 1;
        state.sources.insert(id, Vec::new());
        state.thumbnails.insert(id, spec.clone());
        state.ops.push(StageOp::Created {
            surface: id,
            participant: spec.participant_sid.clone(),
        });
        id
    }

    fn destroy_thumbnail(&self, surface: SurfaceId) {
        let mut state = self.0.borrow_mut();
        if state.sources.remove(&surface).is_some_and(|s| !s.is_empty()) {
            state.destroyed_while_bound.push(surface);
        }
        state.thumbnails.remove(&surface);
        state.highlights.remove(&surface);
        state.ops.push(StageOp::Destroyed { surface });
    }

    fn clear(&self, surface: SurfaceId, kind: TrackKind) {
        self.0.borrow_mut().ops.push(StageOp::Clear { surface, kind });
    }

    fn set_highlight(&self, surface: SurfaceId, highlight: Highlight) {
        self.0.borrow_mut().highlights.insert(surface, highlight);
    }

    fn set_primary_identity(&self, identity: &str) {
        self.0.borrow_mut().primary_identity = identity.to_string();
    }
}

#[derive(Debug, Clone)]
pub struct FakeTrack {
    sid: String,
    kind: TrackKind,
    stage: Stage,
}

impl MediaTrack for FakeTrack {
    fn sid(&self) -> String {
        self.sid.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn attach(&self, surface: SurfaceId) {
        let mut state = self.stage.0.borrow_mut();
        state.sources.entry(surface).or_default().push(self.sid.clone());
        state.ops.push(StageOp::Attach {
            track: self.sid.clone(),
            surface,
        });
    }

    fn detach(&self, surface: SurfaceId) {
        let mut state = self.stage.0.borrow_mut();
        if let Some(sources) = state.sources.get_mut(&surface) {
            sources.retain(|s| s != &self.sid);
        }
        state.ops.push(StageOp::Detach {
            track: self.sid.clone(),
            surface,
        });
    }

    fn set_priority(&self, priority: Option<TrackPriority>) -> Result<(), ProviderError> {
        let mut state = self.stage.0.borrow_mut();
        state.ops.push(StageOp::Priority {
            track: self.sid.clone(),
            priority,
        });
        if state.reject_priority {
            return Err(ProviderError::Unsupported("track priority"));
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), ProviderError> {
        let mut state = self.stage.0.borrow_mut();
        if state.failing_stops.contains(&self.sid) {
            return Err(ProviderError::Other(format!("{} could not be stopped", self.sid)));
        }
        state.ops.push(StageOp::Stopped {
            track: self.sid.clone(),
        });
        Ok(())
    }
}

pub fn participant(sid: &str, identity: &str, tracks: &[FakeTrack]) -> ParticipantSnapshot<FakeTrack> {
    ParticipantSnapshot {
        info: ParticipantInfo {
            sid: sid.to_string(),
            identity: identity.to_string(),
        },
        publications: tracks.iter().map(publication).collect(),
    }
}

pub fn publication(track: &FakeTrack) -> PublicationSnapshot<FakeTrack> {
    PublicationSnapshot {
        sid: format!("pub-{}", track.sid()),
        kind: track.kind(),
        track: Some(track.clone()),
    }
}

pub fn pending_publication(track: &FakeTrack) -> PublicationSnapshot<FakeTrack> {
    PublicationSnapshot {
        track: None,
        ..publication(track)
    }
}

#[derive(Debug, Default)]
pub struct SessionLogState {
    pub published: Vec<String>,
    pub unpublished: Vec<String>,
    pub cameras_created: Vec<String>,
    pub disconnects: usize,
    pub options: Option<ConnectOptions>,
    fail_next_camera: bool,
    fail_next_publish: bool,
    fail_unpublish: bool,
    camera_gate: Option<Rc<Notify>>,
    publish_gate: Option<Rc<Notify>>,
}

/// Shared view of what the fake session was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SessionLog(Rc<RefCell<SessionLogState>>);

impl SessionLog {
    pub fn state(&self) -> std::cell::Ref<'_, SessionLogState> {
        self.0.borrow()
    }

    pub fn fail_next_camera(&self) {
        self.0.borrow_mut().fail_next_camera = true;
    }

    pub fn fail_next_publish(&self) {
        self.0.borrow_mut().fail_next_publish = true;
    }

    /// Every unpublish fails from now on. Failed unpublishes are not recorded.
    pub fn fail_unpublish(&self) {
        self.0.borrow_mut().fail_unpublish = true;
    }

    /// Hold camera creation until the returned gate is notified.
    pub fn gate_camera(&self) -> Rc<Notify> {
        let gate = Rc::new(Notify::new());
        self.0.borrow_mut().camera_gate = Some(gate.clone());
        gate
    }

    /// Hold publishing until the returned gate is notified.
    pub fn gate_publish(&self) -> Rc<Notify> {
        let gate = Rc::new(Notify::new());
        self.0.borrow_mut().publish_gate = Some(gate.clone());
        gate
    }
}

pub struct FakeSession {
    stage: Stage,
    local: ParticipantSnapshot<FakeTrack>,
    remotes: Vec<ParticipantSnapshot<FakeTrack>>,
    dominant: Option<String>,
    log: SessionLog,
}

impl Session for FakeSession {
    type Track = FakeTrack;

    fn local_participant(&self) -> ParticipantSnapshot<FakeTrack> {
        self.local.clone()
    }

    fn participants(&self) -> Vec<ParticipantSnapshot<FakeTrack>> {
        self.remotes.clone()
    }

    fn dominant_speaker(&self) -> Option<String> {
        self.dominant.clone()
    }

    async fn create_camera_track(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<FakeTrack, ProviderError> {
        let gate = self.log.0.borrow().camera_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.log.0.borrow_mut();
        if std::mem::take(&mut state.fail_next_camera) {
            return Err(ProviderError::Capture("NotReadableError: camera in use".into()));
        }
        let sid = format!("local-camera-{}", state.cameras_created.len() + 1);
        state.cameras_created.push(sid.clone());
        Ok(self.stage.video(&sid))
    }

    async fn publish_track(&self, track: &FakeTrack) -> Result<(), ProviderError> {
        let gate = self.log.0.borrow().publish_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.log.0.borrow_mut();
        if std::mem::take(&mut state.fail_next_publish) {
            return Err(ProviderError::Publish("signalling channel closed".into()));
        }
        state.published.push(track.sid());
        Ok(())
    }

    async fn unpublish_track(&self, track: &FakeTrack) -> Result<(), ProviderError> {
        let mut state = self.log.0.borrow_mut();
        if state.fail_unpublish {
            return Err(ProviderError::Unpublish("signalling channel closed".into()));
        }
        state.unpublished.push(track.sid());
        Ok(())
    }

    async fn disconnect(&self) {
        self.log.0.borrow_mut().disconnects += 1;
    }
}

pub struct FakeConnector {
    session: RefCell<Option<FakeSession>>,
    events: RefCell<Option<SessionEvents<FakeTrack>>>,
    refuse: Option<String>,
}

impl FakeConnector {
    pub fn new(
        stage: &Stage,
        local: ParticipantSnapshot<FakeTrack>,
        remotes: Vec<ParticipantSnapshot<FakeTrack>>,
        dominant: Option<&str>,
    ) -> (Self, mpsc::UnboundedSender<SessionEvent<FakeTrack>>, SessionLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = SessionLog::default();
        let session = FakeSession {
            stage: stage.clone(),
            local,
            remotes,
            dominant: dominant.map(str::to_string),
            log: log.clone(),
        };
        let connector = Self {
            session: RefCell::new(Some(session)),
            events: RefCell::new(Some(rx)),
            refuse: None,
        };
        (connector, tx, log)
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            session: RefCell::new(None),
            events: RefCell::new(None),
            refuse: Some(reason.to_string()),
        }
    }
}

impl SessionConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(
        &self,
        _credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<(FakeSession, SessionEvents<FakeTrack>), ProviderError> {
        if let Some(reason) = &self.refuse {
            return Err(ProviderError::Connect(reason.clone()));
        }
        let session = self.session.borrow_mut().take();
        let events = self.events.borrow_mut().take();
        match (session, events) {
            (Some(session), Some(events)) => {
                session.log.0.borrow_mut().options = Some(options.clone());
                Ok((session, events))
            }
            _ => Err(ProviderError::Connect("fake session already used".into())),
        }
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        url: "wss://media.test".to_string(),
        token: "token".to_string(),
    }
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<HuddleEvent>>>);

impl EventLog {
    pub fn events(&self) -> Vec<HuddleEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl HuddleEventListener for EventLog {
    fn on_event(&self, event: HuddleEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Let the session loop drain whatever is queued.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
