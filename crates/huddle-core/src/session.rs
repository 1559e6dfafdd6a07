//! Session lifecycle: join, event loop, capture lifecycle and teardown.
//!
//! A [`SessionClient`] owns the connector and the surface host. Each call to
//! [`SessionClient::join_session`] runs one session to completion on the
//! calling task; UI input reaches it through a [`SessionHandle`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use crate::bindings::TrackBindingManager;
use crate::capture::{CaptureLifecycle, CaptureOutcome, CaptureState};
use crate::errors::HuddleError;
use crate::events::{ConnectionState, EventEmitter, HuddleEvent, HuddleEventListener};
use crate::options::{JoinConfig, RuntimeContext, VideoConstraints};
use crate::participants::ParticipantRegistry;
use crate::provider::{
    Credentials, Highlight, MediaTrack, ParticipantSnapshot, Session, SessionConnector,
    SessionEvent, SessionEvents, SurfaceHost, TrackKind,
};
use crate::speaker::{ActiveSpeakerSelector, Selection};

/// How long teardown waits for an in-flight camera reacquisition to settle.
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side input for a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SelectParticipant(String),
    Leave,
    AppBackgrounded,
    AppForegrounded,
}

/// Cloneable sender for [`SessionCommand`]s.
///
/// Commands sent while no session is running are discarded when the next
/// session starts.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// The user clicked a participant's thumbnail.
    pub fn select_participant(&self, participant_sid: impl Into<String>) {
        self.send(SessionCommand::SelectParticipant(participant_sid.into()));
    }

    pub fn leave(&self) {
        self.send(SessionCommand::Leave);
    }

    pub fn app_backgrounded(&self) {
        self.send(SessionCommand::AppBackgrounded);
    }

    pub fn app_foregrounded(&self) {
        self.send(SessionCommand::AppForegrounded);
    }

    fn send(&self, command: SessionCommand) {
        if let Err(e) = self.commands.send(command) {
            tracing::debug!(command = ?e.0, "session client dropped, command ignored");
        }
    }
}

/// Entry point for UI shells.
///
/// The future returned by [`join_session`](Self::join_session) is not
/// `Send`; drive it on the current thread or inside a `LocalSet`.
pub struct SessionClient<C, H> {
    connector: C,
    host: H,
    emitter: EventEmitter,
    connection_state: std::sync::Mutex<ConnectionState>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: Mutex<mpsc::UnboundedReceiver<SessionCommand>>,
}

impl<C: SessionConnector, H: SurfaceHost> SessionClient<C, H> {
    pub fn new(connector: C, host: H) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            host,
            emitter: EventEmitter::new(),
            connection_state: std::sync::Mutex::new(ConnectionState::Disconnected),
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
        }
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connect and run the session until it ends.
    ///
    /// Resolves `Ok(())` after a graceful leave and `Err` with the
    /// terminating error otherwise. Teardown has completed either way.
    pub async fn join_session(
        &self,
        credentials: &Credentials,
        config: &JoinConfig,
    ) -> Result<(), HuddleError> {
        let mut commands = self
            .commands_rx
            .try_lock()
            .map_err(|_| HuddleError::AlreadyJoined)?;
        while let Ok(stale) = commands.try_recv() {
            tracing::debug!(command = ?stale, "discarding command queued before join");
        }

        self.set_connection_state(ConnectionState::Connecting);
        let options = config.connect_options();
        tracing::info!(room = %options.room_name, runtime = ?config.runtime, "joining session");

        let (session, events) = match self.connector.connect(credentials, &options).await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!("failed to connect: {e}");
                self.set_connection_state(ConnectionState::Disconnected);
                return Err(HuddleError::Connection(e.to_string()));
            }
        };

        self.set_connection_state(ConnectionState::Connected);
        let mut controller = SessionController::new(&session, &self.host, &self.emitter, config);
        let result = controller.run(events, &mut commands).await;
        controller.teardown().await;
        self.set_connection_state(ConnectionState::Disconnected);

        match &result {
            Ok(()) => tracing::info!("session ended"),
            Err(e) => tracing::warn!("session ended abnormally: {e}"),
        }
        result
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *self
            .connection_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state.clone();
        self.emitter.emit(HuddleEvent::ConnectionStateChanged(state));
    }
}

type Reacquisition<'a, T> = LocalBoxFuture<'a, (u64, Result<T, HuddleError>)>;

/// Cameras created by a reacquisition that has not settled yet, by epoch.
type OpenedCameras<T> = Rc<RefCell<HashMap<u64, T>>>;

/// Per-session view state. Lives for exactly one `join_session` call.
struct SessionController<'a, S: Session, H> {
    session: &'a S,
    host: &'a H,
    emitter: &'a EventEmitter,
    runtime: RuntimeContext,
    local_sid: String,
    registry: ParticipantRegistry<S::Track>,
    bindings: TrackBindingManager<S::Track>,
    selector: ActiveSpeakerSelector,
    capture: CaptureLifecycle<S::Track>,
    reacquiring: FuturesUnordered<Reacquisition<'a, S::Track>>,
    opened: OpenedCameras<S::Track>,
}

impl<'a, S: Session, H: SurfaceHost> SessionController<'a, S, H> {
    fn new(session: &'a S, host: &'a H, emitter: &'a EventEmitter, config: &JoinConfig) -> Self {
        let local = session.local_participant();
        let camera = local
            .publications
            .iter()
            .filter(|p| p.kind == TrackKind::Video)
            .find_map(|p| p.track.clone());

        let mut controller = Self {
            session,
            host,
            emitter,
            runtime: config.runtime,
            local_sid: local.info.sid.clone(),
            registry: ParticipantRegistry::new(),
            bindings: TrackBindingManager::new(host.primary()),
            selector: ActiveSpeakerSelector::new(&local.info.sid),
            capture: CaptureLifecycle::new(camera, config.video.clone()),
            reacquiring: FuturesUnordered::new(),
            opened: Rc::new(RefCell::new(HashMap::new())),
        };
        controller.populate(local);
        controller
    }

    /// Register the local participant, then everyone already present, and
    /// put the local participant on the primary surface.
    fn populate(&mut self, local: ParticipantSnapshot<S::Track>) {
        self.add_participant(local, true);
        for remote in self.session.participants() {
            if remote.info.sid == self.local_sid || self.registry.contains(&remote.info.sid) {
                continue;
            }
            self.add_participant(remote, false);
        }

        let local_sid = self.local_sid.clone();
        self.bindings.retarget(self.host, None, &local_sid);
        self.mark_active(None, &local_sid, false);
        self.emitter.emit(HuddleEvent::ActiveParticipantChanged {
            participant_sid: local_sid,
            pinned: false,
        });

        if let Some(speaker) = self.session.dominant_speaker() {
            self.on_dominant_speaker(Some(speaker));
        }
        tracing::info!(participants = self.registry.len(), "session view ready");
    }

    async fn run(
        &mut self,
        mut events: SessionEvents<S::Track>,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), HuddleError> {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(HuddleError::Disconnected("session event stream closed".into()));
                    };
                    if let ControlFlow::Break(result) = self.handle_event(event) {
                        return result;
                    }
                }
                Some((epoch, result)) = self.reacquiring.next(), if !self.reacquiring.is_empty() => {
                    self.on_capture_settled(epoch, result).await;
                }
                Some(command) = commands.recv() => {
                    if let ControlFlow::Break(result) = self.handle_command(command).await {
                        return result;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent<S::Track>) -> ControlFlow<Result<(), HuddleError>> {
        match event {
            SessionEvent::ParticipantConnected(snapshot) => {
                if self.registry.contains(&snapshot.info.sid) {
                    tracing::debug!(participant_sid = %snapshot.info.sid, "participant already known");
                } else {
                    self.add_participant(snapshot, false);
                }
            }
            SessionEvent::ParticipantDisconnected { participant_sid } => {
                self.remove_participant(&participant_sid);
            }
            SessionEvent::DominantSpeakerChanged { participant_sid } => {
                self.on_dominant_speaker(participant_sid);
            }
            SessionEvent::TrackPublished {
                participant_sid,
                publication,
            } => {
                if !self.is_known(&participant_sid, "track published") {
                    return ControlFlow::Continue(());
                }
                match self.registry.publication_published(
                    &participant_sid,
                    &publication.sid,
                    publication.kind,
                    publication.track.clone(),
                ) {
                    Ok(thumbnail) => {
                        if let Some(track) = &publication.track {
                            self.bindings.attach(self.host, track, &participant_sid, thumbnail);
                        }
                    }
                    Err(e) => invariant_violated(e),
                }
            }
            SessionEvent::TrackSubscribed {
                participant_sid,
                publication_sid,
                track,
            } => {
                if !self.is_known(&participant_sid, "track subscribed") {
                    return ControlFlow::Continue(());
                }
                match self
                    .registry
                    .publication_subscribed(&participant_sid, &publication_sid, track.clone())
                {
                    Ok(thumbnail) => {
                        self.bindings.attach(self.host, &track, &participant_sid, thumbnail);
                    }
                    Err(e) => invariant_violated(e),
                }
            }
            SessionEvent::TrackUnsubscribed {
                participant_sid,
                publication_sid,
                track,
            } => {
                self.bindings.detach(self.host, &track, &participant_sid);
                if self.is_known(&participant_sid, "track unsubscribed") {
                    if let Err(e) = self
                        .registry
                        .publication_unsubscribed(&participant_sid, &publication_sid)
                    {
                        invariant_violated(e);
                    }
                }
            }
            SessionEvent::Disconnected { error } => {
                return ControlFlow::Break(match error {
                    None => Ok(()),
                    Some(reason) => Err(HuddleError::Disconnected(reason)),
                });
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<Result<(), HuddleError>> {
        match command {
            SessionCommand::SelectParticipant(participant_sid) => {
                if self.is_known(&participant_sid, "participant selected") {
                    let selection = self.selector.on_user_select(&participant_sid);
                    self.apply_selection(selection);
                }
            }
            SessionCommand::Leave => {
                tracing::info!("leaving session");
                self.session.disconnect().await;
                return ControlFlow::Break(Ok(()));
            }
            SessionCommand::AppBackgrounded => self.release_capture().await,
            SessionCommand::AppForegrounded => self.reacquire_capture(),
        }
        ControlFlow::Continue(())
    }

    fn add_participant(&mut self, snapshot: ParticipantSnapshot<S::Track>, is_local: bool) {
        let participant_sid = snapshot.info.sid.clone();
        let thumbnail = match self.registry.register(self.host, snapshot.info.clone(), is_local) {
            Ok(thumbnail) => thumbnail,
            Err(e) => return invariant_violated(e),
        };

        for publication in snapshot.publications {
            if let Err(e) = self.registry.publication_published(
                &participant_sid,
                &publication.sid,
                publication.kind,
                publication.track.clone(),
            ) {
                invariant_violated(e);
                continue;
            }
            if let Some(track) = &publication.track {
                self.bindings.attach(self.host, track, &participant_sid, thumbnail);
            }
        }

        tracing::info!(participant_sid = %participant_sid, identity = %snapshot.info.identity, is_local, "participant joined");
        if !is_local {
            self.emitter.emit(HuddleEvent::ParticipantJoined(snapshot.info));
        }
    }

    /// Move the primary away from a departing participant, then drop its
    /// bindings and thumbnail.
    fn remove_participant(&mut self, participant_sid: &str) {
        if !self.is_known(participant_sid, "participant disconnected") {
            return;
        }
        if let Some(selection) = self.selector.on_participant_left(participant_sid) {
            self.apply_selection(selection);
        }
        match self.registry.unregister(self.host, &mut self.bindings, participant_sid) {
            Ok(_) => {
                tracing::info!(participant_sid, "participant left");
                self.emitter
                    .emit(HuddleEvent::ParticipantLeft(participant_sid.to_string()));
            }
            Err(e) => invariant_violated(e),
        }
    }

    fn on_dominant_speaker(&mut self, speaker: Option<String>) {
        if let Some(sid) = &speaker {
            if !self.is_known(sid, "dominant speaker changed") {
                return;
            }
        }
        if let Some(selection) = self.selector.on_dominant_speaker_changed(speaker) {
            self.apply_selection(selection);
        }
    }

    fn apply_selection(&mut self, selection: Selection) {
        for (participant_sid, priority) in &selection.priorities {
            // Our own video is not subscribed, so there is nothing to prioritize.
            if *participant_sid == self.local_sid {
                continue;
            }
            self.bindings.set_priority(participant_sid, *priority);
        }

        self.bindings
            .retarget(self.host, Some(selection.previous.as_str()), &selection.current);
        self.mark_active(Some(selection.previous.as_str()), &selection.current, selection.pinned);

        tracing::debug!(
            previous = %selection.previous,
            active = %selection.current,
            pinned = selection.pinned,
            "active participant updated"
        );
        self.emitter.emit(HuddleEvent::ActiveParticipantChanged {
            participant_sid: selection.current,
            pinned: selection.pinned,
        });
    }

    fn mark_active(&self, previous: Option<&str>, current: &str, pinned: bool) {
        if let Some(previous) = previous.filter(|p| *p != current) {
            if let Ok(participant) = self.registry.get(previous) {
                self.host.set_highlight(participant.thumbnail(), Highlight::default());
            }
        }
        match self.registry.get(current) {
            Ok(participant) => {
                self.host.set_highlight(
                    participant.thumbnail(),
                    Highlight {
                        active: true,
                        pinned,
                    },
                );
                self.host.set_primary_identity(participant.identity());
            }
            Err(_) => self.host.set_primary_identity(""),
        }
    }

    /// Capturing → Released. Mobile only.
    async fn release_capture(&mut self) {
        if !self.runtime.is_mobile() {
            tracing::debug!("app backgrounded on desktop, camera kept");
            return;
        }
        let was_capturing = self.capture.state() == CaptureState::Capturing;
        let Some(track) = self.capture.release() else {
            tracing::debug!("app backgrounded, camera already released");
            return;
        };

        if let Err(e) = track.stop() {
            tracing::warn!("failed to stop camera track: {e}");
        }
        self.bindings.detach(self.host, &track, &self.local_sid);
        self.registry.remove_track(&self.local_sid, &track.sid());
        if let Err(e) = self.session.unpublish_track(&track).await {
            tracing::warn!("failed to unpublish camera track: {e}");
        }

        tracing::info!(track_sid = %track.sid(), "camera released");
        if was_capturing {
            self.emitter
                .emit(HuddleEvent::CaptureStateChanged(CaptureState::Released));
        }
    }

    /// Start Released → Capturing. Mobile only; completes through
    /// [`on_capture_settled`](Self::on_capture_settled).
    fn reacquire_capture(&mut self) {
        if !self.runtime.is_mobile() {
            return;
        }
        let Some(epoch) = self.capture.begin_reacquire() else {
            tracing::debug!(state = ?self.capture.state(), "app foregrounded, nothing to reacquire");
            return;
        };

        tracing::info!(epoch, "reacquiring camera");
        let session = self.session;
        let constraints = self.capture.constraints().clone();
        let opened = self.opened.clone();
        self.reacquiring.push(
            async move {
                let result = open_camera(session, &constraints, epoch, &opened).await;
                opened.borrow_mut().remove(&epoch);
                (epoch, result)
            }
            .boxed_local(),
        );
    }

    async fn on_capture_settled(&mut self, epoch: u64, result: Result<S::Track, HuddleError>) {
        match self.capture.complete(epoch, result) {
            CaptureOutcome::Acquired(track) => {
                let track_sid = track.sid();
                match self.registry.publication_published(
                    &self.local_sid,
                    &track_sid,
                    TrackKind::Video,
                    Some(track.clone()),
                ) {
                    Ok(thumbnail) => {
                        self.bindings.attach(self.host, &track, &self.local_sid, thumbnail);
                    }
                    Err(e) => invariant_violated(e),
                }
                tracing::info!(track_sid = %track_sid, "camera reacquired");
                self.emitter
                    .emit(HuddleEvent::CaptureStateChanged(CaptureState::Capturing));
            }
            CaptureOutcome::Failed(e) => {
                tracing::warn!("camera reacquisition failed: {e}");
                self.emitter.emit(HuddleEvent::CaptureFailed(e.to_string()));
            }
            CaptureOutcome::Stale(track) => {
                tracing::debug!(epoch, "discarding stale camera reacquisition");
                if let Some(track) = track {
                    self.discard(&track).await;
                }
            }
        }
    }

    async fn discard(&self, track: &S::Track) {
        if let Err(e) = track.stop() {
            tracing::warn!(track_sid = %track.sid(), "failed to stop track: {e}");
        }
        if let Err(e) = self.session.unpublish_track(track).await {
            tracing::warn!(track_sid = %track.sid(), "failed to unpublish track: {e}");
        }
    }

    /// Release everything the session holds. Safe on partial state.
    async fn teardown(&mut self) {
        let mut local_tracks: Vec<S::Track> = self
            .registry
            .get(&self.local_sid)
            .map(|local| local.active_tracks().cloned().collect())
            .unwrap_or_default();
        if let Some(camera) = self.capture.shutdown() {
            if !local_tracks.iter().any(|t| t.sid() == camera.sid()) {
                local_tracks.push(camera);
            }
        }
        for track in &local_tracks {
            if let Err(e) = track.stop() {
                tracing::warn!(track_sid = %track.sid(), "failed to stop local track: {e}");
            }
        }

        while !self.reacquiring.is_empty() {
            match tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, self.reacquiring.next()).await {
                Ok(Some((epoch, result))) => self.on_capture_settled(epoch, result).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("camera reacquisition still pending at teardown, abandoning it");
                    self.reacquiring = FuturesUnordered::new();
                    let abandoned: Vec<S::Track> =
                        self.opened.borrow_mut().drain().map(|(_, track)| track).collect();
                    for track in &abandoned {
                        self.discard(track).await;
                    }
                }
            }
        }

        self.bindings.clear_primary(self.host);
        self.host.set_primary_identity("");

        for participant_sid in self.registry.sids() {
            match self
                .registry
                .unregister(self.host, &mut self.bindings, &participant_sid)
            {
                Ok(participant) if !participant.is_local() => {
                    self.emitter.emit(HuddleEvent::ParticipantLeft(participant_sid));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("teardown: {e}"),
            }
        }
        tracing::debug!(remaining_bindings = self.bindings.len(), "session torn down");
    }

    /// Events for participants we never registered (or already removed)
    /// are stale and dropped.
    fn is_known(&self, participant_sid: &str, what: &str) -> bool {
        let known = self.registry.contains(participant_sid);
        if !known {
            tracing::debug!(participant_sid, what, "ignoring event for unknown participant");
        }
        known
    }
}

/// Create and publish a camera. The track is visible in `opened` while
/// it is being published so teardown can close it if it gives up waiting.
async fn open_camera<S: Session>(
    session: &S,
    constraints: &VideoConstraints,
    epoch: u64,
    opened: &OpenedCameras<S::Track>,
) -> Result<S::Track, HuddleError> {
    let track = session
        .create_camera_track(constraints)
        .await
        .map_err(|e| HuddleError::CaptureDevice(e.to_string()))?;
    opened.borrow_mut().insert(epoch, track.clone());
    if let Err(e) = session.publish_track(&track).await {
        if let Err(stop) = track.stop() {
            tracing::warn!("failed to stop unpublished camera track: {stop}");
        }
        return Err(HuddleError::CaptureDevice(e.to_string()));
    }
    Ok(track)
}

fn invariant_violated(err: HuddleError) {
    tracing::error!("view state out of sync with the session: {err}");
    debug_assert!(!err.is_invariant_violation(), "{err}");
}
