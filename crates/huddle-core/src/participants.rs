use std::collections::HashMap;

use crate::bindings::TrackBindingManager;
use crate::errors::HuddleError;
use crate::provider::{
    MediaTrack, ParticipantInfo, SurfaceHost, SurfaceId, ThumbnailSpec, TrackKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub struct Publication<T> {
    pub sid: String,
    pub kind: TrackKind,
    pub state: SubscriptionState,
    pub track: Option<T>,
}

#[derive(Debug)]
pub struct Participant<T> {
    info: ParticipantInfo,
    is_local: bool,
    thumbnail: SurfaceId,
    publications: Vec<Publication<T>>,
}

impl<T> Participant<T> {
    pub fn sid(&self) -> &str {
        &self.info.sid
    }

    pub fn identity(&self) -> &str {
        &self.info.identity
    }

    pub fn info(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn thumbnail(&self) -> SurfaceId {
        self.thumbnail
    }

    pub fn publications(&self) -> &[Publication<T>] {
        &self.publications
    }

    pub fn publication(&self, sid: &str) -> Option<&Publication<T>> {
        self.publications.iter().find(|p| p.sid == sid)
    }

    /// Tracks of publications currently in the `Active` state.
    pub fn active_tracks(&self) -> impl Iterator<Item = &T> {
        self.publications
            .iter()
            .filter(|p| p.state == SubscriptionState::Active)
            .filter_map(|p| p.track.as_ref())
    }

    fn publication_mut(&mut self, sid: &str) -> Option<&mut Publication<T>> {
        self.publications.iter_mut().find(|p| p.sid == sid)
    }
}

/// Known participants and their thumbnail surfaces.
///
/// Every registered participant has exactly one thumbnail; it is created
/// on [`register`](Self::register) and destroyed on
/// [`unregister`](Self::unregister), never otherwise.
#[derive(Debug)]
pub struct ParticipantRegistry<T> {
    participants: HashMap<String, Participant<T>>,
    join_order: Vec<String>,
}

impl<T> Default for ParticipantRegistry<T> {
    fn default() -> Self {
        Self {
            participants: HashMap::new(),
            join_order: Vec::new(),
        }
    }
}

impl<T: MediaTrack> ParticipantRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the participant's thumbnail and start tracking it.
    ///
    /// The thumbnail exists before this returns, so track events for the
    /// participant can always find a surface.
    pub fn register(
        &mut self,
        host: &impl SurfaceHost,
        info: ParticipantInfo,
        is_local: bool,
    ) -> Result<SurfaceId, HuddleError> {
        if self.participants.contains_key(&info.sid) {
            return Err(HuddleError::DuplicateParticipant(info.sid));
        }

        let thumbnail = host.create_thumbnail(&ThumbnailSpec {
            participant_sid: info.sid.clone(),
            identity: info.identity.clone(),
            is_local,
        });
        tracing::debug!(participant_sid = %info.sid, identity = %info.identity, ?thumbnail, "participant registered");

        self.join_order.push(info.sid.clone());
        self.participants.insert(
            info.sid.clone(),
            Participant {
                info,
                is_local,
                thumbnail,
                publications: Vec::new(),
            },
        );
        Ok(thumbnail)
    }

    /// Remove the participant, releasing its bindings before its thumbnail.
    ///
    /// Callers move the primary surface away from the participant first;
    /// see `SessionController::remove_participant`.
    pub fn unregister(
        &mut self,
        host: &impl SurfaceHost,
        bindings: &mut TrackBindingManager<T>,
        participant_sid: &str,
    ) -> Result<Participant<T>, HuddleError> {
        let participant = self
            .participants
            .remove(participant_sid)
            .ok_or_else(|| HuddleError::UnknownParticipant(participant_sid.to_string()))?;
        self.join_order.retain(|sid| sid != participant_sid);

        let released = bindings.release_participant(host, participant_sid);
        host.destroy_thumbnail(participant.thumbnail);
        tracing::debug!(participant_sid, released, "participant unregistered");
        Ok(participant)
    }

    pub fn get(&self, participant_sid: &str) -> Result<&Participant<T>, HuddleError> {
        self.participants
            .get(participant_sid)
            .ok_or_else(|| HuddleError::UnknownParticipant(participant_sid.to_string()))
    }

    pub fn contains(&self, participant_sid: &str) -> bool {
        self.participants.contains_key(participant_sid)
    }

    /// Record a publication; `Active` if its track is already available.
    pub fn publication_published(
        &mut self,
        participant_sid: &str,
        publication_sid: &str,
        kind: TrackKind,
        track: Option<T>,
    ) -> Result<SurfaceId, HuddleError> {
        let participant = self.get_mut(participant_sid)?;
        let state = if track.is_some() {
            SubscriptionState::Active
        } else {
            SubscriptionState::Pending
        };
        match participant.publication_mut(publication_sid) {
            Some(existing) => {
                existing.kind = kind;
                if track.is_some() {
                    existing.state = state;
                    existing.track = track;
                }
            }
            None => participant.publications.push(Publication {
                sid: publication_sid.to_string(),
                kind,
                state,
                track,
            }),
        }
        Ok(participant.thumbnail)
    }

    /// Mark a publication `Active` with its subscribed track.
    pub fn publication_subscribed(
        &mut self,
        participant_sid: &str,
        publication_sid: &str,
        track: T,
    ) -> Result<SurfaceId, HuddleError> {
        let participant = self.get_mut(participant_sid)?;
        match participant.publication_mut(publication_sid) {
            Some(existing) => {
                existing.state = SubscriptionState::Active;
                existing.track = Some(track);
            }
            None => participant.publications.push(Publication {
                sid: publication_sid.to_string(),
                kind: track.kind(),
                state: SubscriptionState::Active,
                track: Some(track),
            }),
        }
        Ok(participant.thumbnail)
    }

    /// Mark a publication `Ended`; its track handle is dropped.
    pub fn publication_unsubscribed(
        &mut self,
        participant_sid: &str,
        publication_sid: &str,
    ) -> Result<(), HuddleError> {
        let participant = self.get_mut(participant_sid)?;
        if let Some(existing) = participant.publication_mut(publication_sid) {
            existing.state = SubscriptionState::Ended;
            existing.track = None;
        }
        Ok(())
    }

    /// Forget the publication carrying `track_sid` (local unpublish).
    pub fn remove_track(&mut self, participant_sid: &str, track_sid: &str) -> Option<Publication<T>> {
        let participant = self.participants.get_mut(participant_sid)?;
        let index = participant
            .publications
            .iter()
            .position(|p| p.track.as_ref().is_some_and(|t| t.sid() == track_sid))?;
        Some(participant.publications.remove(index))
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Registered participant SIDs in join order.
    pub fn sids(&self) -> Vec<String> {
        self.join_order.clone()
    }

    fn get_mut(&mut self, participant_sid: &str) -> Result<&mut Participant<T>, HuddleError> {
        self.participants
            .get_mut(participant_sid)
            .ok_or_else(|| HuddleError::UnknownParticipant(participant_sid.to_string()))
    }
}
