use std::collections::HashMap;

use crate::provider::{MediaTrack, SurfaceHost, SurfaceId, TrackKind, TrackPriority};

#[derive(Debug)]
struct Binding<T> {
    track: T,
    participant_sid: String,
    thumbnail: SurfaceId,
    kind: TrackKind,
    /// Attach order; the oldest video binding of a participant feeds the primary.
    seq: u64,
}

/// Owns every (track, surface) association.
///
/// Each track is bound to exactly one thumbnail. The primary surface shows
/// at most one video track, taken from the participant that currently owns
/// it (see [`retarget`](Self::retarget)).
#[derive(Debug)]
pub struct TrackBindingManager<T> {
    primary: SurfaceId,
    bindings: HashMap<String, Binding<T>>, // track SID -> binding
    primary_owner: Option<String>,
    primary_track: Option<String>,
    next_seq: u64,
}

impl<T: MediaTrack> TrackBindingManager<T> {
    pub fn new(primary: SurfaceId) -> Self {
        Self {
            primary,
            bindings: HashMap::new(),
            primary_owner: None,
            primary_track: None,
            next_seq: 0,
        }
    }

    /// Bind `track` to `thumbnail`, and to the primary surface when
    /// `participant_sid` owns it and nothing is shown there yet.
    ///
    /// Returns `false` when the track was already bound (no-op).
    pub fn attach(
        &mut self,
        host: &impl SurfaceHost,
        track: &T,
        participant_sid: &str,
        thumbnail: SurfaceId,
    ) -> bool {
        let track_sid = track.sid();
        if let Some(existing) = self.bindings.get(&track_sid) {
            if existing.participant_sid == participant_sid && existing.thumbnail == thumbnail {
                return false;
            }
            tracing::warn!(
                track_sid = %track_sid,
                from = %existing.participant_sid,
                to = %participant_sid,
                "track moved between participants, rebinding"
            );
            let previous_owner = existing.participant_sid.clone();
            self.detach(host, track, &previous_owner);
        }

        track.attach(thumbnail);
        let kind = track.kind();
        self.bindings.insert(
            track_sid.clone(),
            Binding {
                track: track.clone(),
                participant_sid: participant_sid.to_string(),
                thumbnail,
                kind,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;

        if kind == TrackKind::Video
            && self.primary_track.is_none()
            && self.primary_owner.as_deref() == Some(participant_sid)
        {
            track.attach(self.primary);
            self.primary_track = Some(track_sid.clone());
        }

        tracing::debug!(track_sid = %track_sid, participant_sid, ?kind, "track attached");
        true
    }

    /// Reverse [`attach`](Self::attach). Detached surfaces are cleared.
    ///
    /// Returns `false` when the track was not bound (no-op).
    pub fn detach(&mut self, host: &impl SurfaceHost, track: &T, participant_sid: &str) -> bool {
        let track_sid = track.sid();
        let Some(binding) = self.bindings.remove(&track_sid) else {
            return false;
        };
        if binding.participant_sid != participant_sid {
            tracing::debug!(
                track_sid = %track_sid,
                owner = %binding.participant_sid,
                participant_sid,
                "detaching track on behalf of a different participant"
            );
        }

        binding.track.detach(binding.thumbnail);
        host.clear(binding.thumbnail, binding.kind);

        if self.primary_track.as_deref() == Some(track_sid.as_str()) {
            self.primary_track = None;
            // Hand the primary to the owner's next video before letting go of this one.
            let successor = self
                .primary_owner
                .as_deref()
                .and_then(|owner| self.first_video_of(owner));
            if let Some(next_sid) = successor {
                if let Some(next) = self.bindings.get(&next_sid) {
                    next.track.attach(self.primary);
                }
                self.primary_track = Some(next_sid);
            }
            binding.track.detach(self.primary);
            if self.primary_track.is_none() {
                host.clear(self.primary, TrackKind::Video);
            }
        }

        tracing::debug!(track_sid = %track_sid, participant_sid, "track detached");
        true
    }

    /// Move the primary surface to `to`'s video.
    ///
    /// The new source is attached before the old one is detached so the
    /// primary never goes blank in between.
    pub fn retarget(&mut self, host: &impl SurfaceHost, from: Option<&str>, to: &str) {
        if from != self.primary_owner.as_deref() {
            tracing::debug!(
                expected = ?from,
                actual = ?self.primary_owner,
                "retarget source differs from current primary owner"
            );
        }

        self.primary_owner = Some(to.to_string());
        let next = self.first_video_of(to);
        if next == self.primary_track {
            return;
        }

        if let Some(next_sid) = &next {
            if let Some(binding) = self.bindings.get(next_sid) {
                binding.track.attach(self.primary);
            }
        }
        if let Some(old_sid) = self.primary_track.take() {
            if let Some(binding) = self.bindings.get(&old_sid) {
                binding.track.detach(self.primary);
            }
        }
        if next.is_none() {
            host.clear(self.primary, TrackKind::Video);
        }
        tracing::debug!(to, track_sid = ?next, "primary surface retargeted");
        self.primary_track = next;
    }

    /// Best-effort QoS hint for every video track of a participant.
    pub fn set_priority(&self, participant_sid: &str, priority: Option<TrackPriority>) {
        for binding in self.bindings.values() {
            if binding.participant_sid != participant_sid || binding.kind != TrackKind::Video {
                continue;
            }
            if let Err(e) = binding.track.set_priority(priority) {
                tracing::warn!(participant_sid, ?priority, "set_priority ignored: {e}");
            }
        }
    }

    /// Drop every binding of a participant. Returns how many were removed.
    pub fn release_participant(&mut self, host: &impl SurfaceHost, participant_sid: &str) -> usize {
        let mut owned: Vec<(u64, T)> = self
            .bindings
            .values()
            .filter(|b| b.participant_sid == participant_sid)
            .map(|b| (b.seq, b.track.clone()))
            .collect();
        owned.sort_by_key(|(seq, _)| *seq);

        if self.primary_owner.as_deref() == Some(participant_sid) {
            self.primary_owner = None;
        }
        for (_, track) in &owned {
            self.detach(host, track, participant_sid);
        }
        owned.len()
    }

    /// Detach whatever the primary shows and forget its owner.
    pub fn clear_primary(&mut self, host: &impl SurfaceHost) {
        self.primary_owner = None;
        if let Some(sid) = self.primary_track.take() {
            if let Some(binding) = self.bindings.get(&sid) {
                binding.track.detach(self.primary);
            }
        }
        host.clear(self.primary, TrackKind::Video);
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }

    #[cfg(test)]
    pub(crate) fn primary_owner(&self) -> Option<&str> {
        self.primary_owner.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn primary_track(&self) -> Option<&str> {
        self.primary_track.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, track_sid: &str) -> bool {
        self.bindings.contains_key(track_sid)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn first_video_of(&self, participant_sid: &str) -> Option<String> {
        self.bindings
            .iter()
            .filter(|(_, b)| b.participant_sid == participant_sid && b.kind == TrackKind::Video)
            .min_by_key(|(_, b)| b.seq)
            .map(|(sid, _)| sid.clone())
    }
}
