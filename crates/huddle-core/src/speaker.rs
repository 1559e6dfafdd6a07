use crate::provider::TrackPriority;

/// Who owns the primary viewport, and whether the user pinned them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSpeakerState {
    pub active_participant_sid: String,
    pub is_pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Unpinned,
    Pinned,
}

/// A decision for the binding layer to realize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub previous: String,
    pub current: String,
    pub pinned: bool,
    /// Priority hints to forward, in order.
    pub priorities: Vec<(String, Option<TrackPriority>)>,
}

impl Selection {
    #[cfg(test)]
    pub(crate) fn active_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Picks the active participant from the dominant-speaker signal and
/// user pins.
///
/// While pinned, dominant-speaker changes are remembered but never move
/// the active participant. Unpinned, the active participant is the last
/// dominant speaker, or the local participant when there is none.
#[derive(Debug)]
pub struct ActiveSpeakerSelector {
    local_sid: String,
    dominant_speaker: Option<String>,
    state: ActiveSpeakerState,
}

impl ActiveSpeakerSelector {
    pub fn new(local_sid: impl Into<String>) -> Self {
        let local_sid = local_sid.into();
        Self {
            state: ActiveSpeakerState {
                active_participant_sid: local_sid.clone(),
                is_pinned: false,
            },
            local_sid,
            dominant_speaker: None,
        }
    }

    pub fn state(&self) -> &ActiveSpeakerState {
        &self.state
    }

    pub fn active(&self) -> &str {
        &self.state.active_participant_sid
    }

    pub fn mode(&self) -> SelectionMode {
        if self.state.is_pinned {
            SelectionMode::Pinned
        } else {
            SelectionMode::Unpinned
        }
    }

    pub fn dominant_speaker(&self) -> Option<&str> {
        self.dominant_speaker.as_deref()
    }

    /// Returns a selection only when the active participant moved.
    pub fn on_dominant_speaker_changed(&mut self, speaker: Option<String>) -> Option<Selection> {
        self.dominant_speaker = speaker;
        if self.state.is_pinned {
            tracing::debug!(dominant = ?self.dominant_speaker, "dominant speaker ignored while pinned");
            return None;
        }
        let next = self.fallback();
        self.move_to(next)
    }

    /// Pin `participant_sid`, or unpin if it is already the pinned one.
    pub fn on_user_select(&mut self, participant_sid: &str) -> Selection {
        let previous = self.state.active_participant_sid.clone();

        if self.state.is_pinned && previous == participant_sid {
            self.state.is_pinned = false;
            let current = self.fallback();
            self.state.active_participant_sid = current.clone();
            tracing::info!(unpinned = participant_sid, active = %current, "participant unpinned");
            return Selection {
                previous,
                current,
                pinned: false,
                priorities: vec![(participant_sid.to_string(), None)],
            };
        }

        let mut priorities = Vec::with_capacity(2);
        if self.state.is_pinned {
            priorities.push((previous.clone(), None));
        }
        priorities.push((participant_sid.to_string(), Some(TrackPriority::High)));

        self.state = ActiveSpeakerState {
            active_participant_sid: participant_sid.to_string(),
            is_pinned: true,
        };
        tracing::info!(pinned = participant_sid, "participant pinned");
        Selection {
            previous,
            current: participant_sid.to_string(),
            pinned: true,
            priorities,
        }
    }

    /// Forget a departed participant. If it was active the pin is dropped
    /// and the selection falls back.
    pub fn on_participant_left(&mut self, participant_sid: &str) -> Option<Selection> {
        if self.dominant_speaker.as_deref() == Some(participant_sid) {
            self.dominant_speaker = None;
        }
        if self.state.active_participant_sid != participant_sid {
            return None;
        }
        self.state.is_pinned = false;
        let next = self.fallback();
        self.move_to(next)
    }

    fn fallback(&self) -> String {
        self.dominant_speaker
            .clone()
            .unwrap_or_else(|| self.local_sid.clone())
    }

    fn move_to(&mut self, next: String) -> Option<Selection> {
        if next == self.state.active_participant_sid {
            return None;
        }
        let previous = std::mem::replace(&mut self.state.active_participant_sid, next.clone());
        Some(Selection {
            previous,
            current: next,
            pinned: self.state.is_pinned,
            priorities: Vec::new(),
        })
    }
}
