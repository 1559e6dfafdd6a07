use std::sync::{Arc, PoisonError, RwLock};

use crate::capture::CaptureState;
use crate::provider::ParticipantInfo;

/// Notifications emitted by the core to UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
    ConnectionStateChanged(ConnectionState),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(String), // participant SID
    ActiveParticipantChanged {
        participant_sid: String,
        pinned: bool,
    },
    CaptureStateChanged(CaptureState),
    /// Camera reacquisition failed; local video stays off until the next foreground.
    CaptureFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Trait for receiving events from the core.
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

/// Dispatches events to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn HuddleEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: HuddleEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
