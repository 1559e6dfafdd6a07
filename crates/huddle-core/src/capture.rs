use crate::errors::HuddleError;
use crate::options::VideoConstraints;

/// Whether the local camera is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Capturing,
    Released,
}

/// Result of settling an in-flight reacquisition.
#[derive(Debug)]
pub enum CaptureOutcome<T> {
    Acquired(T),
    Failed(HuddleError),
    /// Superseded by a later transition. A track that was nevertheless
    /// created must be released by the caller.
    Stale(Option<T>),
}

/// Local camera lifecycle across app backgrounding.
///
/// Every release bumps an epoch. A reacquisition started under an older
/// epoch is stale when it completes and must not change state. Only a
/// camera that a release actually took is brought back; a session that
/// joined without one stays without one.
#[derive(Debug)]
pub struct CaptureLifecycle<T> {
    state: CaptureState,
    track: Option<T>,
    constraints: VideoConstraints,
    epoch: u64,
    in_flight: Option<u64>,
    resumable: bool,
}

impl<T: Clone> CaptureLifecycle<T> {
    pub fn new(track: Option<T>, constraints: VideoConstraints) -> Self {
        let state = if track.is_some() {
            CaptureState::Capturing
        } else {
            CaptureState::Released
        };
        Self {
            state,
            track,
            constraints,
            epoch: 0,
            in_flight: None,
            resumable: false,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn track(&self) -> Option<&T> {
        self.track.as_ref()
    }

    pub fn constraints(&self) -> &VideoConstraints {
        &self.constraints
    }

    #[cfg(test)]
    pub(crate) fn is_reacquiring(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Capturing → Released. Returns the track to stop and unpublish.
    pub fn release(&mut self) -> Option<T> {
        self.epoch += 1;
        self.in_flight = None;
        self.state = CaptureState::Released;
        let track = self.track.take();
        if track.is_some() {
            self.resumable = true;
        }
        track
    }

    /// Start Released → Capturing. Returns the epoch to hand back to
    /// [`complete`](Self::complete), or `None` if there is nothing to do.
    pub fn begin_reacquire(&mut self) -> Option<u64> {
        if self.state == CaptureState::Capturing || !self.resumable || self.in_flight.is_some() {
            return None;
        }
        self.in_flight = Some(self.epoch);
        Some(self.epoch)
    }

    pub fn complete(&mut self, epoch: u64, result: Result<T, HuddleError>) -> CaptureOutcome<T> {
        if self.in_flight != Some(epoch) {
            return CaptureOutcome::Stale(result.ok());
        }
        self.in_flight = None;
        match result {
            Ok(track) => {
                self.state = CaptureState::Capturing;
                self.track = Some(track.clone());
                CaptureOutcome::Acquired(track)
            }
            Err(e) => CaptureOutcome::Failed(e),
        }
    }

    /// Final release on teardown; invalidates anything in flight.
    pub fn shutdown(&mut self) -> Option<T> {
        let track = self.release();
        self.resumable = false;
        track
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capturing() -> CaptureLifecycle<&'static str> {
        CaptureLifecycle::new(Some("cam-1"), VideoConstraints::default())
    }

    #[test]
    fn initial_state_follows_local_track() {
        assert_eq!(capturing().state(), CaptureState::Capturing);
        let none: CaptureLifecycle<&str> = CaptureLifecycle::new(None, VideoConstraints::default());
        assert_eq!(none.state(), CaptureState::Released);
    }

    #[test]
    fn background_then_foreground_reacquires() {
        let mut c = capturing();
        assert_eq!(c.release(), Some("cam-1"));
        assert_eq!(c.state(), CaptureState::Released);

        let epoch = c.begin_reacquire().unwrap();
        assert!(c.is_reacquiring());
        assert!(c.begin_reacquire().is_none(), "one reacquisition at a time");

        assert!(matches!(c.complete(epoch, Ok("cam-2")), CaptureOutcome::Acquired("cam-2")));
        assert_eq!(c.state(), CaptureState::Capturing);
        assert_eq!(c.track(), Some(&"cam-2"));
    }

    #[test]
    fn foreground_without_a_released_camera_is_ignored() {
        let mut c: CaptureLifecycle<&str> = CaptureLifecycle::new(None, VideoConstraints::default());
        assert!(c.begin_reacquire().is_none());
        assert_eq!(c.release(), None);
        assert!(c.begin_reacquire().is_none());
    }

    #[test]
    fn background_during_reacquisition_still_resumes_later() {
        let mut c = capturing();
        c.release();
        c.begin_reacquire().unwrap();
        assert_eq!(c.release(), None);
        assert!(c.begin_reacquire().is_some());
    }

    #[test]
    fn foreground_while_capturing_is_ignored() {
        let mut c = capturing();
        assert!(c.begin_reacquire().is_none());
    }

    #[test]
    fn failure_stays_released_and_allows_retry() {
        let mut c = capturing();
        c.release();
        let epoch = c.begin_reacquire().unwrap();

        let outcome = c.complete(epoch, Err(HuddleError::CaptureDevice("busy".into())));
        assert!(matches!(outcome, CaptureOutcome::Failed(HuddleError::CaptureDevice(_))));
        assert_eq!(c.state(), CaptureState::Released);
        assert!(!c.is_reacquiring());
        assert!(c.begin_reacquire().is_some());
    }

    #[test]
    fn completion_after_another_background_is_stale() {
        let mut c = capturing();
        c.release();
        let epoch = c.begin_reacquire().unwrap();
        assert_eq!(c.release(), None);

        assert!(matches!(c.complete(epoch, Ok("cam-2")), CaptureOutcome::Stale(Some("cam-2"))));
        assert_eq!(c.state(), CaptureState::Released);
        assert!(c.track().is_none());
    }

    #[test]
    fn shutdown_invalidates_in_flight_work() {
        let mut c = capturing();
        c.release();
        let epoch = c.begin_reacquire().unwrap();
        c.shutdown();

        assert!(matches!(c.complete(epoch, Err(HuddleError::CaptureDevice("x".into()))), CaptureOutcome::Stale(None)));
        assert!(c.begin_reacquire().is_none());
    }
}
