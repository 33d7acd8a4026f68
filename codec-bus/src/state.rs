use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    NoPlay,
    Play,
    Pause,
    SeekStart,
    Seek,
    DataWait,
    Stop,
}

impl PlaybackState {
    pub fn is_seeking(&self) -> bool {
        matches!(self, PlaybackState::SeekStart | PlaybackState::Seek)
    }

    /// States in which the feeder submits input.
    pub fn feeds(&self) -> bool {
        matches!(
            self,
            PlaybackState::Play | PlaybackState::SeekStart | PlaybackState::Seek
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Target precedes the current decode position.
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub target_us: i64,
    pub direction: SeekDirection,
    /// State restored once the seek completes.
    pub saved: PlaybackState,
}

impl SeekRequest {
    pub fn target_ms(&self) -> i64 {
        self.target_us / 1000
    }
}

#[derive(Debug)]
struct Shared {
    state: PlaybackState,
    seek: Option<SeekRequest>,
}

/// Playback state shared by the public API and both pump loops. Every change
/// wakes threads blocked in [`StateCell::wait_while`].
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<Shared>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Shared {
                state: PlaybackState::NoPlay,
                seek: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> PlaybackState {
        self.lock().state
    }

    pub fn set(&self, state: PlaybackState) {
        let mut shared = self.lock();
        if shared.state != state {
            log::debug!("state {:?} -> {:?}", shared.state, state);
            shared.state = state;
        }
        if !state.is_seeking() {
            shared.seek = None;
        }
        self.changed.notify_all();
    }

    /// Moves to `to` only from `from`. Returns whether the transition happened.
    pub fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        let mut shared = self.lock();
        if shared.state != from {
            return false;
        }
        log::debug!("state {:?} -> {:?}", from, to);
        shared.state = to;
        self.changed.notify_all();
        true
    }

    /// Registers a seek unless one is already in flight. The direction is
    /// `Before` when `target_us` precedes `current_us`.
    pub fn begin_seek(&self, target_us: i64, current_us: i64) -> Option<SeekRequest> {
        let mut shared = self.lock();
        if shared.seek.is_some() || shared.state.is_seeking() {
            return None;
        }
        let direction = if target_us < current_us {
            SeekDirection::Before
        } else {
            SeekDirection::After
        };
        let request = SeekRequest {
            target_us,
            direction,
            saved: shared.state,
        };
        shared.seek = Some(request);
        shared.state = PlaybackState::SeekStart;
        self.changed.notify_all();
        Some(request)
    }

    pub fn seek_request(&self) -> Option<SeekRequest> {
        self.lock().seek
    }

    /// Changes the direction of the in-flight seek.
    pub fn redirect_seek(&self, direction: SeekDirection) {
        let mut shared = self.lock();
        if let Some(seek) = shared.seek.as_mut() {
            seek.direction = direction;
        }
    }

    /// Clears the in-flight seek and restores the pre-seek state, unless the
    /// engine was stopped meanwhile.
    pub fn finish_seek(&self) -> Option<SeekRequest> {
        let mut shared = self.lock();
        let request = shared.seek.take()?;
        if shared.state.is_seeking() {
            shared.state = request.saved;
        }
        self.changed.notify_all();
        Some(request)
    }

    /// Blocks while `pred` holds for the current state, at most `timeout`.
    /// Returns the state observed last.
    pub fn wait_while<F>(&self, timeout: Duration, mut pred: F) -> PlaybackState
    where
        F: FnMut(PlaybackState) -> bool,
    {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |shared| pred(shared.state))
            .unwrap_or_else(|e| e.into_inner());
        guard.state
    }
}
