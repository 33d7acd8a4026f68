use std::time::{Duration, Instant};

/// Frame interval assumed when the source does not report a frame rate.
pub const DEFAULT_FRAME_INTERVAL_MS: i64 = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    Render,
    /// Too early; sleep this long and ask again.
    Wait(Duration),
    /// Too late; release without rendering.
    Drop,
}

/// Decides what to do with a decoded video frame given its skew, i.e. wall
/// clock time since the anchor minus the frame's presentation time.
pub trait PacingPolicy: Send + Sync {
    fn decide(&self, skew_ms: i64, frame_interval_ms: i64) -> PaceDecision;
}

/// Sleep-if-early, drop-if-late with a one frame tolerance either way.
#[derive(Debug, Clone)]
pub struct DefaultPacing {
    step: Duration,
}

impl DefaultPacing {
    pub fn new(step: Duration) -> Self {
        Self { step }
    }
}

impl PacingPolicy for DefaultPacing {
    fn decide(&self, skew_ms: i64, frame_interval_ms: i64) -> PaceDecision {
        let interval = if frame_interval_ms > 0 {
            frame_interval_ms
        } else {
            DEFAULT_FRAME_INTERVAL_MS
        };
        if skew_ms < -interval {
            let early = Duration::from_millis((-interval - skew_ms) as u64);
            PaceDecision::Wait(early.min(self.step).max(Duration::from_millis(1)))
        } else if skew_ms > interval {
            PaceDecision::Drop
        } else {
            PaceDecision::Render
        }
    }
}

/// Wall clock anchor of a playback pass. Re-anchors on the first frame, on a
/// loop wrap (pts going backwards) and after [`PlaybackClock::reset`].
#[derive(Debug, Default)]
pub struct PlaybackClock {
    anchor: Option<Instant>,
    last_pts_us: Option<i64>,
    wraps: u32,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skew_ms(&mut self, pts_us: i64, now: Instant) -> i64 {
        if let Some(last) = self.last_pts_us {
            if pts_us < last {
                self.wraps += 1;
                self.anchor = None;
            }
        }
        self.last_pts_us = Some(pts_us);
        let anchor = *self
            .anchor
            .get_or_insert_with(|| {
                now.checked_sub(Duration::from_micros(pts_us.max(0) as u64))
                    .unwrap_or(now)
            });
        now.saturating_duration_since(anchor).as_millis() as i64 - pts_us / 1000
    }

    /// Forgets the anchor; the next frame becomes due immediately. Used after
    /// pause and seek.
    pub fn reset(&mut self) {
        self.anchor = None;
        self.last_pts_us = None;
    }

    /// Number of loop wraps observed.
    pub fn wraps(&self) -> u32 {
        self.wraps
    }
}

/// `position / duration` as a percentage capped at 100 and truncated to two
/// decimals.
pub fn percent(position_us: i64, duration_us: i64) -> f32 {
    if duration_us <= 0 {
        return 0.0;
    }
    let ratio = (position_us.max(0) as f64 / duration_us as f64).min(1.0);
    ((ratio * 100.0 * 100.0).trunc() / 100.0) as f32
}

/// Lets a value through at most once per interval; 100 always passes.
#[derive(Debug)]
pub struct FrequencyThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl FrequencyThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, value: f32, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due || value >= 100.0 {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Non-decreasing progress that is emitted on a change of at least `step`
/// points, and exactly once at 100.
#[derive(Debug)]
pub struct StepThrottle {
    step: f32,
    last: f32,
    finished: bool,
}

impl StepThrottle {
    pub fn new(step: f32) -> Self {
        Self {
            step,
            last: 0.0,
            finished: false,
        }
    }

    pub fn offer(&mut self, value: f32) -> Option<f32> {
        if self.finished || value <= self.last {
            return None;
        }
        if value >= 100.0 {
            self.finished = true;
            self.last = 100.0;
            return Some(100.0);
        }
        if value - self.last >= self.step {
            self.last = value;
            return Some(value);
        }
        None
    }

    pub fn finish(&mut self) -> Option<f32> {
        self.offer(100.0)
    }

    pub fn last(&self) -> f32 {
        self.last
    }
}
