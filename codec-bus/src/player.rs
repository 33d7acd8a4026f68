//! Playback engine: one decode session driven by a feeder and a drainer
//! running on blocking threads of the injected runtime.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    demuxer::{Demuxer, SeekMode, find_track},
    error::{CodecError, Result},
    format::{MediaFormat, MediaKind, TrackInfo},
    join::CompletionJoin,
    pacing::{DefaultPacing, FrequencyThrottle, PaceDecision, PacingPolicy, PlaybackClock, percent},
    packet::SampleInfo,
    session::{CodecBackend, CodecSession, OutputEvent, OutputSurface},
    state::{PlaybackState, SeekDirection, SeekRequest, StateCell},
    timing::Timing,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub uri: String,
    pub kind: MediaKind,
    /// Start decoding as soon as `prepare` succeeds instead of emitting `Ready`.
    pub auto_play: bool,
    pub looping: bool,
    /// Minimum interval between two progress events.
    pub progress_freq_ms: u64,
    /// Emit decoded audio bytes as [`PlayerEvent::AudioData`].
    pub deliver_audio_data: bool,
    pub timing: Timing,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            kind: MediaKind::Video,
            auto_play: false,
            looping: false,
            progress_freq_ms: 200,
            deliver_audio_data: false,
            timing: Timing::default(),
        }
    }
}

impl PlayerConfig {
    pub fn new(uri: &str, kind: MediaKind) -> Self {
        Self {
            uri: uri.to_string(),
            kind,
            ..Default::default()
        }
    }

    pub fn with_auto_play(mut self, auto_play: bool) -> Self {
        self.auto_play = auto_play;
        self
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_progress_freq_ms(mut self, millis: u64) -> Self {
        self.progress_freq_ms = millis;
        self
    }

    pub fn with_audio_data(mut self, deliver: bool) -> Self {
        self.deliver_audio_data = deliver;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    /// Output format as first reported by the decoder.
    Format(TrackInfo),
    /// Playback position in percent, two decimals.
    Progress(f32),
    AudioData(Bytes),
    End,
    Error(String),
}

pub type PlayerEventStream = Pin<Box<dyn Stream<Item = PlayerEvent> + Send>>;

/// Holds the feeder back while an external download lags behind decoding.
pub trait NetThrottle: Send + Sync {
    /// `true` while the feeder must wait, given the decode position in
    /// percent of the duration.
    fn hold(&self, decode_progress: f32) -> bool;
}

impl<F> NetThrottle for F
where
    F: Fn(f32) -> bool + Send + Sync,
{
    fn hold(&self, decode_progress: f32) -> bool {
        self(decode_progress)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    state: StateCell,
    info: Mutex<TrackInfo>,
    duration_us: AtomicI64,
    /// Time of the last unit handed to the decoder.
    decode_pos_us: AtomicI64,
    failed: AtomicBool,
    events: broadcast::Sender<PlayerEvent>,
}

impl Shared {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    /// Stops both loops and reports the first failure only.
    fn fail(&self, err: &CodecError) {
        self.state.set(PlaybackState::Stop);
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.emit(PlayerEvent::Error(err.to_string()));
        }
    }

    fn decode_progress(&self) -> f32 {
        percent(
            self.decode_pos_us.load(Ordering::Acquire),
            self.duration_us.load(Ordering::Acquire),
        )
    }
}

/// Source and session between `prepare` and `start_play`.
struct Prepared {
    demuxer: Box<dyn Demuxer>,
    session: Box<dyn CodecSession>,
}

impl Prepared {
    fn release(mut self) {
        self.session.release();
        self.demuxer.release();
    }
}

struct Running {
    demuxer: Mutex<Box<dyn Demuxer>>,
    session: Mutex<Box<dyn CodecSession>>,
}

impl Running {
    fn release(&self) {
        lock(&self.session).release();
        lock(&self.demuxer).release();
    }
}

pub struct PlaybackEngine {
    config: PlayerConfig,
    backend: Arc<dyn CodecBackend>,
    handle: Handle,
    shared: Arc<Shared>,
    surface: Option<Arc<dyn OutputSurface>>,
    pacing: Arc<dyn PacingPolicy>,
    throttle: Option<Arc<dyn NetThrottle>>,
    prepared: Mutex<Option<Prepared>>,
}

impl PlaybackEngine {
    pub fn new(config: PlayerConfig, backend: Arc<dyn CodecBackend>, handle: Handle) -> Self {
        let (events, _) = broadcast::channel(1024);
        let pacing = Arc::new(DefaultPacing::new(config.timing.pacing_step));
        Self {
            config,
            backend,
            handle,
            shared: Arc::new(Shared {
                state: StateCell::new(),
                info: Mutex::new(TrackInfo::default()),
                duration_us: AtomicI64::new(0),
                decode_pos_us: AtomicI64::new(0),
                failed: AtomicBool::new(false),
                events,
            }),
            surface: None,
            pacing,
            throttle: None,
            prepared: Mutex::new(None),
        }
    }

    /// Surface receiving rendered video pictures. Takes effect on `prepare`.
    pub fn set_output_surface(&mut self, surface: Arc<dyn OutputSurface>) {
        self.surface = Some(surface);
    }

    pub fn set_pacing(&mut self, pacing: Arc<dyn PacingPolicy>) {
        self.pacing = pacing;
    }

    pub fn set_net_throttle(&mut self, throttle: Arc<dyn NetThrottle>) {
        self.throttle = Some(throttle);
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn event_stream(&self) -> PlayerEventStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("player event stream lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state.get()
    }

    pub fn track_info(&self) -> TrackInfo {
        lock(&self.shared.info).clone()
    }

    pub fn duration_ms(&self) -> i64 {
        self.shared.duration_us.load(Ordering::Acquire) / 1000
    }

    /// Opens the source and configures a decoder for the first track of the
    /// configured kind. Emits `Ready`, or starts playback with auto-play.
    pub fn prepare(&self) -> Result<()> {
        if let Err(err) = self.open() {
            log::error!("prepare {} failed: {}", self.config.uri, err);
            self.shared.emit(PlayerEvent::Error(err.to_string()));
            return Err(err);
        }
        log::info!("prepared {} track of {}", self.config.kind, self.config.uri);
        if self.config.auto_play {
            self.start_play();
        } else {
            self.shared.emit(PlayerEvent::Ready);
        }
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let mut prepared = lock(&self.prepared);
        if prepared.is_some() || self.shared.state.get() != PlaybackState::NoPlay {
            return Err(CodecError::InvalidArgument("already prepared".to_string()));
        }
        let mut demuxer = self.backend.open_source(&self.config.uri)?;
        match self.configure(demuxer.as_mut()) {
            Ok(session) => {
                *prepared = Some(Prepared { demuxer, session });
                Ok(())
            }
            Err(err) => {
                demuxer.release();
                Err(err)
            }
        }
    }

    fn configure(&self, demuxer: &mut dyn Demuxer) -> Result<Box<dyn CodecSession>> {
        let kind = self.config.kind;
        let (track, format) =
            find_track(demuxer, kind)?.ok_or_else(|| CodecError::Resource(kind.to_string()))?;
        demuxer.select_track(track)?;
        let mut session = self.backend.create_decoder(&format)?;
        let surface = match kind {
            MediaKind::Video => self.surface.clone(),
            MediaKind::Audio => None,
        };
        if let Err(err) = session.configure(&format, surface) {
            session.release();
            return Err(err);
        }
        *lock(&self.shared.info) = TrackInfo::from(&format);
        self.shared
            .duration_us
            .store(format.duration_us, Ordering::Release);
        self.shared.decode_pos_us.store(0, Ordering::Release);
        log::debug!("selected {} track {}: {}", kind, track, format.mime);
        Ok(session)
    }

    /// Starts the decode loops. No-op unless prepared and not playing.
    pub fn start_play(&self) -> bool {
        if self.shared.state.get() != PlaybackState::NoPlay {
            return false;
        }
        let Some(mut prepared) = lock(&self.prepared).take() else {
            return false;
        };
        if let Err(err) = prepared.session.start() {
            log::error!("start decoder failed: {}", err);
            prepared.release();
            self.shared.emit(PlayerEvent::Error(err.to_string()));
            return false;
        }
        self.shared.failed.store(false, Ordering::Release);
        self.shared.state.set(PlaybackState::Play);

        let run = Arc::new(Running {
            demuxer: Mutex::new(prepared.demuxer),
            session: Mutex::new(prepared.session),
        });
        let pump = Arc::new(Pump {
            shared: self.shared.clone(),
            run: run.clone(),
            config: self.config.clone(),
            pacing: self.pacing.clone(),
            throttle: self.throttle.clone(),
        });
        let shared = self.shared.clone();
        let join = Arc::new(CompletionJoin::new(2, move || {
            run.release();
            shared.state.set(PlaybackState::NoPlay);
            if !shared.failed.load(Ordering::Acquire) {
                log::info!("playback ended");
                shared.emit(PlayerEvent::End);
            }
        }));

        for feeder in [true, false] {
            let pump = pump.clone();
            let join = join.clone();
            self.handle.spawn_blocking(move || {
                let (name, res) = if feeder {
                    ("feed", pump.feed())
                } else {
                    ("drain", pump.drain())
                };
                if let Err(err) = res {
                    log::error!("{} loop error: {}", name, err);
                    pump.shared.fail(&err);
                }
                join.arrive();
            });
        }
        log::info!("playback started: {}", self.config.uri);
        true
    }

    pub fn pause(&self) -> bool {
        self.shared
            .state
            .transition(PlaybackState::Play, PlaybackState::Pause)
    }

    pub fn restore(&self) -> bool {
        self.shared
            .state
            .transition(PlaybackState::Pause, PlaybackState::Play)
    }

    pub fn pause_or_restore(&self) -> bool {
        self.pause() || self.restore()
    }

    /// Seeks to `progress` (0..=1) of the duration.
    pub fn seek_progress(&self, progress: f32) -> Option<SeekRequest> {
        if !progress.is_finite() {
            log::warn!("ignoring seek to {}", progress);
            return None;
        }
        let duration = self.shared.duration_us.load(Ordering::Acquire);
        let target = (duration as f64 * progress.clamp(0.0, 1.0) as f64) as i64;
        self.seek_us(target)
    }

    pub fn seek_ms(&self, time_ms: i64) -> Option<SeekRequest> {
        self.seek_us(time_ms.max(0) * 1000)
    }

    /// Returns `None` when the seek was ignored.
    fn seek_us(&self, target_us: i64) -> Option<SeekRequest> {
        let current = self.shared.decode_pos_us.load(Ordering::Acquire);
        match self.shared.state.get() {
            PlaybackState::NoPlay => {
                let mut prepared = lock(&self.prepared);
                let source = prepared.as_mut()?;
                if let Err(err) = source.demuxer.seek_to(target_us, SeekMode::PreviousSync) {
                    log::warn!("seek before start failed: {}", err);
                    return None;
                }
                self.shared.decode_pos_us.store(target_us, Ordering::Release);
                let direction = if target_us < current {
                    SeekDirection::Before
                } else {
                    SeekDirection::After
                };
                Some(SeekRequest {
                    target_us,
                    direction,
                    saved: PlaybackState::NoPlay,
                })
            }
            PlaybackState::Stop => None,
            _ => {
                let request = self.shared.state.begin_seek(target_us, current)?;
                log::info!(
                    "seek {:?} to {} ms from {} ms",
                    request.direction,
                    request.target_ms(),
                    current / 1000
                );
                Some(request)
            }
        }
    }

    /// Asks both loops to exit; `End` follows once they have. Before
    /// `start_play` the prepared resources are released directly.
    pub fn stop(&self) {
        if let Some(prepared) = lock(&self.prepared).take() {
            prepared.release();
            log::info!("released prepared {}", self.config.uri);
            return;
        }
        if self.shared.state.get() != PlaybackState::NoPlay {
            log::info!("stopping {}", self.config.uri);
            self.shared.state.set(PlaybackState::Stop);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Pump {
    shared: Arc<Shared>,
    run: Arc<Running>,
    config: PlayerConfig,
    pacing: Arc<dyn PacingPolicy>,
    throttle: Option<Arc<dyn NetThrottle>>,
}

impl Pump {
    fn held(&self) -> bool {
        self.throttle
            .as_ref()
            .is_some_and(|t| t.hold(self.shared.decode_progress()))
    }

    fn feed(&self) -> Result<()> {
        let timing = &self.config.timing;
        let cell = &self.shared.state;
        let mut source = lock(&self.run.demuxer);
        let mut buf = Vec::new();
        // read but not yet accepted by the decoder
        let mut pending: Option<SampleInfo> = None;
        let mut fed_since_wrap = false;

        loop {
            let state = cell.get();
            match state {
                PlaybackState::Stop | PlaybackState::NoPlay => return Ok(()),
                PlaybackState::Pause => {
                    cell.wait_while(timing.poll_interval, |s| s == state);
                    continue;
                }
                PlaybackState::DataWait => {
                    if self.held() {
                        cell.wait_while(timing.net_wait, |s| s == state);
                    } else if cell.transition(PlaybackState::DataWait, PlaybackState::Play) {
                        log::debug!("network caught up");
                    }
                    continue;
                }
                PlaybackState::SeekStart => {
                    if let Some(seek) = cell.seek_request() {
                        source.seek_to(seek.target_us, SeekMode::PreviousSync)?;
                        pending = None;
                        log::debug!("source repositioned for {} ms", seek.target_ms());
                    }
                    cell.transition(PlaybackState::SeekStart, PlaybackState::Seek);
                    continue;
                }
                PlaybackState::Play => {
                    if self.held() {
                        if cell.transition(PlaybackState::Play, PlaybackState::DataWait) {
                            log::debug!(
                                "waiting for data at {:.2}%",
                                self.shared.decode_progress()
                            );
                        }
                        continue;
                    }
                }
                PlaybackState::Seek => {}
            }

            let info = match pending.take() {
                Some(info) => Some(info),
                None => source.read_sample(&mut buf)?,
            };
            let Some(info) = info else {
                if self.config.looping && fed_since_wrap {
                    source.seek_to(0, SeekMode::PreviousSync)?;
                    fed_since_wrap = false;
                    self.shared.decode_pos_us.store(0, Ordering::Release);
                    log::debug!("looping {}", self.config.uri);
                    continue;
                }
                return self.submit_end_of_stream();
            };
            let accepted =
                lock(&self.run.session).submit_input(Some(buf.as_slice()), info.pts_us, false)?;
            if accepted {
                self.shared
                    .decode_pos_us
                    .store(info.pts_us, Ordering::Release);
                fed_since_wrap = true;
                source.advance()?;
            } else {
                pending = Some(info);
                cell.wait_while(timing.output_poll, |s| s == state);
            }
        }
    }

    fn submit_end_of_stream(&self) -> Result<()> {
        let cell = &self.shared.state;
        loop {
            let state = cell.get();
            if matches!(state, PlaybackState::Stop | PlaybackState::NoPlay) {
                return Ok(());
            }
            if lock(&self.run.session).submit_input(None, 0, true)? {
                log::debug!("end of input: {}", self.config.uri);
                return Ok(());
            }
            cell.wait_while(self.config.timing.output_poll, |s| s == state);
        }
    }

    fn drain(&self) -> Result<()> {
        let timing = &self.config.timing;
        let cell = &self.shared.state;
        let is_video = self.config.kind == MediaKind::Video;
        let mut clock = PlaybackClock::new();
        let freq = Duration::from_millis(self.config.progress_freq_ms);
        let mut progress = FrequencyThrottle::new(freq);
        let mut last_rendered: Option<i64> = None;
        let mut format_reported = false;
        let mut paused = false;

        loop {
            let state = cell.get();
            match state {
                PlaybackState::Stop | PlaybackState::NoPlay => return Ok(()),
                PlaybackState::Pause => {
                    paused = true;
                    cell.wait_while(timing.poll_interval, |s| s == state);
                    continue;
                }
                _ => {}
            }
            if paused {
                paused = false;
                clock.reset();
            }

            let event = lock(&self.run.session).poll_output()?;
            let buffer = match event {
                OutputEvent::WouldBlock => {
                    cell.wait_while(timing.output_poll, |s| s == state);
                    continue;
                }
                OutputEvent::FormatChanged(format) => {
                    self.format_changed(&format, &mut format_reported);
                    continue;
                }
                OutputEvent::Data(buffer) => buffer,
            };

            if buffer.is_eos() {
                lock(&self.run.session).release_output(buffer.index, false)?;
                self.shared.emit(PlayerEvent::Progress(100.0));
                log::debug!("decoder drained: {}", self.config.uri);
                return Ok(());
            }

            let pts_us = buffer.pts_us;
            let render = match state {
                // output still predates the reposition
                PlaybackState::SeekStart => false,
                PlaybackState::Seek => {
                    let reached = self.seek_step(pts_us, last_rendered);
                    if reached {
                        clock.reset();
                        clock.skew_ms(pts_us, Instant::now());
                    }
                    reached
                }
                _ if is_video => self.pace(&mut clock, pts_us, state),
                _ => true,
            };
            lock(&self.run.session).release_output(buffer.index, render)?;
            if !render {
                continue;
            }
            last_rendered = Some(pts_us);

            if !is_video && self.config.deliver_audio_data {
                self.shared.emit(PlayerEvent::AudioData(buffer.data.clone()));
            }
            let value = percent(pts_us, self.shared.duration_us.load(Ordering::Acquire));
            if value < 100.0 && progress.ready(value, Instant::now()) {
                self.shared.emit(PlayerEvent::Progress(value));
            }
        }
    }

    /// Whether the frame at `pts_us` ends the in-flight seek.
    fn seek_step(&self, pts_us: i64, last_rendered: Option<i64>) -> bool {
        let cell = &self.shared.state;
        let Some(seek) = cell.seek_request() else {
            return true;
        };
        let reached = match seek.direction {
            SeekDirection::After => pts_us >= seek.target_us,
            SeekDirection::Before => {
                if pts_us > last_rendered.unwrap_or(i64::MAX) {
                    false
                } else if pts_us < seek.target_us {
                    // landed on the sync sample ahead of the target
                    cell.redirect_seek(SeekDirection::After);
                    false
                } else {
                    true
                }
            }
        };
        if reached {
            cell.finish_seek();
            log::debug!("seek to {} ms done at {} ms", seek.target_ms(), pts_us / 1000);
        }
        reached
    }

    /// Sleeps until the frame is due. Returns `false` to drop it.
    fn pace(&self, clock: &mut PlaybackClock, pts_us: i64, mut state: PlaybackState) -> bool {
        let interval = lock(&self.shared.info).frame_interval_ms();
        loop {
            let skew = clock.skew_ms(pts_us, Instant::now());
            match self.pacing.decide(skew, interval) {
                PaceDecision::Render => return true,
                PaceDecision::Drop => {
                    log::warn!("dropping frame {} ms, {} ms late", pts_us / 1000, skew);
                    return false;
                }
                PaceDecision::Wait(wait) => {
                    let now = self.shared.state.wait_while(wait, |s| s == state);
                    match now {
                        PlaybackState::Stop | PlaybackState::NoPlay | PlaybackState::Pause => {
                            return false;
                        }
                        s if s.is_seeking() => return false,
                        s => state = s,
                    }
                }
            }
        }
    }

    fn format_changed(&self, format: &MediaFormat, reported: &mut bool) {
        let info = {
            let mut info = lock(&self.shared.info);
            info.update(format);
            info.clone()
        };
        if format.duration_us > 0 {
            self.shared
                .duration_us
                .store(format.duration_us, Ordering::Release);
        }
        if *reported {
            log::debug!("output format changed again: {:?}", info);
            return;
        }
        *reported = true;
        log::debug!("output format: {:?}", info);
        self.shared.emit(PlayerEvent::Format(info));
    }
}

#[cfg(test)]
#[path = "player_test.rs"]
mod player_test;
