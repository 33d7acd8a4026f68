//! Audio and video playback of one source, one [`PlaybackEngine`] per track
//! kind, presented as a single player.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    demuxer::find_track,
    error::{CodecError, Result},
    format::{MediaKind, TrackInfo},
    pacing::{FrequencyThrottle, PacingPolicy},
    player::{NetThrottle, PlaybackEngine, PlayerConfig, PlayerEvent, PlayerEventStream},
    session::{CodecBackend, OutputSurface},
    state::{PlaybackState, SeekRequest},
    timing::Timing,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvPlayerConfig {
    pub uri: String,
    pub decode_video: bool,
    pub decode_audio: bool,
    pub auto_play: bool,
    pub looping: bool,
    pub progress_freq_ms: u64,
    pub deliver_audio_data: bool,
    pub timing: Timing,
}

impl Default for AvPlayerConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            decode_video: true,
            decode_audio: true,
            auto_play: false,
            looping: false,
            progress_freq_ms: 200,
            deliver_audio_data: false,
            timing: Timing::default(),
        }
    }
}

impl AvPlayerConfig {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tracks(mut self, video: bool, audio: bool) -> Self {
        self.decode_video = video;
        self.decode_audio = audio;
        self
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

    fn engine_config(&self, kind: MediaKind) -> PlayerConfig {
        PlayerConfig::new(&self.uri, kind)
            .with_looping(self.looping)
            // throttled once more when forwarded
            .with_progress_freq_ms(0)
            .with_audio_data(kind == MediaKind::Audio && self.deliver_audio_data)
            .with_timing(self.timing.clone())
    }
}

/// Track kinds to play given what was requested and what the source has.
fn select_kinds(
    config: &AvPlayerConfig,
    has_video: bool,
    has_audio: bool,
) -> Result<Vec<MediaKind>> {
    if !config.decode_video && !config.decode_audio {
        return Err(CodecError::InvalidArgument(
            "neither video nor audio requested".to_string(),
        ));
    }
    if !has_video && !has_audio {
        return Err(CodecError::Resource("audio or video".to_string()));
    }
    let mut kinds = Vec::new();
    if config.decode_video && has_video {
        kinds.push(MediaKind::Video);
    }
    if config.decode_audio && has_audio {
        kinds.push(MediaKind::Audio);
    }
    if kinds.is_empty() {
        let requested = if config.decode_video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        return Err(CodecError::Resource(requested.to_string()));
    }
    Ok(kinds)
}

pub struct AvPlayer {
    config: AvPlayerConfig,
    backend: Arc<dyn CodecBackend>,
    handle: Handle,
    surface: Option<Arc<dyn OutputSurface>>,
    pacing: Option<Arc<dyn PacingPolicy>>,
    throttle: Option<Arc<dyn NetThrottle>>,
    engines: Vec<Arc<PlaybackEngine>>,
    events: broadcast::Sender<PlayerEvent>,
    cancel: CancellationToken,
}

impl AvPlayer {
    pub fn new(config: AvPlayerConfig, backend: Arc<dyn CodecBackend>, handle: Handle) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            backend,
            handle,
            surface: None,
            pacing: None,
            throttle: None,
            engines: Vec::new(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn set_output_surface(&mut self, surface: Arc<dyn OutputSurface>) {
        self.surface = Some(surface);
    }

    pub fn set_pacing(&mut self, pacing: Arc<dyn PacingPolicy>) {
        self.pacing = Some(pacing);
    }

    pub fn set_net_throttle(&mut self, throttle: Arc<dyn NetThrottle>) {
        self.throttle = Some(throttle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> PlayerEventStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("av player event stream lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    fn probe(&self) -> Result<(bool, bool)> {
        let mut demuxer = self.backend.open_source(&self.config.uri)?;
        let video = find_track(demuxer.as_ref(), MediaKind::Video);
        let audio = find_track(demuxer.as_ref(), MediaKind::Audio);
        demuxer.release();
        Ok((video?.is_some(), audio?.is_some()))
    }

    fn build(&mut self) -> Result<()> {
        if !self.engines.is_empty() {
            return Err(CodecError::InvalidArgument("already prepared".to_string()));
        }
        let (has_video, has_audio) = self.probe()?;
        let kinds = select_kinds(&self.config, has_video, has_audio)?;
        for kind in kinds {
            let mut engine = PlaybackEngine::new(
                self.config.engine_config(kind),
                self.backend.clone(),
                self.handle.clone(),
            );
            if let (MediaKind::Video, Some(surface)) = (kind, self.surface.as_ref()) {
                engine.set_output_surface(surface.clone());
            }
            if let Some(pacing) = self.pacing.as_ref() {
                engine.set_pacing(pacing.clone());
            }
            if let Some(throttle) = self.throttle.as_ref() {
                engine.set_net_throttle(throttle.clone());
            }
            self.engines.push(Arc::new(engine));
        }
        Ok(())
    }

    /// Prepares one engine per playable track kind. `Ready` is emitted once
    /// all of them are ready; with auto-play they start together instead.
    pub fn prepare(&mut self) -> Result<()> {
        if let Err(err) = self.build() {
            log::error!("av player {}: {}", self.config.uri, err);
            let _ = self.events.send(PlayerEvent::Error(err.to_string()));
            return Err(err);
        }

        let streams: SelectAll<BoxStream<'static, (MediaKind, PlayerEvent)>> =
            futures::stream::select_all(self.engines.iter().map(|engine| {
                let kind = engine.config().kind;
                engine.event_stream().map(move |event| (kind, event)).boxed()
            }));
        let forwarder = Forwarder {
            engines: self.engines.clone(),
            events: self.events.clone(),
            auto_play: self.config.auto_play,
            progress: FrequencyThrottle::new(Duration::from_millis(self.config.progress_freq_ms)),
            last_progress: 0.0,
            completed: false,
        };
        self.handle
            .spawn(forwarder.run(streams, self.cancel.clone()));

        // engine failures reach subscribers through the forwarder
        for engine in &self.engines {
            if let Err(err) = engine.prepare() {
                for engine in &self.engines {
                    engine.stop();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn start_play(&self) -> bool {
        let mut started = false;
        for engine in &self.engines {
            started |= engine.start_play();
        }
        started
    }

    pub fn pause(&self) -> bool {
        let mut changed = false;
        for engine in &self.engines {
            changed |= engine.pause();
        }
        changed
    }

    pub fn restore(&self) -> bool {
        let mut changed = false;
        for engine in &self.engines {
            changed |= engine.restore();
        }
        changed
    }

    pub fn pause_or_restore(&self) -> bool {
        self.pause() || self.restore()
    }

    /// Seeks every track to `progress` of the longest one.
    pub fn seek_progress(&self, progress: f32) -> Option<SeekRequest> {
        if !progress.is_finite() {
            return None;
        }
        let duration = self.lead()?.duration_ms();
        self.seek_ms((duration as f64 * progress.clamp(0.0, 1.0) as f64) as i64)
    }

    pub fn seek_ms(&self, time_ms: i64) -> Option<SeekRequest> {
        let mut first = None;
        for engine in &self.engines {
            let request = engine.seek_ms(time_ms);
            first = first.or(request);
        }
        first
    }

    pub fn stop(&self) {
        for engine in &self.engines {
            engine.stop();
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.engines
            .first()
            .map(|e| e.state())
            .unwrap_or(PlaybackState::NoPlay)
    }

    pub fn track_info(&self, kind: MediaKind) -> Option<TrackInfo> {
        self.engines
            .iter()
            .find(|e| e.config().kind == kind)
            .map(|e| e.track_info())
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        self.engines.iter().map(|e| e.config().kind).collect()
    }

    fn lead(&self) -> Option<&Arc<PlaybackEngine>> {
        lead(&self.engines)
    }
}

impl Drop for AvPlayer {
    fn drop(&mut self) {
        self.stop();
        self.cancel.cancel();
    }
}

/// The engine with the longest duration; video wins ties.
fn lead(engines: &[Arc<PlaybackEngine>]) -> Option<&Arc<PlaybackEngine>> {
    engines
        .iter()
        .reduce(|a, b| if b.duration_ms() > a.duration_ms() { b } else { a })
}

struct Forwarder {
    engines: Vec<Arc<PlaybackEngine>>,
    events: broadcast::Sender<PlayerEvent>,
    auto_play: bool,
    progress: FrequencyThrottle,
    last_progress: f32,
    completed: bool,
}

impl Forwarder {
    async fn run(
        mut self,
        mut streams: SelectAll<BoxStream<'static, (MediaKind, PlayerEvent)>>,
        cancel: CancellationToken,
    ) {
        let expected = self.engines.len();
        let mut ready = 0;
        let mut ended = 0;
        loop {
            let (kind, event) = tokio::select! {
                _ = cancel.cancelled() => break,
                next = streams.next() => match next {
                    Some(next) => next,
                    None => break,
                },
            };
            match event {
                PlayerEvent::Ready => {
                    ready += 1;
                    if ready < expected {
                        continue;
                    }
                    if self.auto_play {
                        for engine in &self.engines {
                            engine.start_play();
                        }
                    } else {
                        self.emit(PlayerEvent::Ready);
                    }
                }
                PlayerEvent::Progress(value) => self.progress(kind, value),
                PlayerEvent::End => {
                    ended += 1;
                    if ended == expected {
                        log::info!("av playback ended");
                        self.emit(PlayerEvent::End);
                        break;
                    }
                }
                PlayerEvent::Error(msg) => {
                    for engine in &self.engines {
                        engine.stop();
                    }
                    self.emit(PlayerEvent::Error(msg));
                    break;
                }
                other => self.emit(other),
            }
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn progress(&mut self, kind: MediaKind, value: f32) {
        if lead(&self.engines).map(|e| e.config().kind) != Some(kind) {
            return;
        }
        let value = self.last_progress.max(value);
        if value >= 100.0 {
            if !self.completed {
                self.completed = true;
                self.last_progress = 100.0;
                self.emit(PlayerEvent::Progress(100.0));
            }
            return;
        }
        if self.progress.ready(value, Instant::now()) {
            self.last_progress = value;
            self.emit(PlayerEvent::Progress(value));
        }
    }
}
