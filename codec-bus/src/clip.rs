//! Transcode pipeline: decode, crop/composite, re-encode and mux a video
//! source, copying its audio track through.
//!
//! Every stage advances by at most one unit per iteration of a single
//! loop, so that no codec's buffer pool fills up while another stage is
//! starved.

use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    audio_extract::AudioPassThrough,
    compositor::{ClipDrawer, Compositor},
    demuxer::{Demuxer, find_track},
    error::{CodecError, Result},
    format::{MediaFormat, MediaKind},
    pacing::{StepThrottle, percent},
    session::{CodecBackend, CodecSession, EncodeSession, OutputEvent},
    sync_muxer::SyncMuxer,
    timing::Timing,
};

/// Frame rate assumed for sources that report none.
const FALLBACK_FRAME_RATE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    pub input: String,
    pub output: String,
    /// Encoded picture size.
    pub width: u32,
    pub height: u32,
    /// Source window to keep; defaults to the output size, clamped to the
    /// source.
    pub crop_width: Option<u32>,
    pub crop_height: Option<u32>,
    pub margin_left: u32,
    pub margin_top: u32,
    /// Seconds between key frames.
    pub key_frame_interval: f32,
    /// Quality factor in `0.0..=1.0` scaling the bitrate.
    pub clarity: f32,
    pub keep_audio: bool,
    pub mime: String,
    pub timing: Timing,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            width: 1280,
            height: 720,
            crop_width: None,
            crop_height: None,
            margin_left: 0,
            margin_top: 0,
            key_frame_interval: 0.1,
            clarity: 0.3,
            keep_audio: true,
            mime: "video/avc".to_string(),
            timing: Timing::default(),
        }
    }
}

impl ClipConfig {
    pub fn new(input: &str, output: &str) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_crop(mut self, width: u32, height: u32) -> Self {
        self.crop_width = Some(width);
        self.crop_height = Some(height);
        self
    }

    pub fn with_margins(mut self, left: u32, top: u32) -> Self {
        self.margin_left = left;
        self.margin_top = top;
        self
    }

    pub fn with_key_frame_interval(mut self, seconds: f32) -> Self {
        self.key_frame_interval = seconds;
        self
    }

    pub fn with_clarity(mut self, clarity: f32) -> Self {
        self.clarity = clarity;
        self
    }

    pub fn with_audio(mut self, keep_audio: bool) -> Self {
        self.keep_audio = keep_audio;
        self
    }

    pub fn with_mime(mut self, mime: &str) -> Self {
        self.mime = mime.to_string();
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn clarity(&self) -> f32 {
        if self.clarity.is_finite() {
            self.clarity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Crop window for a `source_w`x`source_h` source.
    pub fn crop_size(&self, source_w: u32, source_h: u32) -> (u32, u32) {
        (
            self.crop_width.unwrap_or(self.width.min(source_w)),
            self.crop_height.unwrap_or(self.height.min(source_h)),
        )
    }

    /// Encoder bitrate: pixels per second scaled by clarity.
    pub fn bit_rate(&self, frame_rate: u32) -> u64 {
        let pixels = self.width as f64 * self.height as f64 * frame_rate as f64;
        (pixels * self.clarity() as f64) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClipEvent {
    Start,
    /// Overall progress in percent; non-decreasing, the last one is 100.
    Progress(f32),
    End,
    Error(String),
}

pub type ClipEventStream = Pin<Box<dyn Stream<Item = ClipEvent> + Send>>;

pub struct ClipTask {
    config: ClipConfig,
    backend: Arc<dyn CodecBackend>,
    handle: Handle,
    events: broadcast::Sender<ClipEvent>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the pipeline thread exits.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClipTask {
    pub fn new(config: ClipConfig, backend: Arc<dyn CodecBackend>, handle: Handle) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            backend,
            handle,
            events,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClipEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> ClipEventStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("clip event stream lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Cancelling aborts the pump at its next iteration.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the pipeline on a blocking thread. Exactly one of `End` or
    /// `Error` is emitted; the output may be left partially written on error.
    /// A start while a run is in flight fails without touching the output.
    pub fn start(&self) -> JoinHandle<Result<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            log::warn!("clip {} already running", self.config.output);
            return self.handle.spawn(async {
                Err(CodecError::InvalidArgument("clip already running".to_string()))
            });
        }
        let guard = RunGuard(self.running.clone());
        let config = self.config.clone();
        let backend = self.backend.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            log::info!("clip {} -> {}", config.input, config.output);
            let _ = events.send(ClipEvent::Start);
            let res = Pipeline::open(&config, backend.as_ref(), events.clone(), cancel)
                .and_then(|mut pipeline| pipeline.run());
            match &res {
                Ok(()) => {
                    log::info!("clip done: {}", config.output);
                    let _ = events.send(ClipEvent::End);
                }
                Err(err) => {
                    log::error!("clip {} failed: {}", config.input, err);
                    let _ = events.send(ClipEvent::Error(err.to_string()));
                }
            }
            res
        })
    }
}

/// Owns a collaborator and releases it when dropped, on every exit path.
struct Scoped<T> {
    inner: T,
    release: fn(&mut T),
}

impl<T> Scoped<T> {
    fn new(inner: T, release: fn(&mut T)) -> Self {
        Self { inner, release }
    }
}

impl<T> Deref for Scoped<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Scoped<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for Scoped<T> {
    fn drop(&mut self) {
        (self.release)(&mut self.inner);
    }
}

// Fields drop in declaration order: encoder side first, muxer last.
struct Pipeline {
    compositor: Scoped<Compositor>,
    encoder: Scoped<Box<dyn EncodeSession>>,
    decoder: Scoped<Box<dyn CodecSession>>,
    source: Scoped<Box<dyn Demuxer>>,
    audio: Option<AudioPassThrough>,
    muxer: SyncMuxer,

    buf: Vec<u8>,
    duration_us: i64,
    decimate: bool,
    keep_next: bool,
    input_done: bool,
    decode_done: bool,
    encode_done: bool,
    video_progress: f32,
    progress: StepThrottle,
    output_poll: std::time::Duration,
    events: broadcast::Sender<ClipEvent>,
    cancel: CancellationToken,
}

impl Pipeline {
    fn open(
        config: &ClipConfig,
        backend: &dyn CodecBackend,
        events: broadcast::Sender<ClipEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut source = Scoped::new(backend.open_source(&config.input)?, |s| s.release());
        let (track, format) = find_track(&**source, MediaKind::Video)?
            .ok_or_else(|| CodecError::Resource(MediaKind::Video.to_string()))?;
        source.select_track(track)?;

        let (crop_w, crop_h) = config.crop_size(format.width, format.height);
        let drawer = ClipDrawer::new(
            format.width,
            format.height,
            crop_w,
            crop_h,
            config.margin_left,
            config.margin_top,
        )?;

        let source_fps = if format.frame_rate > 0 {
            format.frame_rate
        } else {
            FALLBACK_FRAME_RATE
        };
        let decimate = source_fps >= config.timing.decimation_threshold;
        let fps = if decimate { source_fps / 2 } else { source_fps };
        let mut encode_format = MediaFormat::video(&config.mime, config.width, config.height)
            .with_frame_rate(fps)
            .with_duration_us(format.duration_us)
            .with_bit_rate(config.bit_rate(fps));
        encode_format.key_frame_interval = config.key_frame_interval;
        log::info!(
            "encode {}x{} crop {}x{}+{}+{} at {} fps, {} bps{}",
            config.width,
            config.height,
            crop_w,
            crop_h,
            config.margin_left,
            config.margin_top,
            fps,
            encode_format.bit_rate,
            if decimate { ", decimating" } else { "" }
        );

        let mut encoder = Scoped::new(backend.create_encoder(&encode_format)?, |e| e.release());
        encoder.configure(&encode_format, None)?;
        let surface = encoder.create_input_surface()?;
        let mut compositor = Scoped::new(
            Compositor::new(surface, config.width, config.height),
            |c| c.release(),
        );
        compositor.add_drawer(Box::new(drawer))?;

        let mut decoder = Scoped::new(backend.create_decoder(&format)?, |d| d.release());
        decoder.configure(&format, Some(compositor.texture()))?;

        let muxer = SyncMuxer::new(backend.create_muxer(&config.output)?);
        let audio = if config.keep_audio {
            AudioPassThrough::open(backend, &config.input)?
        } else {
            None
        };
        match audio.as_ref() {
            Some(audio) => muxer.add_track(audio.format())?,
            None => muxer.set_no_audio()?,
        }

        encoder.start()?;
        decoder.start()?;

        Ok(Self {
            compositor,
            encoder,
            decoder,
            source,
            audio,
            muxer,
            buf: Vec::new(),
            duration_us: format.duration_us,
            decimate,
            keep_next: true,
            input_done: false,
            decode_done: false,
            encode_done: false,
            video_progress: 0.0,
            progress: StepThrottle::new(config.timing.progress_step),
            output_poll: config.timing.output_poll,
            events,
            cancel,
        })
    }

    fn audio_done(&self) -> bool {
        self.audio.as_ref().is_none_or(|a| a.is_done())
    }

    fn finished(&self) -> bool {
        self.decode_done && self.encode_done && self.audio_done()
    }

    fn run(&mut self) -> Result<()> {
        while !self.finished() {
            if self.cancel.is_cancelled() {
                return Err(CodecError::Cancelled);
            }
            let mut progressed = self.feed_video()?;
            progressed |= self.drain_decoder()?;
            progressed |= self.drain_encoder()?;
            progressed |= self.pass_audio()?;
            self.report_progress();
            if !progressed {
                std::thread::sleep(self.output_poll);
            }
        }
        if let Some(value) = self.progress.finish() {
            let _ = self.events.send(ClipEvent::Progress(value));
        }
        self.muxer.finalize()
    }

    fn feed_video(&mut self) -> Result<bool> {
        if self.input_done {
            return Ok(false);
        }
        match self.source.read_sample(&mut self.buf)? {
            Some(info) => {
                let accepted = self
                    .decoder
                    .submit_input(Some(&self.buf[..]), info.pts_us, false)?;
                if accepted {
                    self.source.advance()?;
                }
                Ok(accepted)
            }
            None => {
                self.input_done = self.decoder.submit_input(None, 0, true)?;
                if self.input_done {
                    log::debug!("video input exhausted");
                }
                Ok(self.input_done)
            }
        }
    }

    fn drain_decoder(&mut self) -> Result<bool> {
        if self.decode_done {
            return Ok(false);
        }
        let buffer = match self.decoder.poll_output()? {
            OutputEvent::WouldBlock => return Ok(false),
            OutputEvent::FormatChanged(format) => {
                log::debug!("decoder output {}x{}", format.width, format.height);
                return Ok(true);
            }
            OutputEvent::Data(buffer) => buffer,
        };
        if buffer.is_eos() {
            self.decoder.release_output(buffer.index, false)?;
            self.decode_done = true;
            self.video_progress = 100.0;
            self.encoder.signal_end_of_input()?;
            log::debug!("decoder drained, flushing encoder");
            return Ok(true);
        }
        let keep = if self.decimate {
            let keep = self.keep_next;
            self.keep_next = !keep;
            keep
        } else {
            true
        };
        self.decoder.release_output(buffer.index, keep)?;
        if keep {
            self.compositor.composite(buffer.pts_us)?;
        }
        self.video_progress = percent(buffer.pts_us, self.duration_us);
        Ok(true)
    }

    fn drain_encoder(&mut self) -> Result<bool> {
        if self.encode_done {
            return Ok(false);
        }
        let buffer = match self.encoder.poll_output()? {
            OutputEvent::WouldBlock => return Ok(false),
            OutputEvent::FormatChanged(format) => {
                self.muxer.add_track(&format)?;
                return Ok(true);
            }
            OutputEvent::Data(buffer) => buffer,
        };
        if buffer.is_eos() {
            self.encoder.release_output(buffer.index, false)?;
            self.encode_done = true;
            log::debug!("encoder flushed");
            self.muxer.close_track(MediaKind::Video)?;
            return Ok(true);
        }
        let written = self.muxer.write_video_data(&buffer.data, &buffer.info());
        self.encoder.release_output(buffer.index, false)?;
        written?;
        Ok(true)
    }

    fn pass_audio(&mut self) -> Result<bool> {
        if !self.muxer.is_started() {
            return Ok(false);
        }
        match self.audio.as_mut() {
            Some(audio) => audio.step(&self.muxer),
            None => Ok(false),
        }
    }

    fn report_progress(&mut self) {
        let overall = match self.audio.as_ref() {
            Some(audio) => self.video_progress.min(audio.progress()),
            None => self.video_progress,
        };
        if let Some(value) = self.progress.offer(overall) {
            let _ = self.events.send(ClipEvent::Progress(value));
        }
    }
}

#[cfg(test)]
#[path = "clip_test.rs"]
mod clip_test;
