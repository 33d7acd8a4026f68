//! Scripted in-memory implementations of the external contracts, so the
//! engines can be exercised without codec hardware or media files.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use tokio::sync::broadcast;

use crate::{
    compositor::ComposedFrame,
    demuxer::{Demuxer, SeekMode},
    error::{CodecError, Result},
    format::{MediaFormat, MediaKind},
    frame::Picture,
    muxer::Muxer,
    pacing::{PaceDecision, PacingPolicy},
    packet::{BufferFlags, SampleInfo},
    session::{
        CodecBackend, CodecSession, EncodeSession, InputSurface, OutputBuffer, OutputEvent,
        OutputSurface,
    },
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Next event within `wait`, skipping over lag notifications.
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>, wait: Duration) -> Option<T> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => return Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Collects events until one matches `stop` (included) or `wait` elapses.
pub async fn collect_until<T, F>(rx: &mut broadcast::Receiver<T>, wait: Duration, stop: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    let mut events = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(rx, left).await {
            Some(event) => {
                let done = stop(&event);
                events.push(event);
                if done {
                    return events;
                }
            }
            None => return events,
        }
    }
}

/// Polls `cond` every few milliseconds until it holds or `wait` elapses.
pub async fn eventually<F: Fn() -> bool>(wait: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Renders every frame as soon as it is decoded.
pub struct ImmediatePacing;

impl PacingPolicy for ImmediatePacing {
    fn decide(&self, _skew_ms: i64, _frame_interval_ms: i64) -> PaceDecision {
        PaceDecision::Render
    }
}

#[derive(Debug, Clone)]
pub struct MockSample {
    pub pts_us: i64,
    pub data: Bytes,
    pub key: bool,
}

#[derive(Debug, Clone)]
pub struct MockTrack {
    pub format: MediaFormat,
    pub samples: Vec<MockSample>,
}

fn samples(count: usize, interval_ms: i64, key_every: usize) -> Vec<MockSample> {
    (0..count)
        .map(|i| MockSample {
            pts_us: i as i64 * interval_ms * 1000,
            data: Bytes::copy_from_slice(&(i as u32).to_le_bytes()),
            key: key_every <= 1 || i % key_every == 0,
        })
        .collect()
}

/// `count` video samples `interval_ms` apart with a sync sample every
/// `key_every` samples.
pub fn video_track(count: usize, interval_ms: i64, fps: u32, key_every: usize) -> MockTrack {
    MockTrack {
        format: MediaFormat::video("video/h264", 320, 240)
            .with_frame_rate(fps)
            .with_duration_us(count as i64 * interval_ms * 1000),
        samples: samples(count, interval_ms, key_every),
    }
}

pub fn audio_track(count: usize, interval_ms: i64) -> MockTrack {
    MockTrack {
        format: MediaFormat::audio("audio/aac", 44_100, 2)
            .with_duration_us(count as i64 * interval_ms * 1000),
        samples: samples(count, interval_ms, 1),
    }
}

#[derive(Debug, Default)]
pub struct DemuxRecord {
    pub opened: usize,
    pub seeks: Vec<i64>,
    pub released: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DemuxLog(Arc<Mutex<DemuxRecord>>);

impl DemuxLog {
    pub fn seeks(&self) -> Vec<i64> {
        lock(&self.0).seeks.clone()
    }

    pub fn opened(&self) -> usize {
        lock(&self.0).opened
    }

    pub fn released(&self) -> usize {
        lock(&self.0).released
    }
}

pub struct MockDemuxer {
    tracks: Vec<MockTrack>,
    selected: Vec<bool>,
    cursors: Vec<usize>,
    log: DemuxLog,
}

impl MockDemuxer {
    pub fn new(tracks: Vec<MockTrack>, log: DemuxLog) -> Self {
        lock(&log.0).opened += 1;
        let n = tracks.len();
        Self {
            tracks,
            selected: vec![false; n],
            cursors: vec![0; n],
            log,
        }
    }

    /// Selected track holding the earliest pending sample.
    fn current(&self) -> Option<(usize, &MockSample)> {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(i, _)| self.selected[*i])
            .filter_map(|(i, t)| t.samples.get(self.cursors[i]).map(|s| (i, s)))
            .min_by_key(|(i, s)| (s.pts_us, *i))
    }
}

impl Demuxer for MockDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<MediaFormat> {
        self.tracks
            .get(index)
            .map(|t| t.format.clone())
            .ok_or_else(|| CodecError::InvalidArgument(format!("track {}", index)))
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(CodecError::InvalidArgument(format!("track {}", index)));
        }
        self.selected[index] = true;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>> {
        let Some((_, sample)) = self.current() else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(&sample.data);
        let flags = if sample.key {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        Ok(Some(SampleInfo::new(sample.data.len(), sample.pts_us, flags)))
    }

    fn advance(&mut self) -> Result<bool> {
        if let Some((track, _)) = self.current() {
            self.cursors[track] += 1;
        }
        Ok(self.current().is_some())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<()> {
        lock(&self.log.0).seeks.push(time_us);
        for (i, track) in self.tracks.iter().enumerate() {
            let position = match mode {
                SeekMode::PreviousSync => track
                    .samples
                    .iter()
                    .rposition(|s| s.key && s.pts_us <= time_us)
                    .unwrap_or(0),
                SeekMode::Closest => track
                    .samples
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| (s.pts_us - time_us).abs())
                    .map(|(i, _)| i)
                    .unwrap_or(0),
            };
            self.cursors[i] = position;
        }
        Ok(())
    }

    fn sample_time(&mut self) -> Result<Option<i64>> {
        Ok(self.current().map(|(_, s)| s.pts_us))
    }

    fn release(&mut self) {
        lock(&self.log.0).released += 1;
    }
}

#[derive(Debug, Default)]
pub struct DecoderRecord {
    pub rendered: Vec<(MediaKind, i64)>,
    pub dropped: Vec<(MediaKind, i64)>,
    pub submitted: Vec<i64>,
    pub eos_submitted: bool,
    pub released: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DecoderLog(Arc<Mutex<DecoderRecord>>);

impl DecoderLog {
    pub fn rendered(&self, kind: MediaKind) -> Vec<i64> {
        lock(&self.0)
            .rendered
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, pts)| *pts)
            .collect()
    }

    pub fn dropped(&self, kind: MediaKind) -> Vec<i64> {
        lock(&self.0)
            .dropped
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, pts)| *pts)
            .collect()
    }

    pub fn submitted(&self) -> Vec<i64> {
        lock(&self.0).submitted.clone()
    }

    pub fn released(&self) -> usize {
        lock(&self.0).released
    }
}

/// Pass-through decoder: every input unit comes out unchanged, preceded once
/// by a format change.
pub struct MockDecoder {
    log: DecoderLog,
    format: Option<MediaFormat>,
    surface: Option<Arc<dyn OutputSurface>>,
    started: bool,
    input: VecDeque<(i64, Bytes, bool)>,
    capacity: usize,
    format_reported: bool,
    slots: HashMap<usize, i64>,
    next_index: usize,
    outputs: usize,
    fail_after: Option<usize>,
}

impl MockDecoder {
    pub fn new(log: DecoderLog, capacity: usize, fail_after: Option<usize>) -> Self {
        Self {
            log,
            format: None,
            surface: None,
            started: false,
            input: VecDeque::new(),
            capacity,
            format_reported: false,
            slots: HashMap::new(),
            next_index: 0,
            outputs: 0,
            fail_after,
        }
    }

    fn kind(&self) -> MediaKind {
        self.format.as_ref().map(|f| f.kind).unwrap_or(MediaKind::Video)
    }
}

impl CodecSession for MockDecoder {
    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<Arc<dyn OutputSurface>>,
    ) -> Result<()> {
        self.format = Some(format.clone());
        self.surface = surface;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            return Err(CodecError::config("not configured"));
        }
        self.started = true;
        Ok(())
    }

    fn submit_input(&mut self, data: Option<&[u8]>, pts_us: i64, eos: bool) -> Result<bool> {
        if !self.started {
            return Err(CodecError::runtime("decoder not started"));
        }
        if self.input.len() >= self.capacity {
            return Ok(false);
        }
        let mut log = lock(&self.log.0);
        if eos {
            log.eos_submitted = true;
        } else {
            log.submitted.push(pts_us);
        }
        let data = data.map(Bytes::copy_from_slice).unwrap_or_default();
        self.input.push_back((pts_us, data, eos));
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<OutputEvent> {
        if !self.started {
            return Ok(OutputEvent::WouldBlock);
        }
        if !self.format_reported {
            if let Some(format) = self.format.as_ref() {
                self.format_reported = true;
                let mut raw = format.clone();
                raw.mime = format!("{}raw", format.kind.mime_prefix());
                raw.codec = None;
                return Ok(OutputEvent::FormatChanged(raw));
            }
        }
        let Some((pts_us, data, eos)) = self.input.pop_front() else {
            return Ok(OutputEvent::WouldBlock);
        };
        if let Some(limit) = self.fail_after {
            if self.outputs >= limit {
                return Err(CodecError::runtime("scripted decode failure"));
            }
        }
        self.outputs += 1;
        let index = self.next_index;
        self.next_index += 1;
        self.slots.insert(index, pts_us);
        let flags = if eos {
            BufferFlags::END_OF_STREAM
        } else {
            BufferFlags::NONE
        };
        Ok(OutputEvent::Data(OutputBuffer {
            index,
            pts_us,
            flags,
            data,
        }))
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<()> {
        let pts_us = self
            .slots
            .remove(&index)
            .ok_or_else(|| CodecError::InvalidArgument(format!("buffer {}", index)))?;
        let kind = self.kind();
        if render {
            lock(&self.log.0).rendered.push((kind, pts_us));
            if let Some(surface) = self.surface.as_ref() {
                let (width, height) = self
                    .format
                    .as_ref()
                    .map(|f| (f.width.max(2), f.height.max(2)))
                    .unwrap_or((2, 2));
                let luma = (pts_us / 1000 % 251) as u8;
                let pixels = Bytes::from(vec![luma; (width * height) as usize]);
                surface.queue_frame(Picture::packed(width, height, Pixel::GRAY8, pixels, pts_us))?;
            }
        } else {
            lock(&self.log.0).dropped.push((kind, pts_us));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.input.clear();
        lock(&self.log.0).released += 1;
    }
}

#[derive(Debug, Default)]
pub struct EncoderRecord {
    pub configured: Option<MediaFormat>,
    pub composed: Vec<i64>,
    pub submitted: Vec<i64>,
    pub end_signalled: bool,
    pub released: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EncoderLog(Arc<Mutex<EncoderRecord>>);

impl EncoderLog {
    /// Format the last encoder was configured with.
    pub fn configured(&self) -> Option<MediaFormat> {
        lock(&self.0).configured.clone()
    }

    pub fn composed(&self) -> Vec<i64> {
        lock(&self.0).composed.clone()
    }

    pub fn submitted(&self) -> Vec<i64> {
        lock(&self.0).submitted.clone()
    }

    pub fn end_signalled(&self) -> bool {
        lock(&self.0).end_signalled
    }

    pub fn released(&self) -> usize {
        lock(&self.0).released
    }
}

type EncodeQueue = Arc<Mutex<VecDeque<(i64, Bytes)>>>;

struct MockInputSurface {
    queue: EncodeQueue,
    log: EncoderLog,
}

impl InputSurface for MockInputSurface {
    fn swap_buffers(&self, frame: ComposedFrame) -> Result<()> {
        let visible = frame.visible()?;
        lock(&self.log.0).composed.push(frame.pts_us);
        lock(&self.queue).push_back((frame.pts_us, visible.planes[0].data.clone()));
        Ok(())
    }

    fn release(&self) {}
}

/// Encoder that emits one unit per input frame, after a format change.
pub struct MockEncoder {
    log: EncoderLog,
    format: Option<MediaFormat>,
    started: bool,
    queue: EncodeQueue,
    capacity: usize,
    end_requested: Arc<AtomicBool>,
    format_reported: bool,
    eos_reported: bool,
    slots: HashSet<usize>,
    next_index: usize,
}

impl MockEncoder {
    pub fn new(log: EncoderLog, capacity: usize) -> Self {
        Self {
            log,
            format: None,
            started: false,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            end_requested: Arc::new(AtomicBool::new(false)),
            format_reported: false,
            eos_reported: false,
            slots: HashSet::new(),
            next_index: 0,
        }
    }

    fn slot(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.slots.insert(index);
        index
    }
}

impl CodecSession for MockEncoder {
    fn configure(
        &mut self,
        format: &MediaFormat,
        _surface: Option<Arc<dyn OutputSurface>>,
    ) -> Result<()> {
        lock(&self.log.0).configured = Some(format.clone());
        self.format = Some(format.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            return Err(CodecError::config("not configured"));
        }
        self.started = true;
        Ok(())
    }

    fn submit_input(&mut self, data: Option<&[u8]>, pts_us: i64, eos: bool) -> Result<bool> {
        if !self.started {
            return Err(CodecError::runtime("encoder not started"));
        }
        if let Some(data) = data {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.capacity {
                return Ok(false);
            }
            queue.push_back((pts_us, Bytes::copy_from_slice(data)));
            lock(&self.log.0).submitted.push(pts_us);
        }
        if eos {
            self.end_requested.store(true, Ordering::SeqCst);
        }
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<OutputEvent> {
        if !self.started {
            return Ok(OutputEvent::WouldBlock);
        }
        if !self.format_reported {
            if let Some(format) = self.format.clone() {
                self.format_reported = true;
                return Ok(OutputEvent::FormatChanged(format));
            }
        }
        let next = lock(&self.queue).pop_front();
        if let Some((pts_us, data)) = next {
            let index = self.slot();
            return Ok(OutputEvent::Data(OutputBuffer {
                index,
                pts_us,
                flags: BufferFlags::KEY_FRAME,
                data,
            }));
        }
        if self.end_requested.load(Ordering::SeqCst) && !self.eos_reported {
            self.eos_reported = true;
            let index = self.slot();
            return Ok(OutputEvent::Data(OutputBuffer {
                index,
                pts_us: 0,
                flags: BufferFlags::END_OF_STREAM,
                data: Bytes::new(),
            }));
        }
        Ok(OutputEvent::WouldBlock)
    }

    fn release_output(&mut self, index: usize, _render: bool) -> Result<()> {
        if self.slots.remove(&index) {
            Ok(())
        } else {
            Err(CodecError::InvalidArgument(format!("buffer {}", index)))
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        lock(&self.log.0).released += 1;
    }
}

impl EncodeSession for MockEncoder {
    fn create_input_surface(&mut self) -> Result<Arc<dyn InputSurface>> {
        Ok(Arc::new(MockInputSurface {
            queue: self.queue.clone(),
            log: self.log.clone(),
        }))
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        lock(&self.log.0).end_signalled = true;
        self.end_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    AddTrack(MediaKind),
    Start,
    Write { track: usize, pts_us: i64, size: usize },
    Stop,
    Release,
}

#[derive(Debug, Clone, Default)]
pub struct MuxLog(Arc<Mutex<Vec<MuxCall>>>);

impl MuxLog {
    pub fn calls(&self) -> Vec<MuxCall> {
        lock(&self.0).clone()
    }

    /// Sample times written to `track`, in order.
    pub fn writes(&self, track: usize) -> Vec<i64> {
        lock(&self.0)
            .iter()
            .filter_map(|c| match c {
                MuxCall::Write { track: t, pts_us, .. } if *t == track => Some(*pts_us),
                _ => None,
            })
            .collect()
    }

    /// Track index assigned to `kind`, in registration order.
    pub fn track_of(&self, kind: MediaKind) -> Option<usize> {
        lock(&self.0)
            .iter()
            .filter_map(|c| match c {
                MuxCall::AddTrack(k) => Some(*k),
                _ => None,
            })
            .position(|k| k == kind)
    }
}

pub struct MockMuxer {
    log: MuxLog,
    tracks: usize,
    writes: usize,
    fail_write_at: Option<usize>,
}

impl MockMuxer {
    pub fn new() -> (Self, MuxLog) {
        let log = MuxLog::default();
        (Self::with_log(log.clone(), None), log)
    }

    pub fn with_log(log: MuxLog, fail_write_at: Option<usize>) -> Self {
        Self {
            log,
            tracks: 0,
            writes: 0,
            fail_write_at,
        }
    }
}

impl Muxer for MockMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        lock(&self.log.0).push(MuxCall::AddTrack(format.kind));
        self.tracks += 1;
        Ok(self.tracks - 1)
    }

    fn start(&mut self) -> Result<()> {
        lock(&self.log.0).push(MuxCall::Start);
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> Result<()> {
        if self.fail_write_at == Some(self.writes) {
            return Err(CodecError::io("scripted write failure"));
        }
        self.writes += 1;
        lock(&self.log.0).push(MuxCall::Write {
            track,
            pts_us: info.pts_us,
            size: data.len(),
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        lock(&self.log.0).push(MuxCall::Stop);
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.log.0).push(MuxCall::Release);
    }
}

/// Backend handing out the mocks above over a fixed set of tracks.
#[derive(Clone)]
pub struct MockBackend {
    tracks: Vec<MockTrack>,
    pub demux_log: DemuxLog,
    pub decoder_log: DecoderLog,
    pub encoder_log: EncoderLog,
    pub mux_log: MuxLog,
    decoder_capacity: usize,
    encoder_capacity: usize,
    fail_decoder: bool,
    decode_fail_after: Option<usize>,
    mux_fail_at: Option<usize>,
}

impl MockBackend {
    pub fn new(tracks: Vec<MockTrack>) -> Self {
        Self {
            tracks,
            demux_log: DemuxLog::default(),
            decoder_log: DecoderLog::default(),
            encoder_log: EncoderLog::default(),
            mux_log: MuxLog::default(),
            decoder_capacity: 4,
            encoder_capacity: 4,
            fail_decoder: false,
            decode_fail_after: None,
            mux_fail_at: None,
        }
    }

    pub fn with_failing_decoder(mut self) -> Self {
        self.fail_decoder = true;
        self
    }

    pub fn with_decode_failure_after(mut self, outputs: usize) -> Self {
        self.decode_fail_after = Some(outputs);
        self
    }

    pub fn with_mux_failure_at(mut self, write: usize) -> Self {
        self.mux_fail_at = Some(write);
        self
    }

    pub fn with_encoder_capacity(mut self, capacity: usize) -> Self {
        self.encoder_capacity = capacity;
        self
    }
}

impl CodecBackend for MockBackend {
    fn open_source(&self, uri: &str) -> Result<Box<dyn Demuxer>> {
        if uri == "missing" {
            return Err(CodecError::io("no such source"));
        }
        Ok(Box::new(MockDemuxer::new(
            self.tracks.clone(),
            self.demux_log.clone(),
        )))
    }

    fn create_decoder(&self, format: &MediaFormat) -> Result<Box<dyn CodecSession>> {
        if self.fail_decoder {
            return Err(CodecError::config(format!("no decoder for {}", format.mime)));
        }
        Ok(Box::new(MockDecoder::new(
            self.decoder_log.clone(),
            self.decoder_capacity,
            self.decode_fail_after,
        )))
    }

    fn create_encoder(&self, _format: &MediaFormat) -> Result<Box<dyn EncodeSession>> {
        Ok(Box::new(MockEncoder::new(
            self.encoder_log.clone(),
            self.encoder_capacity,
        )))
    }

    fn create_muxer(&self, _uri: &str) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(MockMuxer::with_log(
            self.mux_log.clone(),
            self.mux_fail_at,
        )))
    }
}
