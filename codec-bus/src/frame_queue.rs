//! Buffer-fed encoder driven from an out-of-band frame source, e.g. a mixing
//! stage producing PCM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CodecError, Result},
    format::MediaFormat,
    join::CompletionJoin,
    packet::EncodedUnit,
    session::{CodecBackend, EncodeSession, OutputEvent},
    sync_muxer::SyncMuxer,
    timing::Timing,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// FIFO of frames awaiting encode. An end-of-stream unit is the stop
/// sentinel.
pub struct FrameQueue {
    tx: Sender<EncodedUnit>,
    rx: Receiver<EncodedUnit>,
}

impl FrameQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, unit: EncodedUnit) {
        // both ends live in self, so the channel never disconnects
        if let Err(e) = self.tx.send(unit) {
            log::warn!("frame queue closed: {}", e);
        }
    }

    /// Oldest unit, waiting at most `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<EncodedUnit> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Ready,
    End,
    Error(String),
}

type SharedSession = Arc<Mutex<Box<dyn EncodeSession>>>;

pub struct FrameQueueEncoder {
    format: MediaFormat,
    muxer: Arc<SyncMuxer>,
    backend: Arc<dyn CodecBackend>,
    handle: Handle,
    auto_encode: bool,
    timing: Timing,
    queue: Arc<FrameQueue>,
    session: Mutex<Option<SharedSession>>,
    encoding: AtomicBool,
    spawned: AtomicBool,
    failed: Arc<AtomicBool>,
    cancel: CancellationToken,
    events: broadcast::Sender<EncoderEvent>,
}

impl FrameQueueEncoder {
    pub fn new(
        format: MediaFormat,
        muxer: Arc<SyncMuxer>,
        backend: Arc<dyn CodecBackend>,
        handle: Handle,
        auto_encode: bool,
        timing: Timing,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            format,
            muxer,
            backend,
            handle,
            auto_encode,
            timing,
            queue: Arc::new(FrameQueue::new()),
            session: Mutex::new(None),
            encoding: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            failed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EncoderEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EncoderEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: CodecError) -> CodecError {
        log::error!("{} encoder: {}", self.format.kind, err);
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.emit(EncoderEvent::Error(err.to_string()));
        }
        err
    }

    /// Creates and configures the session. Starts it with auto-encode,
    /// otherwise emits `Ready` and waits for [`Self::start_encoder`].
    pub fn prepare(&self) -> Result<()> {
        let mut slot = lock(&self.session);
        if slot.is_some() {
            return Err(CodecError::InvalidArgument("encoder already prepared".to_string()));
        }
        let mut session = self
            .backend
            .create_encoder(&self.format)
            .map_err(|e| self.report(e))?;
        if let Err(err) = session.configure(&self.format, None) {
            session.release();
            return Err(self.report(err));
        }
        *slot = Some(Arc::new(Mutex::new(session)));
        drop(slot);
        log::info!("{} encoder prepared: {}", self.format.kind, self.format.mime);
        if self.auto_encode {
            self.start_encoder()
        } else {
            self.emit(EncoderEvent::Ready);
            Ok(())
        }
    }

    pub fn start_encoder(&self) -> Result<()> {
        let session = lock(&self.session)
            .clone()
            .ok_or_else(|| CodecError::InvalidArgument("encoder not prepared".to_string()))?;
        if self.encoding.load(Ordering::Acquire) {
            return Ok(());
        }
        lock(&session).start().map_err(|e| self.report(e))?;
        self.encoding.store(true, Ordering::Release);
        log::info!("{} encoder started", self.format.kind);
        if !self.queue.is_empty() {
            self.spawn(session);
        }
        Ok(())
    }

    /// Queues one frame; the pump threads start with the first one.
    pub fn enqueue(&self, unit: EncodedUnit) {
        self.queue.push(unit);
        if !self.encoding.load(Ordering::Acquire) {
            return;
        }
        if let Some(session) = lock(&self.session).clone() {
            self.spawn(session);
        }
    }

    pub fn push_frame(&self, data: bytes::Bytes, pts_us: i64) {
        self.enqueue(EncodedUnit::new(data, pts_us, Default::default()));
    }

    /// Queues the stop sentinel; the encoder drains and ends after every
    /// frame queued before it.
    pub fn stop_encoder(&self) {
        log::debug!("{} encoder stop requested", self.format.kind);
        self.enqueue(EncodedUnit::end_of_stream());
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn spawn(&self, session: SharedSession) {
        if self.spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        let kind = self.format.kind;
        let join = {
            let session = session.clone();
            let muxer = self.muxer.clone();
            let failed = self.failed.clone();
            let events = self.events.clone();
            Arc::new(CompletionJoin::new(2, move || {
                lock(&session).release();
                if let Err(err) = muxer.close_track(kind) {
                    log::error!("closing {} track: {}", kind, err);
                }
                if !failed.load(Ordering::Acquire) {
                    log::info!("{} encoder ended", kind);
                    let _ = events.send(EncoderEvent::End);
                }
            }))
        };
        let pump = Arc::new(Pump {
            session,
            queue: self.queue.clone(),
            muxer: self.muxer.clone(),
            format: self.format.clone(),
            timing: self.timing.clone(),
            failed: self.failed.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        });
        for feeder in [true, false] {
            let pump = pump.clone();
            let join = join.clone();
            self.handle.spawn_blocking(move || {
                let res = if feeder { pump.feed() } else { pump.drain() };
                if let Err(err) = res {
                    pump.fail(&err);
                }
                join.arrive();
            });
        }
    }
}

impl Drop for FrameQueueEncoder {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.spawned.load(Ordering::Acquire) {
            if let Some(session) = lock(&self.session).take() {
                lock(&session).release();
            }
        }
    }
}

struct Pump {
    session: SharedSession,
    queue: Arc<FrameQueue>,
    muxer: Arc<SyncMuxer>,
    format: MediaFormat,
    timing: Timing,
    failed: Arc<AtomicBool>,
    cancel: CancellationToken,
    events: broadcast::Sender<EncoderEvent>,
}

impl Pump {
    fn fail(&self, err: &CodecError) {
        log::error!("{} encoder loop error: {}", self.format.kind, err);
        if !self.failed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(EncoderEvent::Error(err.to_string()));
        }
    }

    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.failed.load(Ordering::Acquire)
    }

    fn feed(&self) -> Result<()> {
        loop {
            if self.halted() {
                return Ok(());
            }
            let Some(unit) = self.queue.pop_timeout(self.timing.poll_interval) else {
                continue;
            };
            let data = unit.data().map(|d| &d[..]);
            let eos = unit.is_eos();
            // no free input slot: retry the same frame
            while !lock(&self.session).submit_input(data, unit.pts_us(), eos)? {
                if self.halted() {
                    return Ok(());
                }
                std::thread::sleep(self.timing.output_poll);
            }
            if eos {
                log::debug!("{} encoder input ended", self.format.kind);
                return Ok(());
            }
        }
    }

    fn drain(&self) -> Result<()> {
        loop {
            if self.halted() {
                return Ok(());
            }
            let event = lock(&self.session).poll_output()?;
            match event {
                OutputEvent::WouldBlock => std::thread::sleep(self.timing.output_poll),
                OutputEvent::FormatChanged(format) => {
                    log::debug!("{} encoder output format {}", format.kind, format.mime);
                    self.muxer.add_track(&format)?;
                }
                OutputEvent::Data(buffer) => {
                    if buffer.is_eos() {
                        lock(&self.session).release_output(buffer.index, false)?;
                        return Ok(());
                    }
                    let written = self.muxer.write(self.format.kind, &buffer.data, &buffer.info());
                    lock(&self.session).release_output(buffer.index, false)?;
                    if !written? {
                        log::debug!(
                            "{} unit at {} us dropped before mux start",
                            self.format.kind,
                            buffer.pts_us
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::runtime::Handle;

    use super::*;
    use crate::format::MediaKind;
    use crate::testing::{MockBackend, MuxCall, collect_until, next_event};

    const WAIT: Duration = Duration::from_secs(10);

    fn encoder(backend: &MockBackend, auto_encode: bool) -> anyhow::Result<FrameQueueEncoder> {
        let muxer = Arc::new(SyncMuxer::new(backend.create_muxer("out.m4a")?));
        muxer.set_no_video()?;
        Ok(FrameQueueEncoder::new(
            MediaFormat::audio("audio/aac", 44_100, 2),
            muxer,
            Arc::new(backend.clone()),
            Handle::current(),
            auto_encode,
            Timing::default(),
        ))
    }

    #[test]
    fn test_queue_fifo_and_timeout() {
        let queue = FrameQueue::new();
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
        queue.push(EncodedUnit::new(Bytes::from_static(b"a"), 1, Default::default()));
        queue.push(EncodedUnit::end_of_stream());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_timeout(Duration::ZERO).map(|u| u.pts_us()), Some(1));
        assert!(queue.pop_timeout(Duration::ZERO).is_some_and(|u| u.is_eos()));
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_encoded_in_order() -> anyhow::Result<()> {
        let backend = MockBackend::new(vec![]).with_encoder_capacity(1);
        let encoder = encoder(&backend, true)?;
        let mut rx = encoder.subscribe();

        encoder.prepare()?;
        for i in 0..20 {
            encoder.push_frame(Bytes::from(vec![i as u8; 8]), i * 23_000);
        }
        encoder.stop_encoder();

        let events = collect_until(&mut rx, WAIT, |e| *e == EncoderEvent::End).await;
        assert_eq!(events.last(), Some(&EncoderEvent::End));

        let expected: Vec<i64> = (0..20).map(|i| i * 23_000).collect();
        assert_eq!(backend.encoder_log.submitted(), expected);
        let track = backend.mux_log.track_of(MediaKind::Audio).expect("audio track");
        assert_eq!(backend.mux_log.writes(track), expected);
        let calls = backend.mux_log.calls();
        assert_eq!(calls.last(), Some(&MuxCall::Release));
        assert!(calls.contains(&MuxCall::Stop));
        assert_eq!(backend.encoder_log.released(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waits_for_start_encoder() -> anyhow::Result<()> {
        let backend = MockBackend::new(vec![]);
        let encoder = encoder(&backend, false)?;
        let mut rx = encoder.subscribe();

        encoder.prepare()?;
        assert_eq!(next_event(&mut rx, WAIT).await, Some(EncoderEvent::Ready));
        encoder.push_frame(Bytes::from_static(b"pcm"), 0);
        encoder.stop_encoder();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(encoder.pending(), 2);
        assert!(backend.encoder_log.submitted().is_empty());

        encoder.start_encoder()?;
        let events = collect_until(&mut rx, WAIT, |e| *e == EncoderEvent::End).await;
        assert_eq!(events.last(), Some(&EncoderEvent::End));
        assert_eq!(backend.encoder_log.submitted(), vec![0]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mux_failure_reports_error() -> anyhow::Result<()> {
        let backend = MockBackend::new(vec![]).with_mux_failure_at(2);
        let encoder = encoder(&backend, true)?;
        let mut rx = encoder.subscribe();

        encoder.prepare()?;
        for i in 0..10 {
            encoder.push_frame(Bytes::from_static(b"pcm"), i * 1_000);
        }
        encoder.stop_encoder();

        let event = next_event(&mut rx, WAIT).await;
        assert!(matches!(event, Some(EncoderEvent::Error(_))));
        assert_eq!(backend.mux_log.writes(0).len(), 2);
        assert_ne!(
            next_event(&mut rx, Duration::from_millis(200)).await,
            Some(EncoderEvent::End)
        );
        Ok(())
    }
}
