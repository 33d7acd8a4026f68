use std::sync::{Mutex, MutexGuard};

use crate::{
    error::{CodecError, Result},
    format::{MediaFormat, MediaKind},
    muxer::Muxer,
    packet::SampleInfo,
};

#[derive(Debug, Default)]
struct TrackSlot {
    expected: bool,
    track: Option<usize>,
    done: bool,
}

impl TrackSlot {
    fn expected() -> Self {
        Self {
            expected: true,
            track: None,
            done: false,
        }
    }

    fn ready(&self) -> bool {
        !self.expected || self.track.is_some()
    }
}

struct Inner {
    muxer: Box<dyn Muxer>,
    video: TrackSlot,
    audio: TrackSlot,
    started: bool,
    finalized: bool,
    dropped: u64,
}

impl Inner {
    fn slot(&mut self, kind: MediaKind) -> &mut TrackSlot {
        match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        }
    }

    fn try_start(&mut self) -> Result<()> {
        if self.started || self.finalized {
            return Ok(());
        }
        if !(self.video.expected || self.audio.expected) {
            return Ok(());
        }
        if self.video.ready() && self.audio.ready() {
            self.muxer.start()?;
            self.started = true;
            log::info!("muxer started");
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let res = if self.started { self.muxer.stop() } else { Ok(()) };
        self.muxer.release();
        if self.dropped > 0 {
            log::debug!("muxer dropped {} samples written before start", self.dropped);
        }
        log::info!("muxer finalized");
        res
    }
}

/// Container writer gated on track registration.
///
/// Every expected track registers once; the writer starts when all of them
/// have. Writes before that are dropped without error. Each track closes
/// independently and the writer is finalized once all tracks are done.
pub struct SyncMuxer {
    inner: Mutex<Inner>,
}

impl SyncMuxer {
    /// Expects a video and an audio track.
    pub fn new(muxer: Box<dyn Muxer>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                muxer,
                video: TrackSlot::expected(),
                audio: TrackSlot::expected(),
                started: false,
                finalized: false,
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The output has no audio track.
    pub fn set_no_audio(&self) -> Result<()> {
        self.set_absent(MediaKind::Audio)
    }

    /// The output has no video track.
    pub fn set_no_video(&self) -> Result<()> {
        self.set_absent(MediaKind::Video)
    }

    fn set_absent(&self, kind: MediaKind) -> Result<()> {
        let mut inner = self.lock();
        if inner.started {
            return Err(CodecError::InvalidArgument(format!(
                "{} track removed after start",
                kind
            )));
        }
        let slot = inner.slot(kind);
        slot.expected = false;
        slot.done = true;
        inner.try_start()
    }

    /// Registers the track for `format.kind`. Repeated or unexpected
    /// registrations are ignored.
    pub fn add_track(&self, format: &MediaFormat) -> Result<()> {
        let mut inner = self.lock();
        if inner.started || inner.finalized {
            log::debug!("ignoring {} track registered after start", format.kind);
            return Ok(());
        }
        let slot = inner.slot(format.kind);
        if !slot.expected || slot.track.is_some() {
            return Ok(());
        }
        let track = inner.muxer.add_track(format)?;
        inner.slot(format.kind).track = Some(track);
        log::debug!("registered {} track {}", format.kind, track);
        inner.try_start()
    }

    /// Writes one sample. Returns `false` when the sample was dropped because
    /// the writer has not started (or already finished).
    pub fn write(&self, kind: MediaKind, data: &[u8], info: &SampleInfo) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.started || inner.finalized {
            inner.dropped += 1;
            return Ok(false);
        }
        let Some(track) = inner.slot(kind).track else {
            return Ok(false);
        };
        inner.muxer.write_sample(track, data, info)?;
        Ok(true)
    }

    pub fn write_video_data(&self, data: &[u8], info: &SampleInfo) -> Result<bool> {
        self.write(MediaKind::Video, data, info)
    }

    pub fn write_audio_data(&self, data: &[u8], info: &SampleInfo) -> Result<bool> {
        self.write(MediaKind::Audio, data, info)
    }

    /// Marks the track done; finalizes once every track is. Returns whether
    /// this call finalized the writer.
    pub fn close_track(&self, kind: MediaKind) -> Result<bool> {
        let mut inner = self.lock();
        inner.slot(kind).done = true;
        if inner.video.done && inner.audio.done && !inner.finalized {
            inner.finalize()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stops the writer if it started and releases it. Idempotent.
    pub fn finalize(&self) -> Result<()> {
        self.lock().finalize()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }
}

impl Drop for SyncMuxer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if !inner.finalized {
            inner.finalized = true;
            inner.muxer.release();
        }
    }
}
