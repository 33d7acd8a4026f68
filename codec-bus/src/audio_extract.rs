use crate::{
    demuxer::{Demuxer, find_track},
    error::Result,
    format::{MediaFormat, MediaKind},
    pacing::percent,
    session::CodecBackend,
    sync_muxer::SyncMuxer,
};

/// Copies the compressed audio track of a source straight into a muxer,
/// without decoding. Reads through its own demuxer so that it advances
/// independently of the video path.
pub struct AudioPassThrough {
    demuxer: Box<dyn Demuxer>,
    format: MediaFormat,
    buf: Vec<u8>,
    position_us: i64,
    samples: u64,
    done: bool,
    released: bool,
}

impl AudioPassThrough {
    /// `None` when the source has no audio track.
    pub fn open(backend: &dyn CodecBackend, uri: &str) -> Result<Option<Self>> {
        let mut demuxer = backend.open_source(uri)?;
        let found = match find_track(demuxer.as_ref(), MediaKind::Audio) {
            Ok(Some((track, format))) => demuxer.select_track(track).map(|_| Some(format)),
            other => other.map(|_| None),
        };
        match found {
            Ok(Some(format)) => {
                log::debug!("audio pass-through of {}: {}", uri, format.mime);
                Ok(Some(Self {
                    demuxer,
                    format,
                    buf: Vec::new(),
                    position_us: 0,
                    samples: 0,
                    done: false,
                    released: false,
                }))
            }
            Ok(None) => {
                demuxer.release();
                Ok(None)
            }
            Err(err) => {
                demuxer.release();
                Err(err)
            }
        }
    }

    /// Source track format, used to register the muxer track.
    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn position_us(&self) -> i64 {
        self.position_us
    }

    pub fn progress(&self) -> f32 {
        if self.done {
            100.0
        } else {
            percent(self.position_us, self.format.duration_us)
        }
    }

    /// Forwards one sample to `muxer`. At end of input the audio track is
    /// closed and `false` returned.
    pub fn step(&mut self, muxer: &SyncMuxer) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        match self.demuxer.read_sample(&mut self.buf)? {
            Some(info) => {
                muxer.write_audio_data(&self.buf, &info)?;
                self.position_us = info.pts_us;
                self.samples += 1;
                self.demuxer.advance()?;
                Ok(true)
            }
            None => {
                self.done = true;
                log::debug!("audio pass-through done after {} samples", self.samples);
                muxer.close_track(MediaKind::Audio)?;
                Ok(false)
            }
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.demuxer.release();
        }
    }
}

impl Drop for AudioPassThrough {
    fn drop(&mut self) {
        self.release();
    }
}
