use crate::{
    error::Result,
    format::{MediaFormat, MediaKind},
    packet::SampleInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest sample to the requested time.
    Closest,
    /// Last sync sample at or before the requested time.
    PreviousSync,
}

/// Container reader. Only selected tracks are returned by `read_sample`.
pub trait Demuxer: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Result<MediaFormat>;

    fn select_track(&mut self, index: usize) -> Result<()>;

    /// Copies the current sample into `buf` without advancing. `None` at end of
    /// input.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>>;

    /// Moves to the next sample. Returns `false` at end of input.
    fn advance(&mut self) -> Result<bool>;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<()>;

    /// Presentation time of the current sample, `None` at end of input.
    fn sample_time(&mut self) -> Result<Option<i64>>;

    fn release(&mut self);
}

/// Index and format of the first track of `kind`.
pub fn find_track(demuxer: &dyn Demuxer, kind: MediaKind) -> Result<Option<(usize, MediaFormat)>> {
    for index in 0..demuxer.track_count() {
        let format = demuxer.track_format(index)?;
        if format.kind == kind {
            return Ok(Some((index, format)));
        }
    }
    Ok(None)
}
