use std::sync::Arc;

use bytes::Bytes;

use crate::{
    compositor::ComposedFrame,
    demuxer::Demuxer,
    error::Result,
    format::MediaFormat,
    frame::Picture,
    muxer::Muxer,
    packet::{BufferFlags, SampleInfo},
};

/// A decoded or encoded buffer handed out by [`CodecSession::poll_output`].
/// The session keeps the slot until [`CodecSession::release_output`] is called
/// with `index`.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub pts_us: i64,
    pub flags: BufferFlags,
    pub data: Bytes,
}

impl OutputBuffer {
    pub fn is_eos(&self) -> bool {
        self.flags.is_eos()
    }

    pub fn info(&self) -> SampleInfo {
        SampleInfo::new(self.data.len(), self.pts_us, self.flags)
    }
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    Data(OutputBuffer),
    FormatChanged(MediaFormat),
    /// Nothing available right now; poll again later.
    WouldBlock,
}

/// Destination for decoded pictures when a decoder is configured with a
/// surface. A picture is queued only when its buffer is released with
/// `render == true`.
pub trait OutputSurface: Send + Sync {
    fn queue_frame(&self, picture: Picture) -> Result<()>;
}

/// Surface owned by a video encoder; each swap submits one frame for encoding.
pub trait InputSurface: Send + Sync {
    fn swap_buffers(&self, frame: ComposedFrame) -> Result<()>;
    fn release(&self);
}

/// Opaque decode or encode unit. All calls are non-blocking.
pub trait CodecSession: Send {
    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<Arc<dyn OutputSurface>>,
    ) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Queues one input unit. Returns `false` when no input slot is free; the
    /// caller must retry the same unit later. `data == None` with `eos` set
    /// queues an end-of-stream marker.
    fn submit_input(&mut self, data: Option<&[u8]>, pts_us: i64, eos: bool) -> Result<bool>;

    fn poll_output(&mut self) -> Result<OutputEvent>;

    fn release_output(&mut self, index: usize, render: bool) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);
}

/// Surface-fed video encoder.
pub trait EncodeSession: CodecSession {
    /// Valid after `configure` and before `start`.
    fn create_input_surface(&mut self) -> Result<Arc<dyn InputSurface>>;

    fn signal_end_of_input(&mut self) -> Result<()>;
}

/// Factory for every external collaborator the engines drive.
pub trait CodecBackend: Send + Sync {
    fn open_source(&self, uri: &str) -> Result<Box<dyn Demuxer>>;

    fn create_decoder(&self, format: &MediaFormat) -> Result<Box<dyn CodecSession>>;

    /// Encoder for `format`: a video format yields a surface-fed session, an
    /// audio format a buffer-fed one (surface creation then fails).
    fn create_encoder(&self, format: &MediaFormat) -> Result<Box<dyn EncodeSession>>;

    fn create_muxer(&self, uri: &str) -> Result<Box<dyn Muxer>>;
}
