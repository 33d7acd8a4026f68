use crate::{error::Result, format::MediaFormat, packet::SampleInfo};

/// Container writer. Tracks must be added before `start`.
pub trait Muxer: Send {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn release(&mut self);
}
