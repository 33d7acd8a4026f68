use ffmpeg_next::{
    format::Pixel,
    software::scaling::{Context, flag::Flags},
};

use crate::error::Result;

/// Software scaler converting composed frames to the encoder's size and pixel
/// format. Rebuilt whenever the source geometry changes.
pub struct Scaler {
    context: Context,
    source: (Pixel, u32, u32),
}

// The scaling context is only used by the thread that owns the scaler.
unsafe impl Send for Scaler {}

impl Scaler {
    pub fn new(source: (Pixel, u32, u32), target: (Pixel, u32, u32)) -> Result<Self> {
        let context = Context::get(
            source.0,
            source.1,
            source.2,
            target.0,
            target.1,
            target.2,
            Flags::BILINEAR,
        )?;
        Ok(Self { context, source })
    }

    pub fn matches(&self, format: Pixel, width: u32, height: u32) -> bool {
        self.source == (format, width, height)
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> Result<()> {
        self.context.run(frame, dst)?;
        Ok(())
    }
}
