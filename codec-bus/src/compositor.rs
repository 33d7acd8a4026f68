//! Compositor bridge between a decoder's output surface and an encoder's
//! input surface.
//!
//! The decoder renders into a [`FrameTexture`]; each [`Compositor::composite`]
//! call latches the newest picture, runs the drawer chain over it and swaps
//! the result into the encoder, stamped with the decoded presentation time.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::{
    error::{CodecError, Result},
    frame::{Picture, PixelRect},
    session::{InputSurface, OutputSurface},
};

/// Normalized texture coordinates, `0.0..=1.0` on both axes, origin top left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl TexRect {
    pub const FULL: TexRect = TexRect {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    /// `inner` expressed relative to this rectangle.
    pub fn sub_rect(&self, inner: &TexRect) -> TexRect {
        TexRect {
            left: self.left + inner.left * self.width(),
            top: self.top + inner.top * self.height(),
            right: self.left + inner.right * self.width(),
            bottom: self.top + inner.bottom * self.height(),
        }
    }

    /// Pixel rectangle covered inside a `width`x`height` image.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let x = (self.left * width as f32).round().max(0.0) as u32;
        let y = (self.top * height as f32).round().max(0.0) as u32;
        let right = ((self.right * width as f32).round() as u32).min(width);
        let bottom = ((self.bottom * height as f32).round() as u32).min(height);
        PixelRect {
            x,
            y,
            width: right.saturating_sub(x).max(1),
            height: bottom.saturating_sub(y).max(1),
        }
    }
}

/// Texture sub-rectangle selecting a `crop_w`x`crop_h` window at
/// (`margin_left`, `margin_top`) of an `origin_w`x`origin_h` picture.
pub fn crop_coordinates(
    origin_w: u32,
    origin_h: u32,
    crop_w: u32,
    crop_h: u32,
    margin_left: u32,
    margin_top: u32,
) -> TexRect {
    let ow = origin_w as f32;
    let oh = origin_h as f32;
    TexRect {
        left: margin_left as f32 / ow,
        top: margin_top as f32 / oh,
        right: (margin_left + crop_w) as f32 / ow,
        bottom: (margin_top + crop_h) as f32 / oh,
    }
}

/// A frame handed to an encoder input surface.
#[derive(Debug, Clone)]
pub struct ComposedFrame {
    pub picture: Picture,
    /// Part of `picture` to encode.
    pub region: TexRect,
    /// Size of the encoder surface.
    pub viewport: (u32, u32),
    pub pts_us: i64,
}

impl ComposedFrame {
    /// The pixels inside `region`.
    pub fn visible(&self) -> Result<Picture> {
        let picture = if self.region.is_full() {
            self.picture.clone()
        } else {
            let rect = self.region.to_pixels(self.picture.width, self.picture.height);
            self.picture.crop(rect)?
        };
        Ok(picture.with_pts(self.pts_us))
    }
}

/// Decoder-side texture. Holds the most recently rendered picture until the
/// compositor latches it.
#[derive(Default)]
pub struct FrameTexture {
    pending: Mutex<Option<Picture>>,
}

impl FrameTexture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches the newest picture, if one arrived since the last call.
    pub fn update_tex_image(&self) -> Option<Picture> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }
}

impl OutputSurface for FrameTexture {
    fn queue_frame(&self, picture: Picture) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CodecError::runtime("frame texture poisoned"))?;
        *pending = Some(picture);
        Ok(())
    }
}

/// Working state passed along the drawer chain.
pub struct Canvas {
    pub picture: Picture,
    pub region: TexRect,
    pub viewport: (u32, u32),
    pub pts_us: i64,
}

pub trait Drawer: Send {
    /// Called once with the encoder surface size when the drawer is attached.
    fn on_config(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn draw(&mut self, canvas: &mut Canvas) -> Result<()>;

    fn release(&mut self) {}
}

/// Crops the picture to a fixed window of the source.
#[derive(Debug, Clone)]
pub struct ClipDrawer {
    rect: TexRect,
}

impl ClipDrawer {
    pub fn new(
        origin_w: u32,
        origin_h: u32,
        crop_w: u32,
        crop_h: u32,
        margin_left: u32,
        margin_top: u32,
    ) -> Result<Self> {
        if origin_w == 0 || origin_h == 0 || crop_w == 0 || crop_h == 0 {
            return Err(CodecError::config(format!(
                "empty crop {}x{} of {}x{}",
                crop_w, crop_h, origin_w, origin_h
            )));
        }
        if margin_left + crop_w > origin_w || margin_top + crop_h > origin_h {
            return Err(CodecError::config(format!(
                "crop {}x{}+{}+{} exceeds source {}x{}",
                crop_w, crop_h, margin_left, margin_top, origin_w, origin_h
            )));
        }
        Ok(Self {
            rect: crop_coordinates(origin_w, origin_h, crop_w, crop_h, margin_left, margin_top),
        })
    }

    pub fn rect(&self) -> TexRect {
        self.rect
    }
}

impl Drawer for ClipDrawer {
    fn draw(&mut self, canvas: &mut Canvas) -> Result<()> {
        canvas.region = canvas.region.sub_rect(&self.rect);
        Ok(())
    }
}

/// Runs `inner` only for frames whose time falls in `window`.
pub struct TimeWindowDrawer<D> {
    inner: D,
    window: Range<i64>,
}

impl<D: Drawer> TimeWindowDrawer<D> {
    pub fn new(inner: D, window: Range<i64>) -> Self {
        Self { inner, window }
    }
}

impl<D: Drawer> Drawer for TimeWindowDrawer<D> {
    fn on_config(&mut self, width: u32, height: u32) -> Result<()> {
        self.inner.on_config(width, height)
    }

    fn draw(&mut self, canvas: &mut Canvas) -> Result<()> {
        if self.window.contains(&canvas.pts_us) {
            self.inner.draw(canvas)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner.release();
    }
}

pub struct Compositor {
    texture: Arc<FrameTexture>,
    surface: Arc<dyn InputSurface>,
    drawers: Vec<Box<dyn Drawer>>,
    width: u32,
    height: u32,
    composed: u64,
}

impl Compositor {
    pub fn new(surface: Arc<dyn InputSurface>, width: u32, height: u32) -> Self {
        Self {
            texture: Arc::new(FrameTexture::new()),
            surface,
            drawers: Vec::new(),
            width,
            height,
            composed: 0,
        }
    }

    pub fn add_drawer(&mut self, mut drawer: Box<dyn Drawer>) -> Result<()> {
        drawer.on_config(self.width, self.height)?;
        self.drawers.push(drawer);
        Ok(())
    }

    /// Surface to configure the decoder with.
    pub fn texture(&self) -> Arc<dyn OutputSurface> {
        self.texture.clone()
    }

    pub fn composed(&self) -> u64 {
        self.composed
    }

    /// Submits the latched picture to the encoder stamped with `pts_us`.
    /// Returns `false` when no picture was rendered since the last call.
    pub fn composite(&mut self, pts_us: i64) -> Result<bool> {
        let Some(picture) = self.texture.update_tex_image() else {
            return Ok(false);
        };
        let mut canvas = Canvas {
            picture,
            region: TexRect::FULL,
            viewport: (self.width, self.height),
            pts_us,
        };
        for drawer in self.drawers.iter_mut() {
            drawer.draw(&mut canvas)?;
        }
        self.surface.swap_buffers(ComposedFrame {
            picture: canvas.picture,
            region: canvas.region,
            viewport: canvas.viewport,
            pts_us,
        })?;
        self.composed += 1;
        Ok(true)
    }

    pub fn release(&mut self) {
        for drawer in self.drawers.iter_mut() {
            drawer.release();
        }
        self.drawers.clear();
        self.surface.release();
    }
}
