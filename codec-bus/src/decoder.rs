use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next::{
    codec::packet::Packet,
    format::{Sample, sample::Type},
    util::mathematics::rescale::TIME_BASE,
};

use crate::{
    error::{CodecError, Result},
    format::{MediaFormat, MediaKind},
    frame::Picture,
    hw::find_hw_decoder,
    packet::BufferFlags,
    session::{CodecSession, OutputBuffer, OutputEvent, OutputSurface},
};

/// Decoded buffers the caller may hold before the decoder stalls.
const MAX_OUTPUT_SLOTS: usize = 8;

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

enum Decoded {
    Video(ffmpeg_next::frame::Video),
    Audio(ffmpeg_next::frame::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &Packet) -> std::result::Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(decoder) => decoder.send_packet(packet),
            DecoderType::Audio(decoder) => decoder.send_packet(packet),
        }
    }

    fn send_eof(&mut self) -> std::result::Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(decoder) => decoder.send_eof(),
            DecoderType::Audio(decoder) => decoder.send_eof(),
        }
    }

    fn receive_frame(&mut self) -> std::result::Result<Decoded, ffmpeg_next::Error> {
        match self {
            DecoderType::Video(decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                decoder.receive_frame(&mut frame)?;
                Ok(Decoded::Video(frame))
            }
            DecoderType::Audio(decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                decoder.receive_frame(&mut frame)?;
                Ok(Decoded::Audio(frame))
            }
        }
    }
}

fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

fn audio_channels(frame: &ffmpeg_next::frame::Audio) -> usize {
    unsafe { (*frame.as_ptr()).ch_layout.nb_channels.max(1) as usize }
}

/// Interleaved signed 16 bit little endian PCM of an audio frame.
fn pcm_s16le(frame: &ffmpeg_next::frame::Audio) -> Bytes {
    let samples = frame.samples();
    let channels = audio_channels(frame);
    let mut out = Vec::with_capacity(samples * channels * 2);

    let read_f32 = |plane: &[u8], i: usize| -> i16 {
        let b = &plane[i * 4..i * 4 + 4];
        let v = f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
        (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    };
    let read_i16 = |plane: &[u8], i: usize| -> i16 {
        i16::from_ne_bytes([plane[i * 2], plane[i * 2 + 1]])
    };

    match frame.format() {
        Sample::I16(Type::Packed) => {
            let plane = frame.data(0);
            for i in 0..samples * channels {
                out.extend_from_slice(&read_i16(plane, i).to_le_bytes());
            }
        }
        Sample::I16(Type::Planar) => {
            for i in 0..samples {
                for ch in 0..channels {
                    out.extend_from_slice(&read_i16(frame.data(ch), i).to_le_bytes());
                }
            }
        }
        Sample::F32(Type::Packed) => {
            let plane = frame.data(0);
            for i in 0..samples * channels {
                out.extend_from_slice(&read_f32(plane, i).to_le_bytes());
            }
        }
        Sample::F32(Type::Planar) => {
            for i in 0..samples {
                for ch in 0..channels {
                    out.extend_from_slice(&read_f32(frame.data(ch), i).to_le_bytes());
                }
            }
        }
        other => {
            log::trace!("passing {:?} audio through unconverted", other);
            out.extend_from_slice(frame.data(0));
        }
    }
    Bytes::from(out)
}

enum Slot {
    Picture(Picture),
    Empty,
}

/// Decode session over an ffmpeg decoder. Input and output times are
/// microseconds. The first decoded frame, and any later geometry change, is
/// announced with [`OutputEvent::FormatChanged`] before its data.
pub struct FfmpegDecoder {
    inner: Option<DecoderType>,
    codec_name: String,
    kind: MediaKind,
    duration_us: i64,
    frame_rate: u32,
    surface: Option<Arc<dyn OutputSurface>>,
    started: bool,
    held: Option<Decoded>,
    reported: Option<(u32, u32, u32)>,
    eos_reported: bool,
    slots: HashMap<usize, Slot>,
    next_index: usize,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            inner: None,
            codec_name: String::new(),
            kind: MediaKind::Video,
            duration_us: 0,
            frame_rate: 0,
            surface: None,
            started: false,
            held: None,
            reported: None,
            eos_reported: false,
            slots: HashMap::new(),
            next_index: 0,
        }
    }

    fn open(format: &MediaFormat, hw: Option<ffmpeg_next::Codec>) -> Result<DecoderType> {
        let codec = format
            .codec
            .as_ref()
            .ok_or_else(|| CodecError::config(format!("no codec parameters for {}", format.mime)))?;
        let mut ctx = ffmpeg_next::codec::Context::from_parameters(codec.parameters().clone())
            .map_err(CodecError::config)?;
        unsafe {
            (*ctx.as_mut_ptr()).pkt_timebase = TIME_BASE.into();
            (*ctx.as_mut_ptr()).time_base = TIME_BASE.into();
        }
        let decoder = ctx.decoder();
        let opened = match (format.kind, hw) {
            (MediaKind::Video, Some(codec)) => DecoderType::Video(
                decoder
                    .open_as(codec)
                    .and_then(|o| o.video())
                    .map_err(CodecError::config)?,
            ),
            (MediaKind::Video, None) => {
                DecoderType::Video(decoder.video().map_err(CodecError::config)?)
            }
            (MediaKind::Audio, _) => {
                DecoderType::Audio(decoder.audio().map_err(CodecError::config)?)
            }
        };
        Ok(opened)
    }

    fn changed_format(&self, decoded: &Decoded) -> Option<MediaFormat> {
        let (key, format) = match decoded {
            Decoded::Video(frame) => (
                (frame.width(), frame.height(), 0),
                MediaFormat::video("video/raw", frame.width(), frame.height())
                    .with_frame_rate(self.frame_rate),
            ),
            Decoded::Audio(frame) => {
                let channels = audio_channels(frame) as u32;
                (
                    (frame.rate(), channels, 1),
                    MediaFormat::audio("audio/raw", frame.rate(), channels),
                )
            }
        };
        if self.reported == Some(key) {
            None
        } else {
            Some(format.with_duration_us(self.duration_us))
        }
    }

    fn remember_format(&mut self, decoded: &Decoded) {
        self.reported = Some(match decoded {
            Decoded::Video(frame) => (frame.width(), frame.height(), 0),
            Decoded::Audio(frame) => (frame.rate(), audio_channels(frame) as u32, 1),
        });
    }

    fn to_output(&mut self, decoded: Decoded) -> OutputBuffer {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let (pts_us, data, slot) = match decoded {
            Decoded::Video(frame) => {
                let pts_us = frame.timestamp().or(frame.pts()).unwrap_or(0);
                let picture = Picture::from_video(&frame, pts_us);
                if self.surface.is_some() {
                    (pts_us, Bytes::new(), Slot::Picture(picture))
                } else {
                    let mut data = Vec::new();
                    for plane in &picture.planes {
                        data.extend_from_slice(&plane.data);
                    }
                    (pts_us, Bytes::from(data), Slot::Empty)
                }
            }
            Decoded::Audio(frame) => {
                let pts_us = frame.timestamp().or(frame.pts()).unwrap_or(0);
                (pts_us, pcm_s16le(&frame), Slot::Empty)
            }
        };
        self.slots.insert(index, slot);
        OutputBuffer {
            index,
            pts_us,
            flags: BufferFlags::NONE,
            data,
        }
    }
}

// Owned and driven by a single pump thread at a time.
unsafe impl Send for FfmpegDecoder {}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecSession for FfmpegDecoder {
    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<Arc<dyn OutputSurface>>,
    ) -> Result<()> {
        let hw = match (&format.codec, format.kind) {
            (Some(codec), MediaKind::Video) => find_hw_decoder(codec.parameters().id()),
            _ => None,
        };
        let inner = match hw {
            Some(codec) => {
                let name = codec.name().to_string();
                match Self::open(format, Some(codec)) {
                    Ok(inner) => {
                        self.codec_name = name;
                        inner
                    }
                    Err(e) => {
                        log::warn!("hardware decoder {} failed: {}, using software", name, e);
                        Self::open(format, None)?
                    }
                }
            }
            None => Self::open(format, None)?,
        };
        if self.codec_name.is_empty() {
            self.codec_name = format.mime.clone();
        }
        log::info!("decoder configured: {} ({})", self.codec_name, format.kind);

        self.inner = Some(inner);
        self.kind = format.kind;
        self.duration_us = format.duration_us;
        self.frame_rate = format.frame_rate;
        self.surface = if format.kind == MediaKind::Video { surface } else { None };
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.inner.is_none() {
            return Err(CodecError::config("decoder started before configure"));
        }
        self.started = true;
        Ok(())
    }

    fn submit_input(&mut self, data: Option<&[u8]>, pts_us: i64, eos: bool) -> Result<bool> {
        if !self.started {
            return Err(CodecError::runtime("decoder not started"));
        }
        let Some(inner) = self.inner.as_mut() else {
            return Err(CodecError::runtime("decoder released"));
        };
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            let mut packet = Packet::copy(data);
            packet.set_pts(Some(pts_us));
            match inner.send_packet(&packet) {
                Ok(()) => {}
                Err(e) if is_again(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        if eos {
            match inner.send_eof() {
                Ok(()) | Err(ffmpeg_next::Error::Eof) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<OutputEvent> {
        if !self.started {
            return Ok(OutputEvent::WouldBlock);
        }
        if self.slots.len() >= MAX_OUTPUT_SLOTS {
            return Ok(OutputEvent::WouldBlock);
        }
        if let Some(decoded) = self.held.take() {
            return Ok(OutputEvent::Data(self.to_output(decoded)));
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(OutputEvent::WouldBlock);
        };
        match inner.receive_frame() {
            Ok(decoded) => {
                if let Some(format) = self.changed_format(&decoded) {
                    self.remember_format(&decoded);
                    self.held = Some(decoded);
                    return Ok(OutputEvent::FormatChanged(format));
                }
                Ok(OutputEvent::Data(self.to_output(decoded)))
            }
            Err(e) if is_again(&e) => Ok(OutputEvent::WouldBlock),
            Err(ffmpeg_next::Error::Eof) => {
                if self.eos_reported {
                    return Ok(OutputEvent::WouldBlock);
                }
                self.eos_reported = true;
                let index = self.next_index;
                self.next_index = self.next_index.wrapping_add(1);
                self.slots.insert(index, Slot::Empty);
                Ok(OutputEvent::Data(OutputBuffer {
                    index,
                    pts_us: 0,
                    flags: BufferFlags::END_OF_STREAM,
                    data: Bytes::new(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release_output(&mut self, index: usize, render: bool) -> Result<()> {
        let slot = self
            .slots
            .remove(&index)
            .ok_or_else(|| {
                CodecError::InvalidArgument(format!("unknown output buffer {}", index))
            })?;
        if let (true, Slot::Picture(picture)) = (render, slot) {
            if let Some(surface) = self.surface.as_ref() {
                surface.queue_frame(picture)?;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.held = None;
        self.slots.clear();
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.inner = None;
        self.surface = None;
        self.held = None;
        self.slots.clear();
        log::debug!("decoder released: {}", self.codec_name);
    }
}
