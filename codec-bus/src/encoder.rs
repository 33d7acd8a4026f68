use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational,
    codec::{Parameters, packet::Packet},
    format::{Pixel, Sample, sample::Type},
    util::mathematics::rescale::TIME_BASE,
};

use crate::{
    compositor::ComposedFrame,
    error::{CodecError, Result},
    format::{CodecParameters, MediaFormat, MediaKind},
    hw::{find_hw_encoder, pixel_format_for_encoder, software_encoder_for},
    packet::BufferFlags,
    scaler::Scaler,
    session::{CodecSession, EncodeSession, InputSurface, OutputBuffer, OutputEvent, OutputSurface},
};

/// Raw frames the encoder may hold before input is refused.
const MAX_PENDING_FRAMES: usize = 4;

enum EncoderType {
    Video(ffmpeg_next::codec::encoder::Video),
    Audio(ffmpeg_next::codec::encoder::Audio),
}

impl EncoderType {
    fn send_eof(&mut self) -> std::result::Result<(), ffmpeg_next::Error> {
        match self {
            EncoderType::Video(encoder) => encoder.send_eof(),
            EncoderType::Audio(encoder) => encoder.send_eof(),
        }
    }

    fn receive_packet(
        &mut self,
        packet: &mut Packet,
    ) -> std::result::Result<(), ffmpeg_next::Error> {
        match self {
            EncoderType::Video(encoder) => encoder.receive_packet(packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(packet),
        }
    }

    fn parameters(&self) -> Parameters {
        match self {
            EncoderType::Video(encoder) => Parameters::from(encoder),
            EncoderType::Audio(encoder) => Parameters::from(encoder),
        }
    }
}

fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

fn channel_layout(channels: u32) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        _ => ChannelLayout::STEREO,
    }
}

/// Shared between the session and its input surface.
struct EncoderCore {
    inner: EncoderType,
    width: u32,
    height: u32,
    pixel_format: Pixel,
    scaler: Option<Scaler>,
    frames: VecDeque<ffmpeg_next::frame::Video>,
    audio_frames: VecDeque<ffmpeg_next::frame::Audio>,
    // buffer-fed audio: interleaved s16le waiting to fill a codec frame
    pcm: Vec<u8>,
    pcm_pts_us: Option<i64>,
    channels: usize,
    sample_rate: u32,
    frame_size: usize,
    end_requested: bool,
    eof_sent: bool,
}

// Only driven by the thread that owns the session.
unsafe impl Send for EncoderCore {}

impl EncoderCore {
    /// Hands queued raw frames to the codec until it asks for output to be
    /// received first.
    fn send_pending_frames(&mut self) -> Result<()> {
        match &mut self.inner {
            EncoderType::Video(encoder) => {
                while let Some(frame) = self.frames.front() {
                    match encoder.send_frame(frame) {
                        Ok(()) => {
                            self.frames.pop_front();
                        }
                        Err(e) if is_again(&e) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            EncoderType::Audio(encoder) => {
                while let Some(frame) = self.audio_frames.front() {
                    match encoder.send_frame(frame) {
                        Ok(()) => {
                            self.audio_frames.pop_front();
                        }
                        Err(e) if is_again(&e) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.frames.len() + self.audio_frames.len()
    }

    fn encode_picture(&mut self, composed: ComposedFrame) -> Result<()> {
        if self.end_requested {
            return Err(CodecError::runtime("frame submitted after end of input"));
        }
        let picture = composed.visible()?;
        let source = picture.to_video()?;
        let frame = if (source.format(), source.width(), source.height())
            == (self.pixel_format, self.width, self.height)
        {
            source
        } else {
            let stale = self
                .scaler
                .as_ref()
                .map(|s| !s.matches(source.format(), source.width(), source.height()))
                .unwrap_or(true);
            if stale {
                self.scaler = Some(Scaler::new(
                    (source.format(), source.width(), source.height()),
                    (self.pixel_format, self.width, self.height),
                )?);
            }
            let mut converted = ffmpeg_next::frame::Video::empty();
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(&source, &mut converted)?;
            }
            converted.set_pts(Some(composed.pts_us));
            converted
        };
        self.frames.push_back(frame);
        self.send_pending_frames()
    }

    fn audio_frame_bytes(&self) -> usize {
        self.frame_size * self.channels * 2
    }

    /// Converts `len` bytes of buffered s16le PCM to a planar float frame.
    fn take_audio_frame(&mut self, len: usize) -> ffmpeg_next::frame::Audio {
        let samples = len / (self.channels * 2);
        let mut frame = ffmpeg_next::frame::Audio::new(
            Sample::F32(Type::Planar),
            samples,
            channel_layout(self.channels as u32),
        );
        frame.set_rate(self.sample_rate);
        let pts_us = self.pcm_pts_us.unwrap_or(0);
        frame.set_pts(Some(pts_us));
        for ch in 0..self.channels {
            let plane = frame.data_mut(ch);
            for i in 0..samples {
                let at = (i * self.channels + ch) * 2;
                let s = i16::from_le_bytes([self.pcm[at], self.pcm[at + 1]]);
                let value = s as f32 / i16::MAX as f32;
                plane[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
            }
        }
        self.pcm.drain(..samples * self.channels * 2);
        if self.sample_rate > 0 {
            self.pcm_pts_us = Some(pts_us + samples as i64 * 1_000_000 / self.sample_rate as i64);
        }
        frame
    }

    /// Queues every complete codec frame in the PCM buffer, and the remainder
    /// once end of input was requested, then sends what the codec accepts.
    fn send_pcm(&mut self) -> Result<()> {
        loop {
            let full = self.audio_frame_bytes();
            let len = if self.pcm.len() >= full {
                full
            } else if self.end_requested && !self.pcm.is_empty() {
                self.pcm.len() - self.pcm.len() % (self.channels * 2)
            } else {
                break;
            };
            if len == 0 {
                self.pcm.clear();
                break;
            }
            let frame = self.take_audio_frame(len);
            self.audio_frames.push_back(frame);
        }
        self.send_pending_frames()
    }

    fn finish_input(&mut self) -> Result<()> {
        self.end_requested = true;
        self.send_pcm()?;
        if self.pending() == 0 && !self.eof_sent {
            match self.inner.send_eof() {
                Ok(()) | Err(ffmpeg_next::Error::Eof) => self.eof_sent = true,
                Err(e) if is_again(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Encoder input surface: crops each composed frame to its region and scales
/// it to the encoder's size and pixel format.
pub struct ScaleSurface {
    core: Arc<Mutex<EncoderCore>>,
}

impl InputSurface for ScaleSurface {
    fn swap_buffers(&self, frame: ComposedFrame) -> Result<()> {
        let mut core = self
            .core
            .lock()
            .map_err(|_| CodecError::runtime("encoder poisoned"))?;
        core.encode_picture(frame)
    }

    fn release(&self) {
        if let Ok(mut core) = self.core.lock() {
            core.frames.clear();
            core.audio_frames.clear();
            core.scaler = None;
        }
    }
}

/// Encode session over an ffmpeg encoder. Video input arrives through the
/// [`ScaleSurface`], audio input as interleaved s16le PCM via `submit_input`.
/// Output times are microseconds.
pub struct FfmpegEncoder {
    core: Option<Arc<Mutex<EncoderCore>>>,
    codec_name: String,
    output_format: Option<MediaFormat>,
    started: bool,
    format_reported: bool,
    eos_reported: bool,
    slots: HashSet<usize>,
    next_index: usize,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            core: None,
            codec_name: String::new(),
            output_format: None,
            started: false,
            format_reported: false,
            eos_reported: false,
            slots: HashSet::new(),
            next_index: 0,
        }
    }

    fn open_video(
        codec: ffmpeg_next::Codec,
        format: &MediaFormat,
        pixel_format: Pixel,
    ) -> Result<ffmpeg_next::codec::encoder::Video> {
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video().map_err(CodecError::config)?;
        let fps = format.frame_rate.max(1);
        encoder.set_width(format.width);
        encoder.set_height(format.height);
        encoder.set_format(pixel_format);
        encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        encoder.set_time_base(TIME_BASE);
        if format.bit_rate > 0 {
            encoder.set_bit_rate(format.bit_rate as usize);
        }
        let gop = (fps as f32 * format.key_frame_interval).ceil().max(1.0) as u32;
        encoder.set_gop(gop);
        encoder.set_max_b_frames(0);
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        encoder.open_with(opts).map_err(CodecError::config)
    }

    fn open_audio(
        codec: ffmpeg_next::Codec,
        format: &MediaFormat,
    ) -> Result<ffmpeg_next::codec::encoder::Audio> {
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().audio().map_err(CodecError::config)?;
        encoder.set_rate(format.sample_rate as i32);
        encoder.set_channel_layout(channel_layout(format.channels));
        encoder.set_format(Sample::F32(Type::Planar));
        encoder.set_time_base(TIME_BASE);
        if format.bit_rate > 0 {
            encoder.set_bit_rate(format.bit_rate as usize);
        }
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        encoder.open_as(codec).map_err(CodecError::config)
    }

    fn configure_video(&mut self, format: &MediaFormat) -> Result<EncoderCore> {
        if format.width == 0 || format.height == 0 {
            return Err(CodecError::config(format!(
                "invalid encoder size {}x{}",
                format.width, format.height
            )));
        }
        let codec = software_encoder_for(&format.mime)
            .ok_or_else(|| CodecError::config(format!("no encoder for {}", format.mime)))?;

        // Try the hardware encoder first, then fall back to the software one.
        let mut opened = None;
        if let Some(hw_codec) = find_hw_encoder(codec) {
            let hw_name = hw_codec.name().to_string();
            let pixel_format = pixel_format_for_encoder(Pixel::YUV420P, &hw_name);
            log::info!("attempting hardware encoder: {}", hw_name);
            match Self::open_video(hw_codec, format, pixel_format) {
                Ok(encoder) => opened = Some((encoder, hw_name, pixel_format)),
                Err(e) => log::warn!(
                    "hardware encoder {} failed: {}, falling back to {}",
                    hw_name,
                    e,
                    codec
                ),
            }
        }
        let (encoder, name, pixel_format) = match opened {
            Some(opened) => opened,
            None => {
                let sw_codec = ffmpeg_next::encoder::find_by_name(codec)
                    .ok_or_else(|| CodecError::config(format!("codec not found: {}", codec)))?;
                let pixel_format = pixel_format_for_encoder(Pixel::YUV420P, codec);
                (Self::open_video(sw_codec, format, pixel_format)?, codec.to_string(), pixel_format)
            }
        };
        log::info!(
            "encoder opened: {} {}x{}@{} {}bps",
            name,
            format.width,
            format.height,
            format.frame_rate,
            format.bit_rate
        );
        self.codec_name = name;

        Ok(EncoderCore {
            inner: EncoderType::Video(encoder),
            width: format.width,
            height: format.height,
            pixel_format,
            scaler: None,
            frames: VecDeque::new(),
            audio_frames: VecDeque::new(),
            pcm: Vec::new(),
            pcm_pts_us: None,
            channels: 0,
            sample_rate: 0,
            frame_size: 0,
            end_requested: false,
            eof_sent: false,
        })
    }

    fn configure_audio(&mut self, format: &MediaFormat) -> Result<EncoderCore> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(CodecError::config("audio encoder needs sample rate and channels"));
        }
        let name = software_encoder_for(&format.mime)
            .ok_or_else(|| CodecError::config(format!("no encoder for {}", format.mime)))?;
        let codec = ffmpeg_next::encoder::find_by_name(name)
            .ok_or_else(|| CodecError::config(format!("codec not found: {}", name)))?;
        let encoder = Self::open_audio(codec, format)?;
        let frame_size = match encoder.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        log::info!(
            "encoder opened: {} {}Hz {}ch frame {}",
            name,
            format.sample_rate,
            format.channels,
            frame_size
        );
        self.codec_name = name.to_string();

        Ok(EncoderCore {
            inner: EncoderType::Audio(encoder),
            width: 0,
            height: 0,
            pixel_format: Pixel::None,
            scaler: None,
            frames: VecDeque::new(),
            audio_frames: VecDeque::new(),
            pcm: Vec::new(),
            pcm_pts_us: None,
            channels: format.channels.min(2) as usize,
            sample_rate: format.sample_rate,
            frame_size,
            end_requested: false,
            eof_sent: false,
        })
    }

    fn core(&self) -> Result<&Arc<Mutex<EncoderCore>>> {
        self.core
            .as_ref()
            .ok_or_else(|| CodecError::runtime("encoder not configured"))
    }

    fn next_slot(&mut self) -> usize {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.slots.insert(index);
        index
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecSession for FfmpegEncoder {
    fn configure(
        &mut self,
        format: &MediaFormat,
        _surface: Option<Arc<dyn OutputSurface>>,
    ) -> Result<()> {
        let core = match format.kind {
            MediaKind::Video => self.configure_video(format)?,
            MediaKind::Audio => self.configure_audio(format)?,
        };
        let parameters = core.inner.parameters();
        self.output_format = Some(
            format
                .clone()
                .with_codec(CodecParameters::new(parameters, TIME_BASE)),
        );
        self.core = Some(Arc::new(Mutex::new(core)));
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.core()?;
        self.started = true;
        Ok(())
    }

    fn submit_input(&mut self, data: Option<&[u8]>, pts_us: i64, eos: bool) -> Result<bool> {
        if !self.started {
            return Err(CodecError::runtime("encoder not started"));
        }
        let mut core = self
            .core()?
            .lock()
            .map_err(|_| CodecError::runtime("encoder poisoned"))?;
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            if !matches!(core.inner, EncoderType::Audio(_)) {
                return Err(CodecError::InvalidArgument(
                    "video encoder takes input through its surface".to_string(),
                ));
            }
            // codec still holds earlier frames: the caller retries this one
            if core.audio_frames.len() >= MAX_PENDING_FRAMES
                || core.pcm.len() >= core.audio_frame_bytes() * MAX_PENDING_FRAMES
            {
                core.send_pending_frames()?;
                return Ok(false);
            }
            if core.pcm.is_empty() {
                core.pcm_pts_us = Some(pts_us);
            }
            core.pcm.extend_from_slice(data);
            core.send_pcm()?;
        }
        if eos {
            core.finish_input()?;
        }
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<OutputEvent> {
        if !self.started {
            return Ok(OutputEvent::WouldBlock);
        }
        if !self.format_reported {
            self.format_reported = true;
            if let Some(format) = self.output_format.clone() {
                return Ok(OutputEvent::FormatChanged(format));
            }
        }
        let core = self.core()?.clone();
        let mut core = core
            .lock()
            .map_err(|_| CodecError::runtime("encoder poisoned"))?;
        if core.end_requested && !core.eof_sent {
            core.finish_input()?;
        } else {
            core.send_pending_frames()?;
        }

        let mut packet = Packet::empty();
        match core.inner.receive_packet(&mut packet) {
            Ok(()) => {
                drop(core);
                let flags = if packet.is_key() {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::NONE
                };
                let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
                let index = self.next_slot();
                Ok(OutputEvent::Data(OutputBuffer {
                    index,
                    pts_us: packet.pts().unwrap_or(0),
                    flags,
                    data,
                }))
            }
            Err(e) if is_again(&e) => Ok(OutputEvent::WouldBlock),
            Err(ffmpeg_next::Error::Eof) => {
                drop(core);
                if self.eos_reported {
                    return Ok(OutputEvent::WouldBlock);
                }
                self.eos_reported = true;
                let index = self.next_slot();
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

    fn release_output(&mut self, index: usize, _render: bool) -> Result<()> {
        if self.slots.remove(&index) {
            Ok(())
        } else {
            Err(CodecError::InvalidArgument(format!("unknown output buffer {}", index)))
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.slots.clear();
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.core = None;
        self.slots.clear();
        log::debug!("encoder released: {}", self.codec_name);
    }
}

impl EncodeSession for FfmpegEncoder {
    fn create_input_surface(&mut self) -> Result<Arc<dyn InputSurface>> {
        let core = self.core()?.clone();
        let is_video = core
            .lock()
            .map(|c| matches!(c.inner, EncoderType::Video(_)))
            .unwrap_or(false);
        if !is_video {
            return Err(CodecError::config("input surface requires a video encoder"));
        }
        Ok(Arc::new(ScaleSurface { core }))
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        let mut core = self
            .core()?
            .lock()
            .map_err(|_| CodecError::runtime("encoder poisoned"))?;
        core.finish_input()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(encoder: &mut FfmpegEncoder, packets: &mut usize) -> Result<bool> {
        loop {
            match encoder.poll_output()? {
                OutputEvent::Data(buffer) => {
                    encoder.release_output(buffer.index, false)?;
                    if buffer.flags.is_eos() {
                        return Ok(true);
                    }
                    *packets += 1;
                }
                OutputEvent::FormatChanged(_) => {}
                OutputEvent::WouldBlock => return Ok(false),
            }
        }
    }

    #[test]
    fn test_audio_backpressure_keeps_pcm() -> anyhow::Result<()> {
        crate::init()?;
        if ffmpeg_next::encoder::find_by_name("aac").is_none() {
            eprintln!("aac encoder unavailable, skipping");
            return Ok(());
        }
        let mut encoder = FfmpegEncoder::new();
        encoder.configure(&MediaFormat::audio("audio/mp4a-latm", 44_100, 2), None)?;
        encoder.start()?;

        // 1024 samples of stereo s16le per chunk, never polled
        let chunk = vec![0x10u8; 4096];
        let mut refused = 0;
        for i in 0..64i64 {
            if !encoder.submit_input(Some(&chunk), i * 23_219, false)? {
                refused += 1;
            }
        }
        assert!(refused > 0, "encoder never pushed back");

        let mut packets = 0;
        let mut fed = 0i64;
        while fed < 64 {
            if encoder.submit_input(Some(&chunk), (64 + fed) * 23_219, false)? {
                fed += 1;
            } else {
                drain(&mut encoder, &mut packets)?;
            }
        }
        while !encoder.submit_input(None, 0, true)? {
            drain(&mut encoder, &mut packets)?;
        }
        let mut ended = false;
        for _ in 0..10_000 {
            if drain(&mut encoder, &mut packets)? {
                ended = true;
                break;
            }
        }
        assert!(ended);
        assert!(packets >= 64, "got {} packets", packets);
        encoder.stop()?;
        encoder.release();
        Ok(())
    }
}
