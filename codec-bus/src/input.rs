use std::ffi::CString;
use std::path::Path;

use ffmpeg_next::{
    Rational,
    codec::packet::Packet,
    format::stream::Stream,
    util::error::{EAGAIN, EIO},
    util::mathematics::{Rescale, rescale::TIME_BASE},
};

use crate::{
    demuxer::{Demuxer, SeekMode},
    error::{CodecError, Result},
    format::{CodecParameters, MediaFormat, MediaKind},
    packet::{BufferFlags, SampleInfo},
};

struct Track {
    stream_index: usize,
    time_base: Rational,
    format: MediaFormat,
    selected: bool,
}

struct Current {
    track: usize,
    packet: Packet,
    pts_us: i64,
}

/// ffmpeg backed [`Demuxer`]. Only audio and video streams are exposed as
/// tracks, numbered in stream order.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    tracks: Vec<Track>,
    current: Option<Current>,
    eof: bool,
}

// The input context is only ever driven from one thread at a time.
unsafe impl Send for AvInput {}

fn stream_format(stream: &Stream<'_>, container_duration_us: i64) -> Option<MediaFormat> {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        ffmpeg_next::media::Type::Video => MediaKind::Video,
        ffmpeg_next::media::Type::Audio => MediaKind::Audio,
        _ => return None,
    };
    let mime = format!("{}{}", kind.mime_prefix(), parameters.id().name());
    let (width, height, sample_rate, channels, bit_rate) = unsafe {
        let ptr = parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        (
            (*ptr).width.max(0) as u32,
            (*ptr).height.max(0) as u32,
            (*ptr).sample_rate.max(0) as u32,
            (*ptr).ch_layout.nb_channels.max(0) as u32,
            (*ptr).bit_rate.max(0) as u64,
        )
    };

    let time_base = stream.time_base();
    let duration_us = if stream.duration() > 0 {
        stream.duration().rescale(time_base, TIME_BASE)
    } else {
        container_duration_us.max(0)
    };

    let mut format = match kind {
        MediaKind::Video => {
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() > 0 {
                (rate.numerator() as f64 / rate.denominator() as f64).round() as u32
            } else {
                0
            };
            MediaFormat::video(&mime, width, height).with_frame_rate(fps)
        }
        MediaKind::Audio => MediaFormat::audio(&mime, sample_rate, channels),
    };
    format = format
        .with_duration_us(duration_us)
        .with_bit_rate(bit_rate)
        .with_codec(CodecParameters::new(parameters, time_base));
    Some(format)
}

impl AvInput {
    /// Resolve input format by name (e.g. "v4l2", "mpegts") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> Result<ffmpeg_next::format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| CodecError::InvalidArgument(format!("format name {:?}: {}", name, e)))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(CodecError::io(format!("input format not found: {}", name)));
        }
        Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
    }

    pub fn new(url: &str, format: Option<&str>) -> Result<Self> {
        use ffmpeg_next::format::format::Format;

        let path = Path::new(url);
        let input = match format {
            Some(name) => {
                let fmt = Self::find_input_format(name)?;
                let options = ffmpeg_next::Dictionary::new();
                ffmpeg_next::format::open_with(path, &Format::Input(fmt), options)
                    .map_err(|e| CodecError::io(format!("open {}: {}", url, e)))?
                    .input()
            }
            None => ffmpeg_next::format::input(path)
                .map_err(|e| CodecError::io(format!("open {}: {}", url, e)))?,
        };

        let container_duration_us = input.duration();
        let tracks: Vec<Track> = input
            .streams()
            .filter_map(|stream| {
                stream_format(&stream, container_duration_us).map(|format| Track {
                    stream_index: stream.index(),
                    time_base: stream.time_base(),
                    format,
                    selected: false,
                })
            })
            .collect();
        log::debug!("opened {} with {} tracks", url, tracks.len());

        Ok(Self {
            inner: input,
            tracks,
            current: None,
            eof: false,
        })
    }

    fn track_of_stream(&self, stream_index: usize) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.stream_index == stream_index && t.selected)
    }

    /// Reads packets until one belongs to a selected track.
    fn fill(&mut self) -> Result<()> {
        if self.current.is_some() || self.eof {
            return Ok(());
        }
        loop {
            let mut packet = Packet::empty();
            match read_outcome(packet.read(&mut self.inner))? {
                ReadOutcome::Packet => {}
                ReadOutcome::Retry => continue,
                ReadOutcome::End => {
                    self.eof = true;
                    return Ok(());
                }
            }
            let Some(track) = self.track_of_stream(packet.stream()) else {
                continue;
            };
            let time_base = self.tracks[track].time_base;
            let pts = packet.pts().or(packet.dts()).unwrap_or(0);
            self.current = Some(Current {
                track,
                pts_us: pts.rescale(time_base, TIME_BASE),
                packet,
            });
            return Ok(());
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReadOutcome {
    Packet,
    Retry,
    End,
}

fn read_outcome(res: std::result::Result<(), ffmpeg_next::Error>) -> Result<ReadOutcome> {
    match res {
        Ok(()) => Ok(ReadOutcome::Packet),
        Err(ffmpeg_next::Error::Eof) => Ok(ReadOutcome::End),
        Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => Ok(ReadOutcome::Retry),
        Err(e) => Err(CodecError::io(format!("read packet: {}", e))),
    }
}

impl Demuxer for AvInput {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Result<MediaFormat> {
        self.tracks
            .get(index)
            .map(|t| t.format.clone())
            .ok_or_else(|| CodecError::InvalidArgument(format!("track {} out of range", index)))
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or_else(|| CodecError::InvalidArgument(format!("track {} out of range", index)))?;
        track.selected = true;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleInfo>> {
        self.fill()?;
        let Some(current) = self.current.as_ref() else {
            return Ok(None);
        };
        let data = current.packet.data().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(data);
        let flags = if current.packet.is_key() {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        log::trace!("read sample track {} pts {}", current.track, current.pts_us);
        Ok(Some(SampleInfo::new(data.len(), current.pts_us, flags)))
    }

    fn advance(&mut self) -> Result<bool> {
        self.current = None;
        self.fill()?;
        Ok(self.current.is_some())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<()> {
        let time_us = time_us.max(0);
        let res = match mode {
            SeekMode::PreviousSync => self.inner.seek(time_us, ..time_us),
            SeekMode::Closest => self.inner.seek(time_us, ..),
        };
        res.map_err(|e| CodecError::io(format!("seek to {}us: {}", time_us, e)))?;
        self.current = None;
        self.eof = false;
        Ok(())
    }

    fn sample_time(&mut self) -> Result<Option<i64>> {
        self.fill()?;
        Ok(self.current.as_ref().map(|c| c.pts_us))
    }

    fn release(&mut self) {
        self.current = None;
        self.eof = true;
    }
}
