use ffmpeg_next::{
    codec::packet::{Packet, flag::Flags},
    util::mathematics::rescale::TIME_BASE,
};

use crate::{
    error::{CodecError, Result},
    format::MediaFormat,
    muxer::Muxer,
    packet::SampleInfo,
};

/// ffmpeg backed [`Muxer`]. Sample times are microseconds and get rescaled to
/// each stream's time base on write.
pub struct AvOutput {
    url: String,
    inner: ffmpeg_next::format::context::Output,
    tracks: usize,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for AvOutput {}

impl AvOutput {
    pub fn new(url: &str) -> Result<Self> {
        let output = ffmpeg_next::format::output(url)
            .map_err(|e| CodecError::io(format!("create {}: {}", url, e)))?;
        Ok(Self {
            url: url.to_string(),
            inner: output,
            tracks: 0,
            have_written_header: false,
            have_written_trailer: false,
        })
    }
}

impl Muxer for AvOutput {
    fn add_track(&mut self, format: &MediaFormat) -> Result<usize> {
        if self.have_written_header {
            return Err(CodecError::io("track added after header"));
        }
        let codec = format.codec.as_ref().ok_or_else(|| {
            CodecError::config(format!("{} track without codec parameters", format.kind))
        })?;
        let parameters = codec.parameters();
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))
            .map_err(CodecError::io)?;
        writer_stream.set_parameters(parameters.clone());
        // let the container pick its own tag
        unsafe {
            (*(*writer_stream.as_mut_ptr()).codecpar).codec_tag = 0;
        }
        let index = writer_stream.index();
        self.tracks += 1;
        log::debug!("{}: added {} track {} ({})", self.url, format.kind, index, format.mime);
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        if !self.have_written_header {
            self.inner.write_header().map_err(CodecError::io)?;
            self.have_written_header = true;
        }
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &SampleInfo) -> Result<()> {
        if !self.have_written_header {
            return Err(CodecError::io("write before header"));
        }
        let out_time_base = self
            .inner
            .stream(track)
            .ok_or_else(|| CodecError::io(format!("stream {} not found", track)))?
            .time_base();

        let mut packet = Packet::copy(data);
        packet.set_stream(track);
        packet.set_pts(Some(info.pts_us));
        packet.set_dts(Some(info.pts_us));
        packet.set_position(-1);
        if info.flags.is_key() {
            packet.set_flags(Flags::KEY);
        }
        packet.rescale_ts(TIME_BASE, out_time_base);
        packet
            .write_interleaved(&mut self.inner)
            .map_err(CodecError::io)
    }

    fn stop(&mut self) -> Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer().map_err(CodecError::io)?;
            log::info!("{}: finished with {} tracks", self.url, self.tracks);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.have_written_header && !self.have_written_trailer {
            log::warn!("{}: released without trailer", self.url);
        }
    }
}
