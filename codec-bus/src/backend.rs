use crate::{
    decoder::FfmpegDecoder,
    demuxer::Demuxer,
    encoder::FfmpegEncoder,
    error::{CodecError, Result},
    format::MediaFormat,
    input::AvInput,
    muxer::Muxer,
    output::AvOutput,
    session::{CodecBackend, CodecSession, EncodeSession},
};

/// Production backend over ffmpeg. Call [`crate::init`] once before use.
#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend {
    /// Forced input format name (e.g. "mpegts"); probed when unset.
    input_format: Option<String>,
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_format(mut self, name: &str) -> Self {
        self.input_format = Some(name.to_string());
        self
    }
}

impl CodecBackend for FfmpegBackend {
    fn open_source(&self, uri: &str) -> Result<Box<dyn Demuxer>> {
        Ok(Box::new(AvInput::new(uri, self.input_format.as_deref())?))
    }

    fn create_decoder(&self, format: &MediaFormat) -> Result<Box<dyn CodecSession>> {
        if format.codec.is_none() {
            return Err(CodecError::config(format!(
                "cannot decode {}: no codec parameters",
                format.mime
            )));
        }
        Ok(Box::new(FfmpegDecoder::new()))
    }

    fn create_encoder(&self, _format: &MediaFormat) -> Result<Box<dyn EncodeSession>> {
        Ok(Box::new(FfmpegEncoder::new()))
    }

    fn create_muxer(&self, uri: &str) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(AvOutput::new(uri)?))
    }
}

#[cfg(test)]
#[path = "backend_test.rs"]
mod backend_test;
