use std::fmt;

use ffmpeg_next::{Rational, codec::Parameters};
use serde::{Deserialize, Serialize};

/// Track media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            MediaKind::Video => "video/",
            MediaKind::Audio => "audio/",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// Backend codec parameters carried along with a format so that a decoder or
/// a muxer track can be configured from what the demuxer/encoder reported.
pub struct CodecParameters {
    parameters: Parameters,
    time_base: Rational,
}

// Parameters only owns an AVCodecParameters allocation; it is never shared
// mutably across threads.
unsafe impl Send for CodecParameters {}
unsafe impl Sync for CodecParameters {}

impl CodecParameters {
    pub fn new(parameters: Parameters, time_base: Rational) -> Self {
        Self {
            parameters,
            time_base,
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }
}

impl Clone for CodecParameters {
    fn clone(&self) -> Self {
        Self {
            parameters: self.parameters.clone(),
            time_base: self.time_base,
        }
    }
}

impl fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecParameters")
            .field("codec", &self.parameters.id())
            .field("time_base", &self.time_base)
            .finish()
    }
}

/// Format description exchanged between demuxer, codec sessions and muxer.
///
/// Durations and times are in microseconds. Fields that do not apply to the
/// track kind stay zero.
#[derive(Debug, Clone)]
pub struct MediaFormat {
    pub kind: MediaKind,
    /// e.g. "video/h264", "audio/aac"
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub duration_us: i64,
    pub sample_rate: u32,
    pub channels: u32,
    /// bps, 0 if unknown
    pub bit_rate: u64,
    /// seconds between key frames (encoders only)
    pub key_frame_interval: f32,
    pub codec: Option<CodecParameters>,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            mime: mime.to_string(),
            width,
            height,
            frame_rate: 0,
            duration_us: 0,
            sample_rate: 0,
            channels: 0,
            bit_rate: 0,
            key_frame_interval: 0.0,
            codec: None,
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime: mime.to_string(),
            width: 0,
            height: 0,
            frame_rate: 0,
            duration_us: 0,
            sample_rate,
            channels,
            bit_rate: 0,
            key_frame_interval: 0.0,
            codec: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = duration_us;
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    pub fn with_codec(mut self, codec: CodecParameters) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_us / 1000
    }
}

/// Metadata re-read by a consuming loop whenever the decoder reports a new
/// output format. Duration is in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub duration_ms: i64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl TrackInfo {
    /// Merges the fields present in `format`, keeping previous values for
    /// fields the format leaves unset.
    pub fn update(&mut self, format: &MediaFormat) {
        if format.duration_us > 0 {
            self.duration_ms = format.duration_ms();
        }
        if format.width > 0 {
            self.width = format.width;
        }
        if format.height > 0 {
            self.height = format.height;
        }
        if format.frame_rate > 0 {
            self.frame_rate = format.frame_rate;
        }
        if format.sample_rate > 0 {
            self.sample_rate = format.sample_rate;
        }
        if format.channels > 0 {
            self.channels = format.channels;
        }
    }

    /// Milliseconds per frame, 0 when the frame rate is unknown.
    pub fn frame_interval_ms(&self) -> i64 {
        if self.frame_rate == 0 {
            0
        } else {
            1000 / self.frame_rate as i64
        }
    }
}

impl From<&MediaFormat> for TrackInfo {
    fn from(format: &MediaFormat) -> Self {
        let mut info = TrackInfo::default();
        info.update(format);
        info
    }
}
