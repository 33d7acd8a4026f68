//! Hardware codec discovery.
//!
//! Decode and encode sessions try the accelerated codecs listed here first
//! (CUDA/VAAPI/QSV/V4L2M2M) and fall back to the software codec when none is
//! available or it fails to open.

use ffmpeg_next::format::Pixel;

const HW_MARKERS: &[&str] = &["cuvid", "nvenc", "vaapi", "qsv", "v4l2m2m"];

/// Hardware decoders for `codec_id`, in preference order.
fn hw_decoder_names(codec_id: ffmpeg_next::codec::Id) -> &'static [&'static str] {
    use ffmpeg_next::codec::Id;
    match codec_id {
        Id::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        Id::HEVC => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        Id::VP8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        Id::VP9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        Id::AV1 => &["av1_cuvid", "av1_qsv"],
        Id::MPEG2VIDEO => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        Id::MPEG4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    }
}

/// Hardware encoders for a software codec name, in preference order.
fn hw_encoder_names(codec_name: &str) -> &'static [&'static str] {
    match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    }
}

/// First available hardware decoder for `codec_id`.
pub fn find_hw_decoder(codec_id: ffmpeg_next::codec::Id) -> Option<ffmpeg_next::Codec> {
    for name in hw_decoder_names(codec_id) {
        if let Some(codec) = ffmpeg_next::decoder::find_by_name(name) {
            log::info!("found hardware decoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// First available hardware encoder for `codec_name`.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    for name in hw_encoder_names(codec_name) {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_codec(name: &str) -> bool {
    HW_MARKERS.iter().any(|m| name.contains(m))
}

/// Pixel format an encoder is opened with. Packed RGB sources are mapped to a
/// planar format the encoder accepts; hardware encoders prefer NV12.
pub fn pixel_format_for_encoder(source: Pixel, codec_name: &str) -> Pixel {
    match source {
        Pixel::RGB24 | Pixel::BGR24 | Pixel::RGBA | Pixel::BGRA => {
            if is_hw_codec(codec_name) {
                Pixel::NV12
            } else {
                Pixel::YUV420P
            }
        }
        Pixel::None => Pixel::YUV420P,
        other => other,
    }
}

/// Software encoder name for an output mime type.
pub fn software_encoder_for(mime: &str) -> Option<&'static str> {
    match mime.strip_prefix("video/").or_else(|| mime.strip_prefix("audio/")) {
        Some("avc") | Some("h264") => Some("libx264"),
        Some("hevc") | Some("h265") => Some("libx265"),
        Some("vp9") => Some("libvpx-vp9"),
        Some("av1") => Some("libaom-av1"),
        Some("aac") | Some("mp4a-latm") => Some("aac"),
        Some("opus") => Some("libopus"),
        _ => None,
    }
}
