/// Registers FFmpeg components. Call once at startup before opening any
/// source through [`backend::FfmpegBackend`].
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod audio_extract;
pub mod av_player;
pub mod backend;
pub mod clip;
pub mod compositor;
pub mod decoder;
pub mod demuxer;
pub mod encoder;
pub mod error;
pub mod format;
pub mod frame;
pub mod frame_queue;
pub mod hw;
pub mod input;
pub mod join;
pub mod muxer;
pub mod output;
pub mod pacing;
pub mod packet;
pub mod player;
pub mod scaler;
pub mod session;
pub mod state;
pub mod sync_muxer;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use av_player::{AvPlayer, AvPlayerConfig};
pub use backend::FfmpegBackend;
pub use clip::{ClipConfig, ClipEvent, ClipTask};
pub use error::{CodecError, ErrorKind, Result};
pub use format::{MediaFormat, MediaKind, TrackInfo};
pub use frame_queue::{EncoderEvent, FrameQueueEncoder};
pub use player::{PlaybackEngine, PlayerConfig, PlayerEvent};
pub use state::{PlaybackState, SeekDirection, SeekRequest};
pub use sync_muxer::SyncMuxer;
