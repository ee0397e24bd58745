//! Turns a stream of rendered RGBA frames into a single playable video file.
//!
//! The container is negotiated at runtime: VP9 in WebM when the environment
//! can play it, H.264 in MP4 otherwise. See [`pipeline::VideoExporter`].

/// Registers FFmpeg components. Call once at startup before creating an
/// [`ffmpeg_backend::FfmpegEncoderFactory`].
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod capability;
pub mod chunk;
pub mod container;
pub mod encoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_backend;
pub mod frame;
pub mod frame_buffer;
#[cfg(feature = "ffmpeg")]
pub mod hw;
pub mod metadata;
pub mod muxer;
pub mod output;
pub mod pipeline;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

pub use error::{ExportError, Result};
pub use frame::{PixelFormat, VideoImage};
pub use metadata::probe;
pub use pipeline::{ExportOptions, ExportSettings, PipelineState, VideoBlob, VideoExporter};
