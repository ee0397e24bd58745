//! In-memory container writers.
//!
//! Exactly one variant exists per pipeline; callers go through [`Muxer`] and
//! never look at which one is active.

pub mod avc;
pub mod mp4;
pub mod webm;

use bytes::Bytes;

use crate::chunk::{ChunkMetadata, EncodedChunk};
use crate::container::ContainerKind;

pub use mp4::Mp4Muxer;
pub use webm::WebmMuxer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub alpha: bool,
}

pub enum Muxer {
    WebM(WebmMuxer),
    Mp4(Mp4Muxer),
}

impl Muxer {
    pub fn new(kind: ContainerKind, config: MuxerConfig) -> Self {
        match kind {
            ContainerKind::WebM => Muxer::WebM(WebmMuxer::new(config)),
            ContainerKind::Mp4 => Muxer::Mp4(Mp4Muxer::new(config)),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        match self {
            Muxer::WebM(_) => ContainerKind::WebM,
            Muxer::Mp4(_) => ContainerKind::Mp4,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        self.kind().mime_type()
    }

    /// Adds one encoded unit. Chunks must arrive in presentation order,
    /// starting with a key chunk.
    pub fn append(
        &mut self,
        chunk: &EncodedChunk,
        metadata: Option<&ChunkMetadata>,
    ) -> anyhow::Result<()> {
        match self {
            Muxer::WebM(muxer) => muxer.append(chunk, metadata),
            Muxer::Mp4(muxer) => muxer.append(chunk, metadata),
        }
    }

    /// Seals index/trailer structures and hands back the finished file.
    /// Only the first call succeeds.
    pub fn finalize(&mut self) -> anyhow::Result<Bytes> {
        match self {
            Muxer::WebM(muxer) => muxer.finalize(),
            Muxer::Mp4(muxer) => muxer.finalize(),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        match self {
            Muxer::WebM(muxer) => muxer.chunk_count(),
            Muxer::Mp4(muxer) => muxer.chunk_count(),
        }
    }
}
