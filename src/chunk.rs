use bytes::Bytes;

pub type ChunkSender = tokio::sync::mpsc::UnboundedSender<ChunkCmd>;
pub type ChunkReceiver = tokio::sync::mpsc::UnboundedReceiver<ChunkCmd>;

/// Messages from the encoder worker to the mux task.
#[derive(Debug, Clone)]
pub enum ChunkCmd {
    Data(EncodedOutput),
    /// The encoder was flushed; nothing follows.
    EOF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Key,
    Delta,
}

/// One codec-level encoded unit, corresponding to a single frame.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    data: Bytes,
    kind: ChunkKind,
    timestamp_micros: u64,
    duration_micros: u64,
}

impl EncodedChunk {
    pub fn new(
        data: impl Into<Bytes>,
        kind: ChunkKind,
        timestamp_micros: u64,
        duration_micros: u64,
    ) -> Self {
        Self {
            data: data.into(),
            kind,
            timestamp_micros,
            duration_micros,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn is_key(&self) -> bool {
        self.kind == ChunkKind::Key
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp_micros
    }

    pub fn duration_micros(&self) -> u64 {
        self.duration_micros
    }
}

/// Decoder setup the encoder reports alongside (usually) its first key chunk.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Out-of-band codec record, e.g. an `avcC` body for H.264.
    pub description: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub decoder_config: Option<DecoderConfig>,
    /// Encoded alpha plane, stored next to the colour data in WebM.
    pub alpha_side_data: Option<Bytes>,
}

/// A chunk plus its metadata as it travels from encoder to muxer.
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub chunk: EncodedChunk,
    pub metadata: Option<ChunkMetadata>,
}

impl EncodedOutput {
    pub fn new(chunk: EncodedChunk, metadata: Option<ChunkMetadata>) -> Self {
        Self { chunk, metadata }
    }
}

impl From<EncodedChunk> for EncodedOutput {
    fn from(chunk: EncodedChunk) -> Self {
        Self {
            chunk,
            metadata: None,
        }
    }
}
