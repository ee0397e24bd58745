//! WebM (Matroska subset) writer for a single VP9 video track.
//!
//! ```text
//! EBML header
//! Segment
//!   SeekHead  (Info, Tracks, Cues)
//!   Info      (1 ms timestamp scale, duration)
//!   Tracks    (one V_VP9 track, optional alpha)
//!   Cluster*  (SimpleBlock, or BlockGroup when alpha side data is present)
//!   Cues
//! ```
//!
//! Clusters are serialized as they close; the segment is assembled on
//! finalize, once every size and offset is known.

use bytes::Bytes;

use crate::chunk::{ChunkMetadata, EncodedChunk};
use crate::muxer::MuxerConfig;

pub const CODEC_ID: &str = "V_VP9";
const MUXING_APP: &str = "frame-export";
const TRACK_NUMBER: u64 = 1;
/// Nanoseconds per Matroska tick: timestamps are in milliseconds.
const TIMESTAMP_SCALE: u64 = 1_000_000;
const CLUSTER_TARGET_MS: u64 = 1_000;

pub mod ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x18538067;
    pub const SEEK_HEAD: u32 = 0x114D9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2AD7B1;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;
    pub const DURATION: u32 = 0x4489;

    pub const TRACKS: u32 = 0x1654AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const CODEC_ID: u32 = 0x86;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const MAX_BLOCK_ADDITION_ID: u32 = 0x55EE;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const ALPHA_MODE: u32 = 0x53C0;

    pub const CLUSTER: u32 = 0x1F43B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADD_ID: u32 = 0xEE;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;

    pub const CUES: u32 = 0x1C53BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

pub(crate) fn write_id(buf: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    buf.extend_from_slice(&bytes[skip..]);
}

/// Element data size as a minimal-length EBML variable-size integer.
pub(crate) fn write_size(buf: &mut Vec<u8>, size: u64) {
    let mut len = 1;
    // all-ones is reserved for "unknown size"
    while len < 8 && size >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    let marked = size | (1u64 << (7 * len));
    buf.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

pub(crate) fn write_element(buf: &mut Vec<u8>, id: u32, content: &[u8]) {
    write_id(buf, id);
    write_size(buf, content.len() as u64);
    buf.extend_from_slice(content);
}

fn write_master(buf: &mut Vec<u8>, id: u32, content: impl FnOnce(&mut Vec<u8>)) {
    let mut body = Vec::new();
    content(&mut body);
    write_element(buf, id, &body);
}

fn write_uint(buf: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    write_element(buf, id, &bytes[skip..]);
}

fn write_int(buf: &mut Vec<u8>, id: u32, value: i64) {
    let bytes = value.to_be_bytes();
    let mut skip = 0;
    // drop sign-extension bytes that the next byte's top bit already implies
    while skip < 7 {
        let redundant = (bytes[skip] == 0x00 && bytes[skip + 1] & 0x80 == 0)
            || (bytes[skip] == 0xFF && bytes[skip + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        skip += 1;
    }
    write_element(buf, id, &bytes[skip..]);
}

/// Fixed 8-byte unsigned integer, so the element size never depends on the value.
fn write_uint_fixed(buf: &mut Vec<u8>, id: u32, value: u64) {
    write_element(buf, id, &value.to_be_bytes());
}

fn write_float(buf: &mut Vec<u8>, id: u32, value: f64) {
    write_element(buf, id, &value.to_be_bytes());
}

fn write_string(buf: &mut Vec<u8>, id: u32, value: &str) {
    write_element(buf, id, value.as_bytes());
}

struct OpenCluster {
    timestamp_ms: u64,
    body: Vec<u8>,
}

struct CuePoint {
    time_ms: u64,
    /// Offset of the cluster within the serialized cluster area.
    cluster_offset: u64,
}

pub struct WebmMuxer {
    config: MuxerConfig,
    clusters: Vec<u8>,
    cluster: Option<OpenCluster>,
    cues: Vec<CuePoint>,
    last_block_ms: Option<u64>,
    end_micros: u64,
    chunk_count: u64,
    have_finalized: bool,
}

impl WebmMuxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            clusters: Vec::new(),
            cluster: None,
            cues: Vec::new(),
            last_block_ms: None,
            end_micros: 0,
            chunk_count: 0,
            have_finalized: false,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn append(
        &mut self,
        chunk: &EncodedChunk,
        metadata: Option<&ChunkMetadata>,
    ) -> anyhow::Result<()> {
        if self.have_finalized {
            anyhow::bail!("webm muxer already finalized");
        }
        if self.chunk_count == 0 && !chunk.is_key() {
            anyhow::bail!("first webm chunk must be a key frame");
        }

        let timestamp_ms = chunk.timestamp_micros() / 1000;
        if let Some(last) = self.last_block_ms {
            if timestamp_ms < last {
                anyhow::bail!(
                    "chunk timestamp {}ms goes back before {}ms",
                    timestamp_ms,
                    last
                );
            }
        }

        let start_new = match &self.cluster {
            None => true,
            Some(cluster) => {
                let elapsed = timestamp_ms - cluster.timestamp_ms;
                (chunk.is_key() && elapsed >= CLUSTER_TARGET_MS) || elapsed > i16::MAX as u64
            }
        };
        if start_new {
            self.close_cluster();
            if chunk.is_key() {
                self.cues.push(CuePoint {
                    time_ms: timestamp_ms,
                    cluster_offset: self.clusters.len() as u64,
                });
            }
            self.cluster = Some(OpenCluster {
                timestamp_ms,
                body: Vec::new(),
            });
        }

        let alpha = metadata
            .and_then(|m| m.alpha_side_data.as_ref())
            .filter(|_| self.config.alpha);
        let reference_ms = self.last_block_ms;
        let Some(cluster) = self.cluster.as_mut() else {
            anyhow::bail!("no open cluster");
        };
        let relative = (timestamp_ms - cluster.timestamp_ms) as i16;

        match alpha {
            Some(alpha) => {
                write_master(&mut cluster.body, ids::BLOCK_GROUP, |group| {
                    write_element(group, ids::BLOCK, &block_payload(relative, 0, chunk.data()));
                    write_master(group, ids::BLOCK_ADDITIONS, |additions| {
                        write_master(additions, ids::BLOCK_MORE, |more| {
                            write_uint(more, ids::BLOCK_ADD_ID, 1);
                            write_element(more, ids::BLOCK_ADDITIONAL, alpha);
                        });
                    });
                    if !chunk.is_key() {
                        if let Some(previous) = reference_ms {
                            write_int(
                                group,
                                ids::REFERENCE_BLOCK,
                                previous as i64 - timestamp_ms as i64,
                            );
                        }
                    }
                });
            }
            None => {
                let flags = if chunk.is_key() { 0x80 } else { 0x00 };
                write_element(
                    &mut cluster.body,
                    ids::SIMPLE_BLOCK,
                    &block_payload(relative, flags, chunk.data()),
                );
            }
        }

        self.last_block_ms = Some(timestamp_ms);
        self.end_micros = self
            .end_micros
            .max(chunk.timestamp_micros().saturating_add(chunk.duration_micros()));
        self.chunk_count += 1;
        Ok(())
    }

    pub fn finalize(&mut self) -> anyhow::Result<Bytes> {
        if self.have_finalized {
            anyhow::bail!("webm muxer already finalized");
        }
        self.have_finalized = true;
        self.close_cluster();

        let info = self.info();
        let tracks = self.tracks();
        let seek_head_len = seek_head(0, 0, 0).len() as u64;
        let info_pos = seek_head_len;
        let tracks_pos = info_pos + info.len() as u64;
        let clusters_pos = tracks_pos + tracks.len() as u64;
        let cues_pos = clusters_pos + self.clusters.len() as u64;
        let cues = self.cues(clusters_pos);

        let mut segment = Vec::with_capacity(cues_pos as usize + cues.len());
        segment.extend_from_slice(&seek_head(info_pos, tracks_pos, cues_pos));
        segment.extend_from_slice(&info);
        segment.extend_from_slice(&tracks);
        segment.append(&mut self.clusters);
        segment.extend_from_slice(&cues);

        let mut out = Vec::with_capacity(segment.len() + 64);
        write_master(&mut out, ids::EBML, |header| {
            write_uint(header, ids::EBML_VERSION, 1);
            write_uint(header, ids::EBML_READ_VERSION, 1);
            write_uint(header, ids::EBML_MAX_ID_LENGTH, 4);
            write_uint(header, ids::EBML_MAX_SIZE_LENGTH, 8);
            write_string(header, ids::DOC_TYPE, "webm");
            write_uint(header, ids::DOC_TYPE_VERSION, 4);
            write_uint(header, ids::DOC_TYPE_READ_VERSION, 2);
        });
        write_element(&mut out, ids::SEGMENT, &segment);

        log::debug!(
            "webm finalized: {} chunks, {} cues, {} bytes",
            self.chunk_count,
            self.cues.len(),
            out.len()
        );
        Ok(Bytes::from(out))
    }

    fn close_cluster(&mut self) {
        if let Some(cluster) = self.cluster.take() {
            write_master(&mut self.clusters, ids::CLUSTER, |body| {
                write_uint(body, ids::TIMESTAMP, cluster.timestamp_ms);
                body.extend_from_slice(&cluster.body);
            });
        }
    }

    fn info(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_master(&mut buf, ids::INFO, |info| {
            write_uint(info, ids::TIMESTAMP_SCALE, TIMESTAMP_SCALE);
            write_string(info, ids::MUXING_APP, MUXING_APP);
            write_string(info, ids::WRITING_APP, MUXING_APP);
            write_float(info, ids::DURATION, self.end_micros as f64 / 1000.0);
        });
        buf
    }

    fn tracks(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_master(&mut buf, ids::TRACKS, |tracks| {
            write_master(tracks, ids::TRACK_ENTRY, |entry| {
                write_uint(entry, ids::TRACK_NUMBER, TRACK_NUMBER);
                write_uint(entry, ids::TRACK_UID, TRACK_NUMBER);
                write_uint(entry, ids::TRACK_TYPE, 1); // video
                write_uint(entry, ids::FLAG_LACING, 0);
                write_string(entry, ids::CODEC_ID, CODEC_ID);
                if self.config.frame_rate > 0 {
                    write_uint(
                        entry,
                        ids::DEFAULT_DURATION,
                        1_000_000_000 / self.config.frame_rate as u64,
                    );
                }
                if self.config.alpha {
                    write_uint(entry, ids::MAX_BLOCK_ADDITION_ID, 1);
                }
                write_master(entry, ids::VIDEO, |video| {
                    write_uint(video, ids::PIXEL_WIDTH, self.config.width as u64);
                    write_uint(video, ids::PIXEL_HEIGHT, self.config.height as u64);
                    if self.config.alpha {
                        write_uint(video, ids::ALPHA_MODE, 1);
                    }
                });
            });
        });
        buf
    }

    fn cues(&self, clusters_pos: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.cues.is_empty() {
            return buf;
        }
        write_master(&mut buf, ids::CUES, |cues| {
            for cue in &self.cues {
                write_master(cues, ids::CUE_POINT, |point| {
                    write_uint(point, ids::CUE_TIME, cue.time_ms);
                    write_master(point, ids::CUE_TRACK_POSITIONS, |positions| {
                        write_uint(positions, ids::CUE_TRACK, TRACK_NUMBER);
                        write_uint(
                            positions,
                            ids::CUE_CLUSTER_POSITION,
                            clusters_pos + cue.cluster_offset,
                        );
                    });
                });
            }
        });
        buf
    }
}

fn block_payload(relative_ms: i16, flags: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.push(0x80 | TRACK_NUMBER as u8);
    payload.extend_from_slice(&relative_ms.to_be_bytes());
    payload.push(flags);
    payload.extend_from_slice(data);
    payload
}

fn seek_head(info_pos: u64, tracks_pos: u64, cues_pos: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    write_master(&mut buf, ids::SEEK_HEAD, |head| {
        for (id, pos) in [
            (ids::INFO, info_pos),
            (ids::TRACKS, tracks_pos),
            (ids::CUES, cues_pos),
        ] {
            write_master(head, ids::SEEK, |seek| {
                let mut id_bytes = Vec::new();
                write_id(&mut id_bytes, id);
                write_element(seek, ids::SEEK_ID, &id_bytes);
                write_uint_fixed(seek, ids::SEEK_POSITION, pos);
            });
        }
    });
    buf
}
