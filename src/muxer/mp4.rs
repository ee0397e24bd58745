//! Fast-start MP4 writer for a single H.264 track.
//!
//! Samples accumulate in memory; finalize lays the file out as
//! `ftyp` + `moov` + `mdat` so the index precedes the media data and the
//! result streams without a second pass.

use bytes::Bytes;

use crate::chunk::{ChunkMetadata, EncodedChunk};
use crate::muxer::MuxerConfig;
use crate::muxer::avc::{AvcDecoderConfig, annex_b_to_length_prefixed, is_annex_b};

pub const CODEC: &str = "avc1.42001f";
const COMPRESSOR_NAME: &[u8] = b"frame-export";
const TRACK_ID: u32 = 1;
const MOVIE_TIMESCALE: u32 = 1_000;
/// Media timescale in ticks per second: sample times stay in microseconds.
const MEDIA_TIMESCALE: u32 = 1_000_000;
const MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

struct Sample {
    size: u32,
    timestamp_micros: u64,
    duration_micros: u64,
    is_sync: bool,
}

pub struct Mp4Muxer {
    config: MuxerConfig,
    mdat: Vec<u8>,
    samples: Vec<Sample>,
    /// `avcC` record body.
    decoder_config: Option<Vec<u8>>,
    /// An out-of-band description was supplied: samples are already
    /// length-prefixed and must not be sniffed for start codes.
    length_prefixed: bool,
    have_finalized: bool,
}

impl Mp4Muxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            mdat: Vec::new(),
            samples: Vec::new(),
            decoder_config: None,
            length_prefixed: false,
            have_finalized: false,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn append(
        &mut self,
        chunk: &EncodedChunk,
        metadata: Option<&ChunkMetadata>,
    ) -> anyhow::Result<()> {
        if self.have_finalized {
            anyhow::bail!("mp4 muxer already finalized");
        }
        if self.samples.is_empty() && !chunk.is_key() {
            anyhow::bail!("first mp4 sample must be a key frame");
        }
        if let Some(last) = self.samples.last() {
            if chunk.timestamp_micros() < last.timestamp_micros {
                anyhow::bail!(
                    "sample timestamp {}us goes back before {}us",
                    chunk.timestamp_micros(),
                    last.timestamp_micros
                );
            }
        }

        if self.decoder_config.is_none() {
            let description = metadata
                .and_then(|m| m.decoder_config.as_ref())
                .and_then(|c| c.description.as_ref());
            if let Some(description) = description {
                self.decoder_config = Some(description.to_vec());
                self.length_prefixed = true;
            }
        }

        let data = chunk.data();
        // a length-prefixed NAL of 256..512 bytes starts with 00 00 01
        let payload = if self.length_prefixed {
            data.to_vec()
        } else if is_annex_b(data) {
            if self.decoder_config.is_none() && chunk.is_key() {
                self.decoder_config = AvcDecoderConfig::from_annex_b(data).map(|c| c.to_bytes());
            }
            annex_b_to_length_prefixed(data)
        } else {
            data.to_vec()
        };

        self.samples.push(Sample {
            size: u32::try_from(payload.len())?,
            timestamp_micros: chunk.timestamp_micros(),
            duration_micros: chunk.duration_micros(),
            is_sync: chunk.is_key(),
        });
        self.mdat.extend_from_slice(&payload);
        Ok(())
    }

    pub fn finalize(&mut self) -> anyhow::Result<Bytes> {
        if self.have_finalized {
            anyhow::bail!("mp4 muxer already finalized");
        }
        self.have_finalized = true;

        if self.samples.is_empty() {
            anyhow::bail!("no samples were muxed");
        }
        if self.config.width > u16::MAX as u32 || self.config.height > u16::MAX as u32 {
            anyhow::bail!(
                "{}x{} does not fit an avc1 sample entry",
                self.config.width,
                self.config.height
            );
        }
        let Some(avcc) = self.decoder_config.take() else {
            anyhow::bail!("no H.264 decoder configuration (SPS/PPS) was seen");
        };

        let deltas = self.sample_deltas();
        let duration: u64 = deltas.iter().map(|d| *d as u64).sum();

        let mut ftyp = Vec::new();
        write_box(&mut ftyp, b"ftyp", |b| {
            b.extend_from_slice(b"isom"); // major brand
            b.extend_from_slice(&512u32.to_be_bytes()); // minor version
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                b.extend_from_slice(brand);
            }
        });

        let large_mdat = self.mdat.len() as u64 + 8 > u32::MAX as u64;
        let mdat_header_len: u64 = if large_mdat { 16 } else { 8 };

        // moov size does not depend on the offset value, only on its width
        let mut use_co64 = false;
        let mut moov = self.moov(&avcc, &deltas, duration, 0, use_co64);
        let mut data_offset = (ftyp.len() + moov.len()) as u64 + mdat_header_len;
        if data_offset + self.mdat.len() as u64 > u32::MAX as u64 {
            use_co64 = true;
            moov = self.moov(&avcc, &deltas, duration, 0, use_co64);
            data_offset = (ftyp.len() + moov.len()) as u64 + mdat_header_len;
        }
        let moov = self.moov(&avcc, &deltas, duration, data_offset, use_co64);

        let mut out = Vec::with_capacity(data_offset as usize + self.mdat.len());
        out.extend_from_slice(&ftyp);
        out.extend_from_slice(&moov);
        if large_mdat {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(b"mdat");
            out.extend_from_slice(&(self.mdat.len() as u64 + 16).to_be_bytes());
        } else {
            out.extend_from_slice(&(self.mdat.len() as u32 + 8).to_be_bytes());
            out.extend_from_slice(b"mdat");
        }
        out.append(&mut self.mdat);

        log::debug!(
            "mp4 finalized: {} samples, {}us, {} bytes",
            self.samples.len(),
            duration,
            out.len()
        );
        Ok(Bytes::from(out))
    }

    /// Per-sample durations: the gap to the next sample, and the chunk's own
    /// duration for the last one.
    fn sample_deltas(&self) -> Vec<u32> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, sample)| {
                let delta = match self.samples.get(i + 1) {
                    Some(next) => next.timestamp_micros - sample.timestamp_micros,
                    None => sample.duration_micros,
                };
                delta.min(u32::MAX as u64) as u32
            })
            .collect()
    }

    fn moov(
        &self,
        avcc: &[u8],
        deltas: &[u32],
        duration: u64,
        data_offset: u64,
        use_co64: bool,
    ) -> Vec<u8> {
        let movie_duration = duration * MOVIE_TIMESCALE as u64 / MEDIA_TIMESCALE as u64;
        let mut buf = Vec::new();
        write_box(&mut buf, b"moov", |moov| {
            write_full_box(moov, b"mvhd", 1, 0, |b| {
                b.extend_from_slice(&0u64.to_be_bytes()); // creation time
                b.extend_from_slice(&0u64.to_be_bytes()); // modification time
                b.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
                b.extend_from_slice(&movie_duration.to_be_bytes());
                b.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate 1.0
                b.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
                b.extend_from_slice(&[0; 10]); // reserved
                write_matrix(b);
                b.extend_from_slice(&[0; 24]); // pre_defined
                b.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next_track_id
            });
            write_box(moov, b"trak", |trak| {
                write_full_box(trak, b"tkhd", 1, 3, |b| {
                    b.extend_from_slice(&0u64.to_be_bytes());
                    b.extend_from_slice(&0u64.to_be_bytes());
                    b.extend_from_slice(&TRACK_ID.to_be_bytes());
                    b.extend_from_slice(&0u32.to_be_bytes()); // reserved
                    b.extend_from_slice(&movie_duration.to_be_bytes());
                    b.extend_from_slice(&[0; 8]); // reserved
                    b.extend_from_slice(&0u16.to_be_bytes()); // layer
                    b.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
                    b.extend_from_slice(&0u16.to_be_bytes()); // volume
                    b.extend_from_slice(&0u16.to_be_bytes()); // reserved
                    write_matrix(b);
                    b.extend_from_slice(&(self.config.width << 16).to_be_bytes());
                    b.extend_from_slice(&(self.config.height << 16).to_be_bytes());
                });
                write_box(trak, b"mdia", |mdia| {
                    write_full_box(mdia, b"mdhd", 1, 0, |b| {
                        b.extend_from_slice(&0u64.to_be_bytes());
                        b.extend_from_slice(&0u64.to_be_bytes());
                        b.extend_from_slice(&MEDIA_TIMESCALE.to_be_bytes());
                        b.extend_from_slice(&duration.to_be_bytes());
                        b.extend_from_slice(&0x55c4u16.to_be_bytes()); // language "und"
                        b.extend_from_slice(&0u16.to_be_bytes());
                    });
                    write_full_box(mdia, b"hdlr", 0, 0, |b| {
                        b.extend_from_slice(&0u32.to_be_bytes());
                        b.extend_from_slice(b"vide");
                        b.extend_from_slice(&[0; 12]);
                        b.extend_from_slice(b"VideoHandler\0");
                    });
                    write_box(mdia, b"minf", |minf| {
                        write_full_box(minf, b"vmhd", 0, 1, |b| {
                            b.extend_from_slice(&[0; 8]); // graphics mode + opcolor
                        });
                        write_box(minf, b"dinf", |dinf| {
                            write_full_box(dinf, b"dref", 0, 0, |b| {
                                b.extend_from_slice(&1u32.to_be_bytes());
                                write_full_box(b, b"url ", 0, 1, |_| {});
                            });
                        });
                        write_box(minf, b"stbl", |stbl| {
                            self.write_stsd(stbl, avcc);
                            self.write_sample_tables(stbl, deltas, data_offset, use_co64);
                        });
                    });
                });
            });
        });
        buf
    }

    fn write_stsd(&self, buf: &mut Vec<u8>, avcc: &[u8]) {
        write_full_box(buf, b"stsd", 0, 0, |stsd| {
            stsd.extend_from_slice(&1u32.to_be_bytes()); // entry_count
            write_box(stsd, b"avc1", |b| {
                b.extend_from_slice(&[0; 6]); // reserved
                b.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
                b.extend_from_slice(&[0; 16]); // pre_defined + reserved
                b.extend_from_slice(&(self.config.width as u16).to_be_bytes());
                b.extend_from_slice(&(self.config.height as u16).to_be_bytes());
                b.extend_from_slice(&0x00480000u32.to_be_bytes()); // 72 dpi
                b.extend_from_slice(&0x00480000u32.to_be_bytes());
                b.extend_from_slice(&0u32.to_be_bytes()); // reserved
                b.extend_from_slice(&1u16.to_be_bytes()); // frame_count

                let mut compressor = [0u8; 32];
                compressor[0] = COMPRESSOR_NAME.len() as u8;
                compressor[1..1 + COMPRESSOR_NAME.len()].copy_from_slice(COMPRESSOR_NAME);
                b.extend_from_slice(&compressor);

                b.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
                b.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
                write_box(b, b"avcC", |c| c.extend_from_slice(avcc));
            });
        });
    }

    fn write_sample_tables(
        &self,
        buf: &mut Vec<u8>,
        deltas: &[u32],
        data_offset: u64,
        use_co64: bool,
    ) {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for delta in deltas {
            match runs.last_mut() {
                Some((count, last)) if last == delta => *count += 1,
                _ => runs.push((1, *delta)),
            }
        }
        write_full_box(buf, b"stts", 0, 0, |b| {
            b.extend_from_slice(&(runs.len() as u32).to_be_bytes());
            for (count, delta) in &runs {
                b.extend_from_slice(&count.to_be_bytes());
                b.extend_from_slice(&delta.to_be_bytes());
            }
        });

        // no stss means every sample is a sync sample
        if self.samples.iter().any(|s| !s.is_sync) {
            let sync: Vec<u32> = self
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            write_full_box(buf, b"stss", 0, 0, |b| {
                b.extend_from_slice(&(sync.len() as u32).to_be_bytes());
                for number in &sync {
                    b.extend_from_slice(&number.to_be_bytes());
                }
            });
        }

        // every sample lives in one chunk
        write_full_box(buf, b"stsc", 0, 0, |b| {
            b.extend_from_slice(&1u32.to_be_bytes());
            b.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
            b.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
            b.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
        });

        write_full_box(buf, b"stsz", 0, 0, |b| {
            b.extend_from_slice(&0u32.to_be_bytes()); // sizes vary
            b.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
            for sample in &self.samples {
                b.extend_from_slice(&sample.size.to_be_bytes());
            }
        });

        if use_co64 {
            write_full_box(buf, b"co64", 0, 0, |b| {
                b.extend_from_slice(&1u32.to_be_bytes());
                b.extend_from_slice(&data_offset.to_be_bytes());
            });
        } else {
            write_full_box(buf, b"stco", 0, 0, |b| {
                b.extend_from_slice(&1u32.to_be_bytes());
                b.extend_from_slice(&(data_offset as u32).to_be_bytes());
            });
        }
    }
}

fn write_box(buf: &mut Vec<u8>, kind: &[u8; 4], content: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(kind);
    content(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut Vec<u8>,
    kind: &[u8; 4],
    version: u8,
    flags: u32,
    content: impl FnOnce(&mut Vec<u8>),
) {
    write_box(buf, kind, |b| {
        b.push(version);
        b.extend_from_slice(&flags.to_be_bytes()[1..]);
        content(b);
    });
}

fn write_matrix(buf: &mut Vec<u8>) {
    for m in &MATRIX {
        buf.extend_from_slice(&m.to_be_bytes());
    }
}
