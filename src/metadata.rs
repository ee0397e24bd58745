//! Media file metadata (similar to ffprobe), read straight from an exported
//! WebM or MP4 buffer.

use std::fmt;

use bytes::Bytes;

use crate::muxer::webm::ids;

/// Format-level info (corresponds to ffprobe format).
#[derive(Debug, Clone)]
pub struct FormatInfo {
    /// "webm" or "mp4".
    pub format_name: String,
    /// Duration in seconds; None if the file carries none.
    pub duration_sec: Option<f64>,
    /// Total bitrate in bps; 0 if unknown.
    pub bit_rate: i64,
    /// Number of streams.
    pub nb_streams: u32,
    /// Seek index size: cue points for WebM, sync samples for MP4.
    pub index_entries: u32,
    /// MP4 only: whether `moov` precedes `mdat`.
    pub fast_start: Option<bool>,
}

/// Per-stream info (corresponds to ffprobe stream).
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    /// "video" for every stream this crate writes.
    pub codec_type: String,
    /// Matroska codec ID or MP4 sample entry type, e.g. "V_VP9", "avc1".
    pub codec_name: String,
    /// Time base, e.g. "1/1000"
    pub time_base: String,
    /// Stream duration in time_base units; None if unknown.
    pub duration_ts: Option<i64>,
    /// Frame rate, e.g. "30/1"
    pub rate: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// WebM only: the track's AlphaMode flag.
    pub has_alpha: Option<bool>,
    pub frame_count: u64,
}

/// One stored frame, in file order.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub timestamp_micros: u64,
    pub is_key: bool,
    pub data: Bytes,
    /// WebM BlockAdditional payload, if any.
    pub side_data: Option<Bytes>,
}

/// Full probe result (format + streams, like ffprobe).
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
    pub packets: Vec<PacketInfo>,
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FORMAT]")?;
        writeln!(f, "format_name={}", self.format.format_name)?;
        if let Some(d) = self.format.duration_sec {
            writeln!(f, "duration_sec={:.3}", d)?;
        } else {
            writeln!(f, "duration_sec=N/A")?;
        }
        writeln!(f, "bit_rate={}", self.format.bit_rate)?;
        writeln!(f, "nb_streams={}", self.format.nb_streams)?;
        writeln!(f, "index_entries={}", self.format.index_entries)?;
        if let Some(fast_start) = self.format.fast_start {
            writeln!(f, "fast_start={}", fast_start)?;
        }
        writeln!(f, "[/FORMAT]")?;
        for s in &self.streams {
            writeln!(f, "[STREAM]")?;
            writeln!(f, "index={}", s.index)?;
            writeln!(f, "codec_type={}", s.codec_type)?;
            writeln!(f, "codec_name={}", s.codec_name)?;
            writeln!(f, "time_base={}", s.time_base)?;
            if let Some(d) = s.duration_ts {
                writeln!(f, "duration_ts={}", d)?;
            }
            writeln!(f, "rate={}", s.rate)?;
            if let Some(w) = s.width {
                writeln!(f, "width={}", w)?;
            }
            if let Some(h) = s.height {
                writeln!(f, "height={}", h)?;
            }
            if let Some(a) = s.has_alpha {
                writeln!(f, "has_alpha={}", a)?;
            }
            writeln!(f, "nb_frames={}", s.frame_count)?;
            writeln!(f, "[/STREAM]")?;
        }
        Ok(())
    }
}

/// Parses an in-memory WebM or MP4 file and returns its metadata and packets.
///
/// # Example
///
/// ```ignore
/// let blob = exporter.finalize().await?;
/// let info = frame_export::probe(&blob.data)?;
/// println!("{}", info);
/// ```
pub fn probe(data: &[u8]) -> anyhow::Result<MediaInfo> {
    let mut info = if data.starts_with(&ids::EBML.to_be_bytes()) {
        probe_webm(data)?
    } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
        probe_mp4(data)?
    } else {
        anyhow::bail!("unrecognized container");
    };
    if let Some(duration) = info.format.duration_sec.filter(|d| *d > 0.0) {
        info.format.bit_rate = (data.len() as f64 * 8.0 / duration) as i64;
    }
    Ok(info)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn rate_string(num: u64, den: u64) -> String {
    if num == 0 || den == 0 {
        return "0/0".to_string();
    }
    let g = gcd(num, den);
    format!("{}/{}", num / g, den / g)
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

// ---- WebM ----

fn read_vint(buf: &[u8], pos: usize, keep_marker: bool) -> anyhow::Result<(u64, usize)> {
    let Some(&first) = buf.get(pos) else {
        anyhow::bail!("truncated element at {}", pos);
    };
    if first == 0 {
        anyhow::bail!("invalid vint at {}", pos);
    }
    let len = first.leading_zeros() as usize + 1;
    let Some(bytes) = buf.get(pos..pos + len) else {
        anyhow::bail!("truncated vint at {}", pos);
    };
    let mut value = if keep_marker {
        first as u64
    } else {
        (first & (0xFF >> len)) as u64
    };
    for b in &bytes[1..] {
        value = (value << 8) | *b as u64;
    }
    Ok((value, len))
}

/// Children of an EBML master element as `(id, body)` pairs.
fn ebml_children(buf: &[u8]) -> anyhow::Result<Vec<(u32, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (id, id_len) = read_vint(buf, pos, true)?;
        if id_len > 4 {
            anyhow::bail!("element id too long at {}", pos);
        }
        pos += id_len;
        let (size, size_len) = read_vint(buf, pos, false)?;
        pos += size_len;
        let unknown = size == (1u64 << (7 * size_len)) - 1;
        let end = if unknown {
            buf.len()
        } else {
            pos.checked_add(size as usize)
                .filter(|end| *end <= buf.len())
                .ok_or_else(|| anyhow::anyhow!("element {:#x} overruns its parent", id))?
        };
        out.push((id as u32, &buf[pos..end]));
        pos = end;
    }
    Ok(out)
}

fn ebml_float(body: &[u8]) -> anyhow::Result<f64> {
    match body.len() {
        4 => Ok(f32::from_be_bytes(body.try_into()?) as f64),
        8 => Ok(f64::from_be_bytes(body.try_into()?)),
        0 => Ok(0.0),
        n => anyhow::bail!("invalid float size {}", n),
    }
}

struct Block<'a> {
    relative: i16,
    flags: u8,
    data: &'a [u8],
}

fn parse_block(body: &[u8]) -> anyhow::Result<Block<'_>> {
    let (_track, len) = read_vint(body, 0, false)?;
    let Some(header) = body.get(len..len + 3) else {
        anyhow::bail!("truncated block header");
    };
    Ok(Block {
        relative: i16::from_be_bytes([header[0], header[1]]),
        flags: header[2],
        data: &body[len + 3..],
    })
}

fn probe_webm(data: &[u8]) -> anyhow::Result<MediaInfo> {
    let top = ebml_children(data)?;

    let mut format_name = String::from("matroska");
    let mut segment = None;
    for (id, body) in top {
        match id {
            ids::EBML => {
                for (id, body) in ebml_children(body)? {
                    if id == ids::DOC_TYPE {
                        format_name = String::from_utf8_lossy(body).into_owned();
                    }
                }
            }
            ids::SEGMENT => segment = Some(body),
            _ => {}
        }
    }
    let Some(segment) = segment else {
        anyhow::bail!("no Segment element");
    };

    let mut scale = 1_000_000u64;
    let mut duration = None;
    let mut streams = Vec::new();
    let mut packets = Vec::new();
    let mut cue_points = 0u32;

    for (id, body) in ebml_children(segment)? {
        match id {
            ids::INFO => {
                for (id, body) in ebml_children(body)? {
                    match id {
                        ids::TIMESTAMP_SCALE => scale = be_uint(body),
                        ids::DURATION => duration = Some(ebml_float(body)?),
                        _ => {}
                    }
                }
            }
            ids::TRACKS => {
                for (id, entry) in ebml_children(body)? {
                    if id == ids::TRACK_ENTRY {
                        streams.push(webm_track(streams.len(), entry, scale)?);
                    }
                }
            }
            ids::CLUSTER => webm_cluster(body, scale, &mut packets)?,
            ids::CUES => {
                cue_points += ebml_children(body)?
                    .iter()
                    .filter(|(id, _)| *id == ids::CUE_POINT)
                    .count() as u32;
            }
            _ => {}
        }
    }

    let duration_sec = duration.map(|ticks| ticks * scale as f64 / 1e9);
    for stream in &mut streams {
        stream.frame_count = packets.len() as u64;
        stream.duration_ts = duration.map(|ticks| ticks.round() as i64);
    }

    Ok(MediaInfo {
        format: FormatInfo {
            format_name,
            duration_sec,
            bit_rate: 0,
            nb_streams: streams.len() as u32,
            index_entries: cue_points,
            fast_start: None,
        },
        streams,
        packets,
    })
}

fn webm_track(index: usize, entry: &[u8], scale: u64) -> anyhow::Result<StreamInfo> {
    let mut stream = StreamInfo {
        index,
        codec_type: "video".to_string(),
        codec_name: String::new(),
        time_base: rate_string(scale, 1_000_000_000),
        duration_ts: None,
        rate: "0/0".to_string(),
        width: None,
        height: None,
        has_alpha: Some(false),
        frame_count: 0,
    };
    for (id, body) in ebml_children(entry)? {
        match id {
            ids::CODEC_ID => stream.codec_name = String::from_utf8_lossy(body).into_owned(),
            ids::DEFAULT_DURATION => stream.rate = rate_string(1_000_000_000, be_uint(body)),
            ids::VIDEO => {
                for (id, body) in ebml_children(body)? {
                    match id {
                        ids::PIXEL_WIDTH => stream.width = Some(be_uint(body) as u32),
                        ids::PIXEL_HEIGHT => stream.height = Some(be_uint(body) as u32),
                        ids::ALPHA_MODE => stream.has_alpha = Some(be_uint(body) == 1),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    Ok(stream)
}

fn webm_cluster(body: &[u8], scale: u64, packets: &mut Vec<PacketInfo>) -> anyhow::Result<()> {
    let mut cluster_ts = 0u64;
    let to_micros = |ts: i64| (ts.max(0) as u64) * scale / 1000;

    for (id, body) in ebml_children(body)? {
        match id {
            ids::TIMESTAMP => cluster_ts = be_uint(body),
            ids::SIMPLE_BLOCK => {
                let block = parse_block(body)?;
                packets.push(PacketInfo {
                    timestamp_micros: to_micros(cluster_ts as i64 + block.relative as i64),
                    is_key: block.flags & 0x80 != 0,
                    data: Bytes::copy_from_slice(block.data),
                    side_data: None,
                });
            }
            ids::BLOCK_GROUP => {
                let mut block = None;
                let mut side_data = None;
                let mut referenced = false;
                for (id, body) in ebml_children(body)? {
                    match id {
                        ids::BLOCK => block = Some(parse_block(body)?),
                        ids::REFERENCE_BLOCK => referenced = true,
                        ids::BLOCK_ADDITIONS => {
                            for (_, more) in ebml_children(body)? {
                                for (id, body) in ebml_children(more)? {
                                    if id == ids::BLOCK_ADDITIONAL {
                                        side_data = Some(Bytes::copy_from_slice(body));
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                let Some(block) = block else {
                    anyhow::bail!("BlockGroup without Block");
                };
                packets.push(PacketInfo {
                    timestamp_micros: to_micros(cluster_ts as i64 + block.relative as i64),
                    is_key: !referenced,
                    data: Bytes::copy_from_slice(block.data),
                    side_data,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

// ---- MP4 ----

/// Boxes directly inside `buf` as `(type, body)` pairs, with their offsets.
fn mp4_boxes(buf: &[u8]) -> anyhow::Result<Vec<([u8; 4], usize, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 8 <= buf.len() {
        let size = be_uint(&buf[pos..pos + 4]);
        let kind: [u8; 4] = buf[pos + 4..pos + 8].try_into()?;
        let (header, size) = match size {
            0 => (8, (buf.len() - pos) as u64),
            1 => {
                let Some(large) = buf.get(pos + 8..pos + 16) else {
                    anyhow::bail!("truncated large box header");
                };
                (16, be_uint(large))
            }
            n => (8, n),
        };
        let end = pos
            .checked_add(size as usize)
            .filter(|end| *end <= buf.len() && size >= header as u64)
            .ok_or_else(|| {
                anyhow::anyhow!("box {} overruns its parent", String::from_utf8_lossy(&kind))
            })?;
        out.push((kind, pos, &buf[pos + header..end]));
        pos = end;
    }
    Ok(out)
}

fn child<'a>(buf: &'a [u8], kind: &[u8; 4]) -> anyhow::Result<Option<&'a [u8]>> {
    Ok(mp4_boxes(buf)?
        .into_iter()
        .find(|(k, _, _)| k == kind)
        .map(|(_, _, body)| body))
}

fn require<'a>(buf: &'a [u8], kind: &[u8; 4]) -> anyhow::Result<&'a [u8]> {
    child(buf, kind)?
        .ok_or_else(|| anyhow::anyhow!("missing {} box", String::from_utf8_lossy(kind)))
}

fn field(buf: &[u8], offset: usize, len: usize) -> anyhow::Result<u64> {
    buf.get(offset..offset + len)
        .map(be_uint)
        .ok_or_else(|| anyhow::anyhow!("box too short for field at {}", offset))
}

/// `(timescale, duration)` from an `mvhd` or `mdhd` body.
fn timescale_duration(body: &[u8]) -> anyhow::Result<(u64, u64)> {
    if field(body, 0, 1)? == 1 {
        Ok((field(body, 20, 4)?, field(body, 24, 8)?))
    } else {
        Ok((field(body, 12, 4)?, field(body, 16, 4)?))
    }
}

/// Entries of a full box table that starts with an entry count.
fn table(body: &[u8], entry_len: usize) -> anyhow::Result<Vec<&[u8]>> {
    let count = field(body, 4, 4)? as usize;
    let Some(entries) = body.get(8..8 + count * entry_len) else {
        anyhow::bail!("table shorter than its entry count");
    };
    Ok(entries.chunks_exact(entry_len).collect())
}

fn probe_mp4(data: &[u8]) -> anyhow::Result<MediaInfo> {
    let top = mp4_boxes(data)?;
    let position = |kind: &[u8; 4]| top.iter().find(|(k, _, _)| k == kind).map(|(_, p, _)| *p);
    let fast_start = match (position(b"moov"), position(b"mdat")) {
        (Some(moov), Some(mdat)) => Some(moov < mdat),
        _ => None,
    };
    let moov = top
        .iter()
        .find(|(k, _, _)| k == b"moov")
        .map(|(_, _, body)| *body)
        .ok_or_else(|| anyhow::anyhow!("missing moov box"))?;

    let (movie_timescale, movie_duration) = timescale_duration(require(moov, b"mvhd")?)?;
    let duration_sec =
        (movie_timescale > 0).then(|| movie_duration as f64 / movie_timescale as f64);

    let mut streams = Vec::new();
    let mut packets = Vec::new();
    let mut index_entries = 0;
    for (kind, _, trak) in mp4_boxes(moov)? {
        if &kind != b"trak" {
            continue;
        }
        let tkhd = require(trak, b"tkhd")?;
        let width = field(tkhd, tkhd.len().saturating_sub(8), 4)? >> 16;
        let height = field(tkhd, tkhd.len().saturating_sub(4), 4)? >> 16;

        let mdia = require(trak, b"mdia")?;
        let (timescale, duration) = timescale_duration(require(mdia, b"mdhd")?)?;
        let handler = require(mdia, b"hdlr")?;
        let codec_type = match handler.get(8..12) {
            Some(b"vide") => "video",
            Some(b"soun") => "audio",
            _ => "data",
        };
        let stbl = require(require(mdia, b"minf")?, b"stbl")?;

        let stsd = require(stbl, b"stsd")?;
        let codec_name = stsd
            .get(12..16)
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();

        let track = mp4_samples(stbl, timescale)?;
        index_entries += track.sync_count;
        let frame_count = track.packets.len() as u64;
        streams.push(StreamInfo {
            index: streams.len(),
            codec_type: codec_type.to_string(),
            codec_name,
            time_base: format!("1/{}", timescale),
            duration_ts: Some(duration as i64),
            rate: rate_string(frame_count * timescale, duration),
            width: Some(width as u32),
            height: Some(height as u32),
            has_alpha: None,
            frame_count,
        });

        // sample payloads come from the top-level buffer
        for (offset, size, mut packet) in track.packets {
            let Some(bytes) = data.get(offset as usize..(offset + size) as usize) else {
                anyhow::bail!("sample at {} lies outside the file", offset);
            };
            packet.data = Bytes::copy_from_slice(bytes);
            packets.push(packet);
        }
    }

    Ok(MediaInfo {
        format: FormatInfo {
            format_name: "mp4".to_string(),
            duration_sec,
            bit_rate: 0,
            nb_streams: streams.len() as u32,
            index_entries,
            fast_start,
        },
        streams,
        packets,
    })
}

struct TrackSamples {
    /// `(file offset, size, packet without data)`
    packets: Vec<(u64, u64, PacketInfo)>,
    sync_count: u32,
}

fn mp4_samples(stbl: &[u8], timescale: u64) -> anyhow::Result<TrackSamples> {
    let stsz = require(stbl, b"stsz")?;
    let uniform = field(stsz, 4, 4)?;
    let count = field(stsz, 8, 4)? as usize;
    let sizes: Vec<u64> = if uniform != 0 {
        vec![uniform; count]
    } else {
        (0..count)
            .map(|i| field(stsz, 12 + i * 4, 4))
            .collect::<anyhow::Result<_>>()?
    };

    let mut times = Vec::with_capacity(count);
    let mut ticks = 0u64;
    for entry in table(require(stbl, b"stts")?, 8)? {
        for _ in 0..be_uint(&entry[..4]) {
            times.push(ticks);
            ticks += be_uint(&entry[4..]);
        }
    }

    let sync: Option<Vec<u64>> = child(stbl, b"stss")?
        .map(|stss| table(stss, 4).map(|rows| rows.into_iter().map(be_uint).collect()))
        .transpose()?;
    let sync_count = match &sync {
        Some(rows) => rows.len() as u32,
        None => count as u32,
    };

    let chunk_offsets: Vec<u64> = match child(stbl, b"co64")? {
        Some(co64) => table(co64, 8)?.into_iter().map(be_uint).collect(),
        None => table(require(stbl, b"stco")?, 4)?
            .into_iter()
            .map(be_uint)
            .collect(),
    };
    let stsc: Vec<(u64, u64)> = table(require(stbl, b"stsc")?, 12)?
        .into_iter()
        .map(|row| (be_uint(&row[..4]), be_uint(&row[4..8])))
        .collect();

    let mut packets = Vec::with_capacity(count);
    let mut sample = 0usize;
    for (n, chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = n as u64 + 1;
        let per_chunk = stsc
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_number)
            .map(|(_, per)| *per)
            .unwrap_or(0);
        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            let Some(&size) = sizes.get(sample) else {
                break;
            };
            let time = times.get(sample).copied().unwrap_or(ticks);
            let number = sample as u64 + 1;
            packets.push((
                offset,
                size,
                PacketInfo {
                    timestamp_micros: if timescale > 0 { time * 1_000_000 / timescale } else { 0 },
                    is_key: sync.as_ref().is_none_or(|rows| rows.contains(&number)),
                    data: Bytes::new(),
                    side_data: None,
                },
            ));
            offset += size;
            sample += 1;
        }
    }

    Ok(TrackSamples {
        packets,
        sync_count,
    })
}
