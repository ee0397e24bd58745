//! H.264 byte-stream helpers for the MP4 muxer: Annex B splitting, `avcC`
//! records and length-prefixed sample payloads.

use bytes::Bytes;

pub mod nal_unit_type {
    pub const IDR_SLICE: u8 = 5;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Whether `data` starts with a 3- or 4-byte start code.
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Splits an Annex B stream into NAL units, without start codes.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        // zero_byte of a following 4-byte start code, or trailing padding
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// Rewrites an Annex B access unit as 4-byte length-prefixed NAL units.
/// Parameter sets and delimiters are dropped; they live in `avcC`.
pub fn annex_b_to_length_prefixed(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    for nal in split_annex_b(data) {
        match nal_type(nal) {
            nal_unit_type::SPS | nal_unit_type::PPS | nal_unit_type::AUD => continue,
            _ => {}
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Contents of an `AVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    /// Collects parameter sets from an Annex B access unit. `None` when either
    /// kind is missing.
    pub fn from_annex_b(data: &[u8]) -> Option<Self> {
        let mut config = Self::default();
        for nal in split_annex_b(data) {
            match nal_type(nal) {
                nal_unit_type::SPS => config.sps.push(Bytes::copy_from_slice(nal)),
                nal_unit_type::PPS => config.pps.push(Bytes::copy_from_slice(nal)),
                _ => {}
            }
        }
        (!config.sps.is_empty() && !config.pps.is_empty()).then_some(config)
    }

    /// Serializes the record body (the payload of an `avcC` box).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(1); // configuration_version

        // profile, compatibility and level straight from the first SPS
        match self.sps.first() {
            Some(sps) if sps.len() >= 4 => buf.extend_from_slice(&sps[1..4]),
            _ => buf.extend_from_slice(&[0x42, 0x00, 0x1f]),
        }

        buf.push(0xFF); // 4-byte NAL lengths
        buf.push(0xE0 | self.sps.len() as u8);
        for sps in &self.sps {
            buf.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            buf.extend_from_slice(sps);
        }
        buf.push(self.pps.len() as u8);
        for pps in &self.pps {
            buf.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            buf.extend_from_slice(pps);
        }
        buf
    }
}
