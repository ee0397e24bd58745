use std::fmt::{Display, Formatter};

use bytes::Bytes;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Pixel layout of a rendered bitmap. Both are 8 bits per channel, 4 bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        4
    }
}

/// A rendered bitmap handed over by the caller. Rows are tightly packed.
#[derive(Clone)]
pub struct VideoImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl VideoImage {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("invalid image size {}x{}", width, height);
        }
        let data = data.into();
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            anyhow::bail!(
                "image buffer holds {} bytes, {}x{} {:?} needs {}",
                data.len(),
                width,
                height,
                format,
                expected
            );
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

impl std::fmt::Debug for VideoImage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Presentation timestamp of frame `index` on a fixed `fps` cadence, or
/// `None` when it does not fit in a `u64` of microseconds.
pub fn frame_timestamp_micros(index: u64, fps: u32) -> Option<u64> {
    u64::try_from(index as u128 * MICROS_PER_SECOND as u128 / fps as u128).ok()
}

/// Duration of one frame on a fixed `fps` cadence.
pub fn frame_duration_micros(fps: u32) -> u64 {
    MICROS_PER_SECOND / fps as u64
}

/// Nominal length of `frame_count` frames played at `fps`.
pub fn nominal_duration_micros(frame_count: u64, fps: u32) -> u64 {
    let micros = frame_count as u128 * MICROS_PER_SECOND as u128 / fps as u128;
    u64::try_from(micros).unwrap_or(u64::MAX)
}

/// One submitted frame. Owns its pixels until the encoder wrapper drops it
/// right after the encode call.
#[derive(Debug)]
pub struct Frame {
    index: u64,
    image: VideoImage,
    timestamp_micros: u64,
    duration_micros: u64,
}

impl Frame {
    /// Timing is derived from `index` alone; real submission time is ignored.
    /// Fails when the frame would end past the last representable microsecond.
    pub fn at_cadence(index: u64, image: VideoImage, fps: u32) -> anyhow::Result<Self> {
        let duration_micros = frame_duration_micros(fps);
        let timestamp_micros = frame_timestamp_micros(index, fps)
            .filter(|ts| ts.checked_add(duration_micros).is_some())
            .ok_or_else(|| anyhow::anyhow!("frame {} at {} fps overflows the timeline", index, fps))?;
        Ok(Self {
            index,
            image,
            timestamp_micros,
            duration_micros,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &VideoImage {
        &self.image
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp_micros
    }

    pub fn duration_micros(&self) -> u64 {
        self.duration_micros
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame index: {}, width: {}, height: {}, format: {:?}, timestamp: {}us, duration: {}us",
            self.index,
            self.image.width,
            self.image.height,
            self.image.format,
            self.timestamp_micros,
            self.duration_micros
        )
    }
}
