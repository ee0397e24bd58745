use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use crate::frame::{PixelFormat, VideoImage};

/// Converts packed RGBA/BGRA images into the encoder's input format, scaling
/// to the encoder size when the container padded the dimensions.
pub struct Scaler {
    context: scaling::Context,
    source: ffmpeg_next::frame::Video,
}

impl Scaler {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        dst_format: Pixel,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<Self> {
        let src_format = match format {
            PixelFormat::Rgba => Pixel::RGBA,
            PixelFormat::Bgra => Pixel::BGRA,
        };
        let context = scaling::Context::get(
            src_format,
            width,
            height,
            dst_format,
            dst_width,
            dst_height,
            scaling::Flags::BILINEAR,
        )?;
        Ok(Self {
            context,
            source: ffmpeg_next::frame::Video::new(src_format, width, height),
        })
    }

    pub fn run(
        &mut self,
        image: &VideoImage,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        let stride = self.source.stride(0);
        let row = image.stride();
        let plane = self.source.data_mut(0);
        for (y, src_row) in image.data().chunks_exact(row).enumerate() {
            plane[y * stride..y * stride + row].copy_from_slice(src_row);
        }
        self.context.run(&self.source, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}
