use std::sync::Arc;

use frame_export::capability::CapabilityProber;
use frame_export::ffmpeg_backend::{FfmpegCapabilities, FfmpegEncoderFactory};
use frame_export::{ExportSettings, PixelFormat, VideoExporter, VideoImage};

mod config;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_next", log::LevelFilter::Warn)
        .filter_module("frame_export", log::LevelFilter::Debug)
        .init();
}

/// A translucent square sweeping across a transparent background.
fn render(index: u64, width: u32, height: u32, frames: u64) -> anyhow::Result<VideoImage> {
    let mut data = vec![0u8; width as usize * height as usize * 4];
    let side = (width.min(height) / 4).max(1);
    let travel = width.saturating_sub(side) as u64;
    let left = (travel * index / frames.max(1)) as u32;
    let top = (height - side) / 2;
    for y in top..top + side {
        for x in left..left + side {
            let at = (y as usize * width as usize + x as usize) * 4;
            data[at..at + 4].copy_from_slice(&[0x20, 0x80, 0xe0, 0xc0]);
        }
    }
    VideoImage::new(width, height, PixelFormat::Rgba, data)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    frame_export::init()?;
    let config = config::config();

    let factory = Arc::new(FfmpegEncoderFactory::new());
    if !VideoExporter::is_supported(factory.as_ref()) {
        anyhow::bail!("no VP9 or H.264 encoder in this FFmpeg build");
    }
    let prober = CapabilityProber::new().with_capabilities(Arc::new(FfmpegCapabilities));
    let settings = ExportSettings::new(config.width(), config.height(), config.fps());
    let exporter = Arc::new(VideoExporter::new(settings, prober, factory)?);

    // the render loop starts before the encoder is ready
    let init = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.init().await }
    });
    for index in 0..config.frames() {
        let image = render(index, config.width(), config.height(), config.frames())?;
        exporter.add_frame(index, image)?;
        tokio::task::yield_now().await;
    }
    init.await??;

    let blob = exporter.finalize().await?;
    let path = format!("{}.{}", config.output(), blob.extension());
    tokio::fs::write(&path, &blob.data).await?;
    log::info!(
        "wrote {} ({}, {}x{}, {} frames, {} errors)",
        path,
        blob.mime_type,
        blob.width,
        blob.height,
        blob.frame_count,
        blob.encode_errors
    );
    println!("{}", frame_export::probe(&blob.data)?);

    Ok(())
}
