use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::capability::{CapabilityProber, MediaCapabilities, VideoConfiguration};
use crate::chunk::{ChunkKind, ChunkMetadata, DecoderConfig, EncodedChunk, EncodedOutput};
use crate::container::{ContainerKind, VideoCodec};
use crate::encoder::{ChunkEncoder, EncoderConfig, EncoderFactory};
use crate::error::ExportError;
use crate::frame::{Frame, PixelFormat, VideoImage};
use crate::metadata::probe;
use crate::pipeline::{ExportOptions, ExportSettings, PipelineState, VideoExporter};

const KEY_INTERVAL: u64 = 30;

/// Produces one chunk per frame whose payload ends with `index + 1`.
struct FakeEncoder {
    config: EncoderConfig,
    produced: u64,
    fail_on: Option<u64>,
    delay: Duration,
}

impl FakeEncoder {
    fn payload(&self, index: u64, key: bool) -> Vec<u8> {
        let marker = (index + 1) as u8;
        match self.config.codec {
            VideoCodec::Vp9 => vec![0x82, 0x49, 0x83, marker],
            VideoCodec::H264 => {
                let mut data = Vec::new();
                if key {
                    data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0xab]);
                    data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]);
                    data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xff, marker]);
                } else {
                    data.extend_from_slice(&[0, 0, 0, 1, 0x41, 0xff, marker]);
                }
                data
            }
        }
    }
}

impl ChunkEncoder for FakeEncoder {
    fn encode(&mut self, frame: &Frame) -> anyhow::Result<Vec<EncodedOutput>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_on == Some(frame.index()) {
            anyhow::bail!("cannot encode frame {}", frame.index());
        }

        let key = self.produced % KEY_INTERVAL == 0;
        let kind = if key { ChunkKind::Key } else { ChunkKind::Delta };
        let chunk = EncodedChunk::new(
            self.payload(frame.index(), key),
            kind,
            frame.timestamp_micros(),
            frame.duration_micros(),
        );
        let metadata = match (self.produced, self.config.alpha) {
            (0, _) => Some(ChunkMetadata {
                decoder_config: Some(DecoderConfig {
                    codec: self.config.codec_string().to_string(),
                    coded_width: self.config.width,
                    coded_height: self.config.height,
                    description: None,
                }),
                alpha_side_data: self.config.alpha.then(|| vec![0xA1, 0xFA].into()),
            }),
            (_, true) => Some(ChunkMetadata {
                decoder_config: None,
                alpha_side_data: Some(vec![0xA1, 0xFA].into()),
            }),
            (_, false) => None,
        };
        self.produced += 1;
        Ok(vec![EncodedOutput::new(chunk, metadata)])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<EncodedOutput>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeFactory {
    unavailable: bool,
    fail_create: bool,
    fail_on: Option<u64>,
    delay: Duration,
    configs: Mutex<Vec<EncoderConfig>>,
}

impl FakeFactory {
    fn configs(&self) -> Vec<EncoderConfig> {
        self.configs.lock().unwrap().clone()
    }
}

impl EncoderFactory for FakeFactory {
    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn create(&self, config: &EncoderConfig) -> anyhow::Result<Box<dyn ChunkEncoder>> {
        self.configs.lock().unwrap().push(config.clone());
        if self.fail_create {
            anyhow::bail!("codec {} rejected", config.codec_string());
        }
        Ok(Box::new(FakeEncoder {
            config: config.clone(),
            produced: 0,
            fail_on: self.fail_on,
            delay: self.delay,
        }))
    }
}

struct Fixed(bool);

#[async_trait]
impl MediaCapabilities for Fixed {
    async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

struct Broken;

#[async_trait]
impl MediaCapabilities for Broken {
    async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
        anyhow::bail!("decoding info unavailable")
    }
}

struct Panicking;

#[async_trait]
impl MediaCapabilities for Panicking {
    async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
        panic!("capability source crashed")
    }
}

/// Holds the probe open until released.
struct Gated {
    release: Arc<Notify>,
    answer: bool,
}

#[async_trait]
impl MediaCapabilities for Gated {
    async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
        self.release.notified().await;
        Ok(self.answer)
    }
}

fn webm_prober() -> CapabilityProber {
    CapabilityProber::new().with_capabilities(Arc::new(Fixed(true)))
}

fn image(settings: &ExportSettings) -> VideoImage {
    let len = (settings.width * settings.height * 4) as usize;
    VideoImage::new(settings.width, settings.height, PixelFormat::Rgba, vec![0x7f; len]).unwrap()
}

fn exporter(
    settings: ExportSettings,
    prober: CapabilityProber,
    factory: &Arc<FakeFactory>,
) -> VideoExporter {
    VideoExporter::new(settings, prober, factory.clone()).unwrap()
}

async fn wait_for_state(exporter: &VideoExporter, state: PipelineState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while exporter.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {:?}, stuck in {:?}", state, exporter.state()));
}

/// Frame indices recovered from the payload markers, in file order.
fn muxed_indices(data: &[u8]) -> anyhow::Result<Vec<u64>> {
    let info = probe(data)?;
    Ok(info
        .packets
        .iter()
        .map(|p| p.data[p.data.len() - 1] as u64 - 1)
        .collect())
}

#[tokio::test]
async fn test_buffered_frames_precede_live_frames() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);

    for index in 0..5 {
        exporter.add_frame(index, image(&settings))?;
    }
    assert_eq!(exporter.state(), PipelineState::Buffering);

    exporter.init().await?;
    assert_eq!(exporter.state(), PipelineState::Encoding);
    for index in 5..10 {
        exporter.add_frame(index, image(&settings))?;
    }

    let blob = exporter.finalize().await?;
    assert_eq!(blob.frame_count, 10);
    assert_eq!(blob.chunk_count, 10);
    assert_eq!(muxed_indices(&blob.data)?, (0..10).collect::<Vec<_>>());

    // millisecond timestamps in WebM
    let info = probe(&blob.data)?;
    for (index, packet) in info.packets.iter().enumerate() {
        let expected = index as u64 * 1_000_000 / 30 / 1000 * 1000;
        assert_eq!(packet.timestamp_micros, expected);
    }
    Ok(())
}

#[tokio::test]
async fn test_frames_during_probe_stay_queued() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let release = Arc::new(Notify::new());
    let prober = CapabilityProber::new().with_capabilities(Arc::new(Gated {
        release: release.clone(),
        answer: true,
    }));
    let factory = Arc::new(FakeFactory::default());
    let exporter = Arc::new(exporter(settings, prober, &factory));

    exporter.add_frame(0, image(&settings))?;
    let init = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.init().await }
    });
    wait_for_state(&exporter, PipelineState::Probing).await;

    for index in 1..4 {
        exporter.add_frame(index, image(&settings))?;
    }
    assert_eq!(exporter.state(), PipelineState::Probing);
    assert!(exporter.container().is_none());
    // finalize cannot overtake init
    assert!(exporter.finalize().await.unwrap_err().is_misuse());

    release.notify_one();
    init.await??;
    for index in 4..8 {
        exporter.add_frame(index, image(&settings))?;
    }

    let blob = exporter.finalize().await?;
    assert_eq!(muxed_indices(&blob.data)?, (0..8).collect::<Vec<_>>());
    assert_eq!(factory.configs().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_fallback_to_mp4_with_even_dimensions() -> anyhow::Result<()> {
    let settings = ExportSettings::new(641, 481, 30);
    let factory = Arc::new(FakeFactory::default());
    let prober = CapabilityProber::new().with_capabilities(Arc::new(Fixed(false)));
    let exporter = exporter(settings, prober, &factory);

    exporter.init().await?;
    for index in 0..30 {
        exporter.add_frame(index, image(&settings))?;
    }
    let blob = exporter.finalize().await?;

    assert_eq!(blob.mime_type, "video/mp4");
    assert_eq!(blob.container, ContainerKind::Mp4);
    assert_eq!((blob.width, blob.height), (642, 482));
    assert_eq!(blob.chunk_count, 30);
    assert_eq!(blob.nominal_duration_micros, 1_000_000);
    assert_eq!(blob.encode_errors, 0);

    let configs = factory.configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].codec, VideoCodec::H264);
    assert_eq!((configs[0].width, configs[0].height), (642, 482));
    assert!(!configs[0].alpha);

    let info = probe(&blob.data)?;
    assert_eq!(info.format.fast_start, Some(true));
    assert_eq!(info.streams[0].codec_name, "avc1");
    assert_eq!(info.streams[0].width, Some(642));
    assert_eq!(info.streams[0].height, Some(482));
    assert_eq!(info.streams[0].frame_count, 30);
    assert_eq!(muxed_indices(&blob.data)?, (0..30).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn test_webm_keeps_odd_dimensions_and_alpha() -> anyhow::Result<()> {
    let settings = ExportSettings::new(641, 481, 30).with_bitrate(50_000_000);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);

    exporter.init().await?;
    for index in 0..45 {
        exporter.add_frame(index, image(&settings))?;
    }
    let blob = exporter.finalize().await?;
    assert_eq!(blob.mime_type, "video/webm");
    assert_eq!(blob.extension(), "webm");
    assert_eq!((blob.width, blob.height), (641, 481));

    let config = &factory.configs()[0];
    assert_eq!(config.codec, VideoCodec::Vp9);
    assert_eq!(config.bitrate_bps, EncoderConfig::MAX_BITRATE);
    assert!(config.alpha);

    let info = probe(&blob.data)?;
    let stream = &info.streams[0];
    assert_eq!(stream.codec_name, "V_VP9");
    assert_eq!((stream.width, stream.height), (Some(641), Some(481)));
    assert_eq!(stream.has_alpha, Some(true));
    assert!(info.packets.iter().all(|p| p.side_data.is_some()));
    Ok(())
}

#[tokio::test]
async fn test_inconclusive_probe_falls_back() -> anyhow::Result<()> {
    let settings = ExportSettings::new(33, 17, 30);
    let sources: Vec<Arc<dyn MediaCapabilities>> = vec![Arc::new(Broken), Arc::new(Panicking)];
    for source in sources {
        let factory = Arc::new(FakeFactory::default());
        let prober = CapabilityProber::new().with_capabilities(source);
        let exporter = exporter(settings, prober, &factory);
        exporter.init().await?;
        exporter.add_frame(0, image(&settings))?;
        let blob = exporter.finalize().await?;
        assert_eq!(blob.container, ContainerKind::Mp4);
        assert_eq!((blob.width, blob.height), (34, 18));
    }
    Ok(())
}

#[tokio::test]
async fn test_second_finalize_fails_without_side_effects() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.init().await?;
    exporter.add_frame(0, image(&settings))?;

    let blob = exporter.finalize().await?;
    let err = exporter.finalize().await.unwrap_err();
    assert!(matches!(
        err,
        ExportError::Misuse {
            operation: "finalize",
            state: PipelineState::Finalized
        }
    ));
    assert_eq!(exporter.state(), PipelineState::Finalized);
    assert_eq!(probe(&blob.data)?.streams[0].frame_count, 1);

    // close after finalize does nothing
    exporter.close();
    assert_eq!(exporter.state(), PipelineState::Finalized);
    Ok(())
}

#[tokio::test]
async fn test_frames_rejected_after_finalize() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.init().await?;
    exporter.add_frame(0, image(&settings))?;
    exporter.finalize().await?;

    let err = exporter.add_frame(1, image(&settings)).unwrap_err();
    assert!(err.is_misuse());
    Ok(())
}

#[tokio::test]
async fn test_init_twice_is_misuse() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.init().await?;
    assert!(exporter.init().await.unwrap_err().is_misuse());
    assert_eq!(factory.configs().len(), 1);
    assert_eq!(exporter.state(), PipelineState::Encoding);
    Ok(())
}

#[tokio::test]
async fn test_finalize_before_init_is_misuse() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    assert!(exporter.finalize().await.unwrap_err().is_misuse());
    exporter.add_frame(0, image(&settings))?;
    assert!(exporter.finalize().await.unwrap_err().is_misuse());
    assert_eq!(exporter.state(), PipelineState::Buffering);
    Ok(())
}

#[tokio::test]
async fn test_close_during_finalize() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let exporter = Arc::new(exporter(settings, webm_prober(), &factory));
    exporter.init().await?;
    for index in 0..20 {
        exporter.add_frame(index, image(&settings))?;
    }

    let finalize = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.finalize().await }
    });
    wait_for_state(&exporter, PipelineState::Finalizing).await;
    exporter.close();

    let result = finalize.await?;
    assert!(matches!(result, Err(ExportError::Closed)));
    assert_eq!(exporter.state(), PipelineState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_close_during_probe() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let release = Arc::new(Notify::new());
    let prober = CapabilityProber::new().with_capabilities(Arc::new(Gated {
        release: release.clone(),
        answer: true,
    }));
    let factory = Arc::new(FakeFactory::default());
    let exporter = Arc::new(exporter(settings, prober, &factory));

    let init = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.init().await }
    });
    wait_for_state(&exporter, PipelineState::Probing).await;
    exporter.close();
    release.notify_one();

    assert!(matches!(init.await?, Err(ExportError::Closed)));
    assert_eq!(exporter.state(), PipelineState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.add_frame(0, image(&settings))?;

    exporter.close();
    exporter.close();
    assert_eq!(exporter.state(), PipelineState::Closed);
    assert!(exporter.add_frame(1, image(&settings)).unwrap_err().is_misuse());
    assert!(exporter.init().await.unwrap_err().is_misuse());
    assert!(exporter.finalize().await.unwrap_err().is_misuse());
    Ok(())
}

#[tokio::test]
async fn test_configure_failure_moves_to_failed() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory {
        fail_create: true,
        ..Default::default()
    });
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.add_frame(0, image(&settings))?;

    assert!(matches!(
        exporter.init().await,
        Err(ExportError::Configure(_))
    ));
    assert_eq!(exporter.state(), PipelineState::Failed);
    assert!(exporter.add_frame(1, image(&settings)).unwrap_err().is_misuse());
    exporter.close();
    assert_eq!(exporter.state(), PipelineState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_encode_errors_reach_callback() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory {
        fail_on: Some(3),
        ..Default::default()
    });
    let reported = Arc::new(AtomicU64::new(0));
    let options = ExportOptions::default().with_error_callback({
        let reported = reported.clone();
        move |_| {
            reported.fetch_add(1, Ordering::SeqCst);
        }
    });
    let exporter =
        VideoExporter::with_options(settings, webm_prober(), factory.clone(), options)?;

    exporter.init().await?;
    for index in 0..6 {
        exporter.add_frame(index, image(&settings))?;
    }
    let blob = exporter.finalize().await?;
    assert_eq!(blob.frame_count, 6);
    assert_eq!(blob.chunk_count, 5);
    assert_eq!(blob.encode_errors, 1);
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    assert_eq!(muxed_indices(&blob.data)?, vec![0, 1, 2, 4, 5]);
    Ok(())
}

#[tokio::test]
async fn test_add_frames_from_stream() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);
    exporter.init().await?;

    let frames = futures::stream::iter((0..12).map(|index| (index, image(&settings))));
    assert_eq!(exporter.add_frames(frames).await?, 12);
    let blob = exporter.finalize().await?;
    assert_eq!(blob.nominal_duration_micros, 400_000);
    Ok(())
}

#[test]
fn test_environment_and_settings_checks() {
    let unavailable = FakeFactory {
        unavailable: true,
        ..Default::default()
    };
    assert!(!VideoExporter::is_supported(&unavailable));
    assert!(VideoExporter::is_supported(&FakeFactory::default()));

    let result = VideoExporter::new(
        ExportSettings::new(16, 8, 30),
        CapabilityProber::new(),
        Arc::new(unavailable),
    );
    assert!(matches!(result, Err(ExportError::UnsupportedEnvironment)));

    let factory: Arc<dyn EncoderFactory> = Arc::new(FakeFactory::default());
    for settings in [
        ExportSettings::new(0, 8, 30),
        ExportSettings::new(16, 0, 30),
        ExportSettings::new(16, 8, 0),
        ExportSettings::new(70_000, 8, 30),
        ExportSettings::new(16, u32::MAX, 30),
        ExportSettings::new(ExportSettings::MAX_DIMENSION + 1, 8, 30),
    ] {
        let result = VideoExporter::new(settings, CapabilityProber::new(), factory.clone());
        assert!(matches!(result, Err(ExportError::InvalidSettings(_))));
    }

    let largest = ExportSettings::new(ExportSettings::MAX_DIMENSION, 8, 30);
    assert!(VideoExporter::new(largest, CapabilityProber::new(), factory.clone()).is_ok());

    let exporter =
        VideoExporter::new(ExportSettings::new(16, 8, 30), CapabilityProber::new(), factory)
            .unwrap();
    let wrong = VideoImage::new(8, 8, PixelFormat::Rgba, vec![0; 256]).unwrap();
    assert!(matches!(
        exporter.add_frame(0, wrong),
        Err(ExportError::InvalidSettings(_))
    ));
    assert_eq!(exporter.state(), PipelineState::Uninitialized);
}

#[tokio::test]
async fn test_index_past_the_timeline_is_rejected() -> anyhow::Result<()> {
    let settings = ExportSettings::new(16, 8, 30);
    let factory = Arc::new(FakeFactory::default());
    let exporter = exporter(settings, webm_prober(), &factory);

    let result = exporter.add_frame(u64::MAX / 1000, image(&settings));
    assert!(matches!(result, Err(ExportError::InvalidSettings(_))));
    assert_eq!(exporter.state(), PipelineState::Uninitialized);

    exporter.add_frame(0, image(&settings))?;
    exporter.init().await?;
    let result = exporter.add_frame(u64::MAX, image(&settings));
    assert!(matches!(result, Err(ExportError::InvalidSettings(_))));
    assert_eq!(exporter.state(), PipelineState::Encoding);

    let blob = exporter.finalize().await?;
    assert_eq!(blob.frame_count, 1);
    Ok(())
}
