//! Encoder factory and capability source backed by FFmpeg (`libvpx-vp9`,
//! `libx264`, and their hardware counterparts when present).

use async_trait::async_trait;
use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{Dictionary, Rational};

use crate::capability::{MediaCapabilities, VideoConfiguration};
use crate::chunk::{ChunkKind, ChunkMetadata, DecoderConfig, EncodedChunk, EncodedOutput};
use crate::container::VideoCodec;
use crate::encoder::{ChunkEncoder, EncoderConfig, EncoderFactory};
use crate::frame::{Frame, PixelFormat, frame_duration_micros};
use crate::hw::{find_hw_encoder, pixel_format_for_encoder};
use crate::scaler::Scaler;

/// Microsecond time base: chunk timestamps map 1:1 onto packet pts.
const TIME_BASE: Rational = Rational(1, 1_000_000);
/// Seconds between forced key frames.
const KEYFRAME_INTERVAL_SECS: u32 = 1;

fn software_codec(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::H264 => "libx264",
    }
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoderFactory;

impl FfmpegEncoderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn is_available(&self) -> bool {
        [VideoCodec::Vp9, VideoCodec::H264]
            .into_iter()
            .any(|codec| ffmpeg_next::encoder::find_by_name(software_codec(codec)).is_some())
    }

    fn create(&self, config: &EncoderConfig) -> anyhow::Result<Box<dyn ChunkEncoder>> {
        Ok(Box::new(FfmpegEncoder::new(config)?))
    }
}

pub struct FfmpegEncoder {
    inner: ffmpeg_next::codec::encoder::Video,
    codec_name: String,
    config: EncoderConfig,
    pixel_format: Pixel,
    scaler: Option<(PixelFormat, Scaler)>,
    have_sent_config: bool,
}

impl FfmpegEncoder {
    pub fn new(config: &EncoderConfig) -> anyhow::Result<Self> {
        let sw_name = software_codec(config.codec);

        // Try hardware encoder first, then fall back to software encoder.
        if let Some(hw_codec) = find_hw_encoder(sw_name, config.alpha) {
            let hw_name = hw_codec.name().to_string();
            log::info!("attempting hardware encoder: {}", hw_name);
            match Self::open(hw_codec, &hw_name, config) {
                Ok(encoder) => return Ok(encoder),
                Err(e) => log::warn!(
                    "hardware encoder {} failed: {:#}, falling back to {}",
                    hw_name,
                    e,
                    sw_name
                ),
            }
        }

        let sw_codec = ffmpeg_next::encoder::find_by_name(sw_name)
            .ok_or(anyhow::anyhow!("codec not found: {}", sw_name))?;
        Self::open(sw_codec, sw_name, config)
    }

    fn open(
        codec: ffmpeg_next::Codec,
        codec_name: &str,
        config: &EncoderConfig,
    ) -> anyhow::Result<Self> {
        let pixel_format = pixel_format_for_encoder(codec_name, config.alpha);
        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(pixel_format);
        encoder.set_frame_rate(Some(Rational(config.frame_rate as i32, 1)));
        encoder.set_time_base(TIME_BASE);
        encoder.set_bit_rate(config.bitrate_bps as usize);
        encoder.set_max_bit_rate(config.bitrate_bps as usize);
        encoder.set_gop(config.frame_rate * KEYFRAME_INTERVAL_SECS);

        let mut opts = Dictionary::new();
        match (config.codec, codec_name) {
            (VideoCodec::H264, "libx264") => {
                opts.set("preset", "ultrafast");
                opts.set("tune", "zerolatency");
                opts.set("profile", "baseline");
            }
            (VideoCodec::Vp9, "libvpx-vp9") => {
                opts.set("deadline", "realtime");
                opts.set("cpu-used", "8");
                opts.set("lag-in-frames", "0");
            }
            _ => {}
        }
        let inner = encoder.open_with(opts)?;
        log::info!(
            "encoder opened successfully: {} ({:?}, {}x{})",
            codec_name,
            pixel_format,
            config.width,
            config.height
        );

        Ok(Self {
            inner,
            codec_name: codec_name.to_string(),
            config: config.clone(),
            pixel_format,
            scaler: None,
            have_sent_config: false,
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<ffmpeg_next::codec::packet::Packet>> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match self.inner.receive_packet(&mut packet) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn drain(&mut self) -> anyhow::Result<Vec<EncodedOutput>> {
        let mut outputs = Vec::new();
        while let Some(packet) = self.receive_packet()? {
            outputs.push(self.to_output(&packet));
        }
        Ok(outputs)
    }

    fn to_output(&mut self, packet: &ffmpeg_next::codec::packet::Packet) -> EncodedOutput {
        let kind = if packet.is_key() {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        };
        let chunk = EncodedChunk::new(
            Bytes::copy_from_slice(packet.data().unwrap_or_default()),
            kind,
            packet.pts().unwrap_or(0).max(0) as u64,
            frame_duration_micros(self.config.frame_rate),
        );

        // libvpx puts the alpha plane in Matroska BlockAdditional side data,
        // prefixed by its 8-byte BlockAddID
        let alpha_side_data = packet
            .side_data()
            .find(|side| {
                side.kind() == ffmpeg_next::codec::packet::side_data::Type::MatroskaBlockAdditional
            })
            .and_then(|side| side.data().get(8..).map(Bytes::copy_from_slice));

        let decoder_config = (!self.have_sent_config).then(|| DecoderConfig {
            codec: self.config.codec_string().to_string(),
            coded_width: self.config.width,
            coded_height: self.config.height,
            description: None,
        });
        self.have_sent_config = true;

        let metadata = (decoder_config.is_some() || alpha_side_data.is_some()).then(|| {
            ChunkMetadata {
                decoder_config,
                alpha_side_data,
            }
        });
        EncodedOutput::new(chunk, metadata)
    }
}

impl ChunkEncoder for FfmpegEncoder {
    fn encode(&mut self, frame: &Frame) -> anyhow::Result<Vec<EncodedOutput>> {
        let image = frame.image();
        let rebuild = !matches!(&self.scaler, Some((format, _)) if *format == image.format());
        if rebuild {
            let scaler = Scaler::new(
                image.format(),
                image.width(),
                image.height(),
                self.pixel_format,
                self.config.width,
                self.config.height,
            )?;
            self.scaler = Some((image.format(), scaler));
        }
        let Some((_, scaler)) = self.scaler.as_mut() else {
            anyhow::bail!("scaler not initialized");
        };

        let mut converted = ffmpeg_next::frame::Video::empty();
        scaler.run(image, &mut converted)?;
        converted.set_pts(Some(frame.timestamp_micros() as i64));
        self.inner.send_frame(&converted)?;
        self.drain()
    }

    fn flush(&mut self) -> anyhow::Result<Vec<EncodedOutput>> {
        self.inner.send_eof()?;
        self.drain()
    }
}

/// Answers playability by checking that FFmpeg can decode the codec, and for
/// alpha VP9 that the libvpx decoder (which reads BlockAdditional) exists.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCapabilities;

#[async_trait]
impl MediaCapabilities for FfmpegCapabilities {
    async fn decoding_info(&self, config: &VideoConfiguration) -> anyhow::Result<bool> {
        let decoders: &[&str] = match (config.codec, config.has_alpha_channel) {
            (VideoCodec::Vp9, true) => &["libvpx-vp9"],
            (VideoCodec::Vp9, false) => &["vp9", "libvpx-vp9"],
            (VideoCodec::H264, _) => &["h264"],
        };
        let found = decoders
            .iter()
            .find(|name| ffmpeg_next::decoder::find_by_name(name).is_some());
        log::debug!(
            "decoder for {} ({}x{}): {:?}",
            config.content_type(),
            config.width,
            config.height,
            found
        );
        Ok(found.is_some())
    }
}
