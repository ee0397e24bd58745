use crate::capability::{CapabilityProber, VideoConfiguration};
use crate::muxer::{Muxer, MuxerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp9,
    H264,
}

impl VideoCodec {
    /// Codec string used for capability queries and encoder configuration.
    pub fn codec_string(&self) -> &'static str {
        match self {
            VideoCodec::Vp9 => "vp09.00.10.08",
            VideoCodec::H264 => "avc1.42001f",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Primary choice: VP9 in WebM, alpha capable, any dimensions.
    WebM,
    /// Fallback: H.264 in MP4, no alpha, even dimensions only.
    Mp4,
}

impl ContainerKind {
    pub fn codec(&self) -> VideoCodec {
        match self {
            ContainerKind::WebM => VideoCodec::Vp9,
            ContainerKind::Mp4 => VideoCodec::H264,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerKind::WebM => "video/webm",
            ContainerKind::Mp4 => "video/mp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::WebM => "webm",
            ContainerKind::Mp4 => "mp4",
        }
    }

    pub fn supports_alpha(&self) -> bool {
        matches!(self, ContainerKind::WebM)
    }

    /// Dimensions the encoder must use for this container.
    pub fn fit_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        match self {
            ContainerKind::WebM => (width, height),
            // H.264 4:2:0 needs even sizes
            ContainerKind::Mp4 => (
                width.saturating_add(width % 2),
                height.saturating_add(height % 2),
            ),
        }
    }
}

/// What the caller wants to export, before any container is chosen.
#[derive(Debug, Clone, Copy)]
pub struct SourceFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub alpha: bool,
}

/// The container locked in for one pipeline, with its muxer.
pub struct SelectedContainer {
    pub kind: ContainerKind,
    pub width: u32,
    pub height: u32,
    pub muxer: Muxer,
}

pub struct ContainerSelector<'a> {
    prober: &'a CapabilityProber,
}

impl<'a> ContainerSelector<'a> {
    pub fn new(prober: &'a CapabilityProber) -> Self {
        Self { prober }
    }

    /// Probes WebM/VP9 with the source's exact configuration; anything but a
    /// clear yes selects MP4/H.264, which is not probed itself.
    pub async fn select(&self, source: &SourceFormat) -> SelectedContainer {
        let primary = VideoConfiguration {
            container: ContainerKind::WebM,
            codec: VideoCodec::Vp9,
            width: source.width,
            height: source.height,
            bitrate: source.bitrate,
            framerate: source.frame_rate,
            has_alpha_channel: source.alpha,
        };

        let kind = if self.prober.is_playable(&primary).await {
            ContainerKind::WebM
        } else {
            log::info!(
                "{} not playable or undetermined, falling back to {}",
                primary.content_type(),
                ContainerKind::Mp4.mime_type()
            );
            ContainerKind::Mp4
        };

        Self::build(kind, source)
    }

    pub fn build(kind: ContainerKind, source: &SourceFormat) -> SelectedContainer {
        let (width, height) = kind.fit_dimensions(source.width, source.height);
        let muxer = Muxer::new(
            kind,
            MuxerConfig {
                width,
                height,
                frame_rate: source.frame_rate,
                alpha: source.alpha && kind.supports_alpha(),
            },
        );
        log::info!(
            "selected container {} ({}) at {}x{}",
            kind.mime_type(),
            kind.codec().codec_string(),
            width,
            height
        );
        SelectedContainer {
            kind,
            width,
            height,
            muxer,
        }
    }
}
