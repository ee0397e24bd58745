//! Runtime playability checks.
//!
//! A [`CapabilityProber`] answers "would this file play here?" for one exact
//! container/codec/size/rate/alpha combination. It asks a [`MediaCapabilities`]
//! source when one is installed, otherwise the first available
//! [`SourceTypeRegistry`] by MIME type, otherwise it says no.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::container::{ContainerKind, VideoCodec};

/// The exact configuration being asked about.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfiguration {
    pub container: ContainerKind,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub framerate: u32,
    pub has_alpha_channel: bool,
}

impl VideoConfiguration {
    /// e.g. `video/webm; codecs="vp09.00.10.08"`
    pub fn content_type(&self) -> String {
        format!(
            "{}; codecs=\"{}\"",
            self.container.mime_type(),
            self.codec.codec_string()
        )
    }
}

/// Full decoding-capability query with the exact configuration.
#[async_trait]
pub trait MediaCapabilities: Send + Sync {
    async fn decoding_info(&self, config: &VideoConfiguration) -> anyhow::Result<bool>;
}

/// Coarse MIME-type registry, consulted when no [`MediaCapabilities`] exists.
pub trait SourceTypeRegistry: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this registry exists in the running environment at all.
    fn is_available(&self) -> bool {
        true
    }

    fn is_type_supported(&self, mime_type: &str) -> bool;
}

/// Registry backed by a fixed set of MIME types.
#[derive(Debug, Clone, Default)]
pub struct StaticTypeRegistry {
    name: String,
    types: HashSet<String>,
}

impl StaticTypeRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: HashSet::new(),
        }
    }

    pub fn with_type(mut self, mime_type: &str) -> Self {
        self.types.insert(mime_type.to_string());
        self
    }
}

impl SourceTypeRegistry for StaticTypeRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.types.contains(mime_type)
    }
}

#[derive(Clone, Default)]
pub struct CapabilityProber {
    capabilities: Option<Arc<dyn MediaCapabilities>>,
    registries: Vec<Arc<dyn SourceTypeRegistry>>,
}

impl CapabilityProber {
    /// A prober with no sources: every verdict is `false`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn MediaCapabilities>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Appends a fallback registry. Earlier registries take priority.
    pub fn with_source_registry(mut self, registry: Arc<dyn SourceTypeRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    /// Never fails: errors and panics inside a capability source read as `false`.
    pub async fn is_playable(&self, config: &VideoConfiguration) -> bool {
        if let Some(capabilities) = &self.capabilities {
            let query = AssertUnwindSafe(capabilities.decoding_info(config)).catch_unwind();
            return match query.await {
                Ok(Ok(supported)) => {
                    log::debug!("decoding info for {}: {}", config.content_type(), supported);
                    supported
                }
                Ok(Err(e)) => {
                    log::debug!(
                        "decoding info for {} inconclusive: {:#}",
                        config.content_type(),
                        e
                    );
                    false
                }
                Err(_) => {
                    log::debug!("decoding info for {} panicked", config.content_type());
                    false
                }
            };
        }

        let Some(registry) = self.registries.iter().find(|r| r.is_available()) else {
            log::warn!("no media capability source available, assuming unsupported");
            return false;
        };

        let mime_type = config.content_type();
        let supported =
            std::panic::catch_unwind(AssertUnwindSafe(|| registry.is_type_supported(&mime_type)))
                .unwrap_or(false);
        log::debug!(
            "source registry {} reports {} supported: {}",
            registry.name(),
            mime_type,
            supported
        );
        supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(anyhow::Result<bool>);

    #[async_trait]
    impl MediaCapabilities for Fixed {
        async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
            match &self.0 {
                Ok(v) => Ok(*v),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl MediaCapabilities for Panicking {
        async fn decoding_info(&self, _config: &VideoConfiguration) -> anyhow::Result<bool> {
            panic!("capability backend exploded")
        }
    }

    struct Missing;

    impl SourceTypeRegistry for Missing {
        fn name(&self) -> &str {
            "managed"
        }

        fn is_available(&self) -> bool {
            false
        }

        fn is_type_supported(&self, _mime_type: &str) -> bool {
            true
        }
    }

    fn webm_config() -> VideoConfiguration {
        VideoConfiguration {
            container: ContainerKind::WebM,
            codec: VideoCodec::Vp9,
            width: 641,
            height: 481,
            bitrate: 10_000_000,
            framerate: 30,
            has_alpha_channel: true,
        }
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            webm_config().content_type(),
            "video/webm; codecs=\"vp09.00.10.08\""
        );
    }

    #[tokio::test]
    async fn test_no_source_is_unsupported() {
        assert!(!CapabilityProber::new().is_playable(&webm_config()).await);
    }

    #[tokio::test]
    async fn test_capabilities_verdict_wins() {
        let registry = StaticTypeRegistry::new("standard").with_type(&webm_config().content_type());
        let prober = CapabilityProber::new()
            .with_capabilities(Arc::new(Fixed(Ok(false))))
            .with_source_registry(Arc::new(registry));
        assert!(!prober.is_playable(&webm_config()).await);

        let prober = CapabilityProber::new().with_capabilities(Arc::new(Fixed(Ok(true))));
        assert!(prober.is_playable(&webm_config()).await);
    }

    #[tokio::test]
    async fn test_failing_capabilities_degrade_to_false() {
        let prober = CapabilityProber::new()
            .with_capabilities(Arc::new(Fixed(Err(anyhow::anyhow!("query rejected")))));
        assert!(!prober.is_playable(&webm_config()).await);

        let prober = CapabilityProber::new().with_capabilities(Arc::new(Panicking));
        assert!(!prober.is_playable(&webm_config()).await);
    }

    #[tokio::test]
    async fn test_first_available_registry_answers() {
        let standard = StaticTypeRegistry::new("standard").with_type(&webm_config().content_type());
        let legacy = StaticTypeRegistry::new("legacy");
        let prober = CapabilityProber::new()
            .with_source_registry(Arc::new(Missing))
            .with_source_registry(Arc::new(standard))
            .with_source_registry(Arc::new(legacy));
        assert!(prober.is_playable(&webm_config()).await);

        let mut mp4 = webm_config();
        mp4.container = ContainerKind::Mp4;
        mp4.codec = VideoCodec::H264;
        assert!(!prober.is_playable(&mp4).await);
    }
}
