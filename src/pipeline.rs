//! The export controller: owns the lifecycle from the first submitted frame to
//! the finished file.
//!
//! ```text
//! Uninitialized ─add_frame─▶ Buffering ─init─▶ Probing ──▶ Encoding ─finalize─▶ Finalizing ──▶ Finalized
//!        └──────────────init──────────────────────┘            │                    │
//!                                                  configure error ▶ Failed   mux error ▶ Failed
//! close() from any state but Finalized ▶ Closed
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityProber;
use crate::container::{ContainerKind, ContainerSelector, SourceFormat};
use crate::encoder::{
    EncodeErrorCallback, EncoderConfig, EncoderFactory, EncoderStats, FrameEncoder,
    log_encode_error,
};
use crate::error::{ExportError, Result};
use crate::frame::{Frame, VideoImage, nominal_duration_micros};
use crate::frame_buffer::FrameBuffer;
use crate::output::{MuxResult, OutputTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    /// Frames arrived before `init` was called.
    Buffering,
    /// Capability probe and encoder bring-up in progress.
    Probing,
    Encoding,
    Finalizing,
    Finalized,
    Closed,
    Failed,
}

/// What the caller wants exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub alpha: bool,
}

impl ExportSettings {
    pub const DEFAULT_BITRATE: u32 = EncoderConfig::MAX_BITRATE;
    /// Largest width or height accepted. MP4 pads odd sizes to even and
    /// stores them in 16 bits.
    pub const MAX_DIMENSION: u32 = 65_534;

    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
            bitrate: Self::DEFAULT_BITRATE,
            alpha: true,
        }
    }

    /// Values above 10 Mbps are clamped when the encoder is configured.
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_alpha(mut self, alpha: bool) -> Self {
        self.alpha = alpha;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ExportError::InvalidSettings(format!(
                "dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > Self::MAX_DIMENSION || self.height > Self::MAX_DIMENSION {
            return Err(ExportError::InvalidSettings(format!(
                "dimensions must be at most {}, got {}x{}",
                Self::MAX_DIMENSION,
                self.width,
                self.height
            )));
        }
        if self.frame_rate == 0 {
            return Err(ExportError::InvalidSettings(
                "frame rate must be non-zero".to_string(),
            ));
        }
        if self.bitrate == 0 {
            return Err(ExportError::InvalidSettings(
                "bitrate must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ExportOptions {
    /// Called on the encoder worker for every failed frame. Defaults to
    /// logging the error.
    pub on_encode_error: Option<EncodeErrorCallback>,
}

impl ExportOptions {
    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_encode_error = Some(Arc::new(callback));
        self
    }
}

/// The finished file.
#[derive(Debug, Clone)]
pub struct VideoBlob {
    pub data: Bytes,
    /// `video/webm` or `video/mp4`.
    pub mime_type: &'static str,
    pub container: ContainerKind,
    pub width: u32,
    pub height: u32,
    /// Frames accepted by `add_frame`.
    pub frame_count: u64,
    /// Chunks written into the container.
    pub chunk_count: u64,
    pub encode_errors: u64,
    pub nominal_duration_micros: u64,
}

impl VideoBlob {
    pub fn extension(&self) -> &'static str {
        self.container.extension()
    }
}

/// The container chosen during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub kind: ContainerKind,
    pub width: u32,
    pub height: u32,
}

struct Inner {
    state: PipelineState,
    buffer: FrameBuffer,
    encoder: Option<FrameEncoder>,
    stats: Option<Arc<EncoderStats>>,
    mux_result: Option<MuxResult>,
    container: Option<ContainerInfo>,
    frame_count: u64,
}

/// Turns an ordered stream of rendered frames into one playable video file.
///
/// Frames may be submitted before, during and after `init`; they reach the
/// encoder in submission order regardless. Every method takes `&self`, so the
/// exporter can be shared behind an `Arc` between the render loop and the task
/// that drives `init`/`finalize`.
pub struct VideoExporter {
    settings: ExportSettings,
    on_encode_error: EncodeErrorCallback,
    prober: CapabilityProber,
    factory: Arc<dyn EncoderFactory>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl VideoExporter {
    /// Whether this environment can encode video at all.
    pub fn is_supported(factory: &dyn EncoderFactory) -> bool {
        factory.is_available()
    }

    pub fn new(
        settings: ExportSettings,
        prober: CapabilityProber,
        factory: Arc<dyn EncoderFactory>,
    ) -> Result<Self> {
        Self::with_options(settings, prober, factory, ExportOptions::default())
    }

    pub fn with_options(
        settings: ExportSettings,
        prober: CapabilityProber,
        factory: Arc<dyn EncoderFactory>,
        options: ExportOptions,
    ) -> Result<Self> {
        if !Self::is_supported(factory.as_ref()) {
            return Err(ExportError::UnsupportedEnvironment);
        }
        settings.validate()?;

        Ok(Self {
            settings,
            on_encode_error: options.on_encode_error.unwrap_or_else(log_encode_error),
            prober,
            factory,
            cancel: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: PipelineState::Uninitialized,
                buffer: FrameBuffer::new(),
                encoder: None,
                stats: None,
                mux_result: None,
                container: None,
                frame_count: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    /// `None` until `init` has chosen a container.
    pub fn container(&self) -> Option<ContainerInfo> {
        self.lock().container
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Chooses the container, configures the encoder and starts draining
    /// buffered frames. Frames keep being accepted while this runs.
    pub async fn init(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                PipelineState::Uninitialized | PipelineState::Buffering => {
                    inner.state = PipelineState::Probing;
                }
                state => return Err(ExportError::misuse("init", state)),
            }
        }

        let source = SourceFormat {
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.settings.frame_rate,
            bitrate: self.settings.bitrate,
            alpha: self.settings.alpha,
        };
        let selected = ContainerSelector::new(&self.prober).select(&source).await;
        let config = EncoderConfig::new(
            selected.kind.codec(),
            selected.width,
            selected.height,
            self.settings.bitrate,
            self.settings.frame_rate,
            self.settings.alpha && selected.kind.supports_alpha(),
        );
        let backend = self.factory.create(&config);

        let mut inner = self.lock();
        if inner.state != PipelineState::Probing {
            log::info!("pipeline closed while probing, discarding encoder");
            return Err(ExportError::Closed);
        }
        let backend = match backend {
            Ok(backend) => backend,
            Err(e) => {
                let dropped = inner.buffer.clear();
                inner.state = PipelineState::Failed;
                log::error!(
                    "failed to configure {} encoder, dropped {} buffered frames: {:#}",
                    config.codec_string(),
                    dropped,
                    e
                );
                return Err(ExportError::Configure(e));
            }
        };

        let (chunk_tx, chunk_rx) = tokio::sync::mpsc::unbounded_channel();
        let mux_result = OutputTask::new(selected.muxer).start(chunk_rx, self.cancel.clone());
        let encoder = FrameEncoder::start(
            backend,
            chunk_tx,
            self.on_encode_error.clone(),
            self.cancel.clone(),
        );

        let buffered = inner.buffer.len();
        for frame in inner.buffer.drain_all() {
            if let Err(e) = encoder.encode(frame) {
                log::warn!("dropping buffered frame: {:#}", e);
            }
        }

        inner.stats = Some(encoder.stats());
        inner.encoder = Some(encoder);
        inner.mux_result = Some(mux_result);
        inner.container = Some(ContainerInfo {
            kind: selected.kind,
            width: selected.width,
            height: selected.height,
        });
        inner.state = PipelineState::Encoding;
        log::info!(
            "encoding {} {}x{} @ {} fps, {} buffered frames drained",
            config.codec_string(),
            config.width,
            config.height,
            config.frame_rate,
            buffered
        );
        Ok(())
    }

    /// Submits the frame with the given index. Never waits for `init`: before
    /// the encoder is ready the frame is queued.
    pub fn add_frame(&self, index: u64, image: VideoImage) -> Result<()> {
        if image.width() != self.settings.width || image.height() != self.settings.height {
            return Err(ExportError::InvalidSettings(format!(
                "frame {} is {}x{}, expected {}x{}",
                index,
                image.width(),
                image.height(),
                self.settings.width,
                self.settings.height
            )));
        }

        let mut inner = self.lock();
        match inner.state {
            PipelineState::Uninitialized
            | PipelineState::Buffering
            | PipelineState::Probing
            | PipelineState::Encoding => {}
            state => return Err(ExportError::misuse("add_frame", state)),
        }
        let frame = Frame::at_cadence(index, image, self.settings.frame_rate)
            .map_err(|e| ExportError::InvalidSettings(format!("{:#}", e)))?;

        match inner.state {
            PipelineState::Encoding => {
                let Some(encoder) = inner.encoder.as_ref() else {
                    return Err(ExportError::Closed);
                };
                encoder.encode(frame).map_err(|_| ExportError::Closed)?;
            }
            PipelineState::Uninitialized => {
                inner.buffer.push(frame);
                inner.state = PipelineState::Buffering;
            }
            _ => inner.buffer.push(frame),
        }
        inner.frame_count += 1;
        Ok(())
    }

    /// Feeds every `(index, image)` pair of `frames` through [`Self::add_frame`],
    /// stopping at the first rejected frame. Returns how many were accepted.
    pub async fn add_frames<S>(&self, frames: S) -> Result<u64>
    where
        S: Stream<Item = (u64, VideoImage)>,
    {
        let mut frames = std::pin::pin!(frames);
        let mut accepted = 0;
        while let Some((index, image)) = frames.next().await {
            self.add_frame(index, image)?;
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Waits for every submitted frame to be encoded, seals the container and
    /// returns the file. Succeeds at most once.
    pub async fn finalize(&self) -> Result<VideoBlob> {
        let (encoder, mux_result, stats, container, frame_count) = {
            let mut inner = self.lock();
            if inner.state != PipelineState::Encoding {
                return Err(ExportError::misuse("finalize", inner.state));
            }
            let (Some(encoder), Some(mux_result), Some(stats), Some(container)) = (
                inner.encoder.take(),
                inner.mux_result.take(),
                inner.stats.clone(),
                inner.container,
            ) else {
                return Err(ExportError::misuse("finalize", inner.state));
            };
            inner.state = PipelineState::Finalizing;
            (encoder, mux_result, stats, container, inner.frame_count)
        };

        log::info!("finalizing after {} frames", frame_count);
        let flushed = encoder.finish();
        let outcome = mux_result.await;

        let mut inner = self.lock();
        if inner.state != PipelineState::Finalizing {
            return Err(ExportError::Closed);
        }
        let output = match (flushed, outcome) {
            (Ok(()), Ok(Ok(output))) => output,
            (_, Ok(Err(e))) => {
                inner.state = PipelineState::Failed;
                return Err(ExportError::Mux(e));
            }
            (Err(e), _) => {
                inner.state = PipelineState::Failed;
                return Err(ExportError::Mux(e));
            }
            (Ok(()), Err(_)) => {
                inner.state = PipelineState::Failed;
                return Err(ExportError::Mux(anyhow::anyhow!(
                    "mux task ended without a result"
                )));
            }
        };

        inner.state = PipelineState::Finalized;
        let blob = VideoBlob {
            data: output.data,
            mime_type: container.kind.mime_type(),
            container: container.kind,
            width: container.width,
            height: container.height,
            frame_count,
            chunk_count: output.chunk_count,
            encode_errors: stats.errors(),
            nominal_duration_micros: nominal_duration_micros(frame_count, self.settings.frame_rate),
        };
        log::info!(
            "export finished: {} {} bytes, {} chunks, {} encode errors",
            blob.mime_type,
            blob.data.len(),
            blob.chunk_count,
            blob.encode_errors
        );
        Ok(blob)
    }

    /// Stops all background work and drops buffered frames without producing
    /// output. Does nothing once finalized or already closed.
    pub fn close(&self) {
        let mut inner = self.lock();
        match inner.state {
            PipelineState::Finalized | PipelineState::Closed => return,
            _ => {}
        }
        self.cancel.cancel();
        inner.encoder = None;
        inner.mux_result = None;
        let dropped = inner.buffer.clear();
        log::info!(
            "pipeline closed in state {:?}, {} buffered frames dropped",
            inner.state,
            dropped
        );
        inner.state = PipelineState::Closed;
    }
}

impl Drop for VideoExporter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
