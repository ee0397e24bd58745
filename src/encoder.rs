use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkCmd, ChunkSender, EncodedOutput};
use crate::container::VideoCodec;
use crate::frame::Frame;

/// Encoder configuration, fixed once the container is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub frame_rate: u32,
    pub alpha: bool,
}

impl EncoderConfig {
    pub const MAX_BITRATE: u32 = 10_000_000;

    /// Builds a configuration, clamping the bitrate to [`Self::MAX_BITRATE`].
    pub fn new(
        codec: VideoCodec,
        width: u32,
        height: u32,
        bitrate_bps: u32,
        frame_rate: u32,
        alpha: bool,
    ) -> Self {
        Self {
            codec,
            width,
            height,
            bitrate_bps: bitrate_bps.min(Self::MAX_BITRATE),
            frame_rate,
            alpha,
        }
    }

    pub fn codec_string(&self) -> &'static str {
        self.codec.codec_string()
    }
}

/// A configured, synchronous codec instance. Runs on the encoder worker thread.
pub trait ChunkEncoder: Send {
    /// Encodes one frame. May return zero or more chunks, as codecs with
    /// internal delay do.
    fn encode(&mut self, frame: &Frame) -> anyhow::Result<Vec<EncodedOutput>>;

    /// Drains everything still buffered inside the codec.
    fn flush(&mut self) -> anyhow::Result<Vec<EncodedOutput>>;
}

/// Source of [`ChunkEncoder`]s, i.e. the platform's encoding capability.
pub trait EncoderFactory: Send + Sync {
    fn is_available(&self) -> bool;

    fn create(&self, config: &EncoderConfig) -> anyhow::Result<Box<dyn ChunkEncoder>>;
}

pub type EncodeErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

pub fn log_encode_error() -> EncodeErrorCallback {
    Arc::new(|e: &anyhow::Error| log::error!("encode error: {:#}", e))
}

#[derive(Debug, Default)]
pub struct EncoderStats {
    submitted: AtomicU64,
    encoded: AtomicU64,
    errors: AtomicU64,
}

impl EncoderStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Frames whose encode call returned successfully.
    pub fn encoded(&self) -> u64 {
        self.encoded.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

enum EncoderCmd {
    Frame(Frame),
    Flush,
}

/// Handle to the encoder worker.
///
/// Frames go through an unbounded FIFO so `encode` never blocks the caller;
/// the worker forwards chunks to the mux task in the same order.
pub struct FrameEncoder {
    tx: mpsc::Sender<EncoderCmd>,
    stats: Arc<EncoderStats>,
}

impl FrameEncoder {
    /// Spawns the worker on tokio's blocking pool. Must be called from within
    /// a runtime.
    pub fn start(
        backend: Box<dyn ChunkEncoder>,
        out: ChunkSender,
        on_error: EncodeErrorCallback,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<EncoderCmd>();
        let stats = Arc::new(EncoderStats::default());
        let worker_stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            Self::encoder_loop(backend, cancel, rx, out, on_error, worker_stats)
        });
        log::info!("encoder worker started");
        Self { tx, stats }
    }

    pub fn encode(&self, frame: Frame) -> anyhow::Result<()> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(EncoderCmd::Frame(frame))
            .map_err(|_| anyhow::anyhow!("encoder worker has stopped"))
    }

    /// Asks the worker to flush the codec and signal EOF downstream. Frames
    /// sent before this call are encoded first.
    pub fn finish(self) -> anyhow::Result<()> {
        self.tx
            .send(EncoderCmd::Flush)
            .map_err(|_| anyhow::anyhow!("encoder worker has stopped"))
    }

    pub fn stats(&self) -> Arc<EncoderStats> {
        self.stats.clone()
    }

    fn encoder_loop(
        mut encoder: Box<dyn ChunkEncoder>,
        cancel: CancellationToken,
        rx: mpsc::Receiver<EncoderCmd>,
        out: ChunkSender,
        on_error: EncodeErrorCallback,
        stats: Arc<EncoderStats>,
    ) {
        let forward = |outputs: Vec<EncodedOutput>| -> bool {
            outputs
                .into_iter()
                .all(|output| out.send(ChunkCmd::Data(output)).is_ok())
        };

        loop {
            if cancel.is_cancelled() {
                log::debug!("encoder worker cancelled");
                return;
            }
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(EncoderCmd::Frame(frame)) => {
                    let result = encoder.encode(&frame);
                    // pixels are not needed past the encode call
                    drop(frame);
                    match result {
                        Ok(outputs) => {
                            stats.encoded.fetch_add(1, Ordering::Relaxed);
                            if !forward(outputs) {
                                log::debug!("mux task gone, stopping encoder worker");
                                return;
                            }
                        }
                        Err(e) => {
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            on_error(&e);
                        }
                    }
                }
                Ok(EncoderCmd::Flush) => {
                    match encoder.flush() {
                        Ok(outputs) => {
                            forward(outputs);
                        }
                        Err(e) => {
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            on_error(&e);
                        }
                    }
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::debug!("encoder handle dropped, stopping worker");
                    return;
                }
            }
        }

        log::info!(
            "end of encoder loop: {} submitted, {} encoded, {} errors",
            stats.submitted(),
            stats.encoded(),
            stats.errors()
        );
        let _ = out.send(ChunkCmd::EOF);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::chunk::{ChunkKind, EncodedChunk};
    use crate::frame::{PixelFormat, VideoImage};

    struct Echo {
        fail_on: Option<u64>,
        delay: usize,
        pending: Vec<EncodedOutput>,
    }

    impl ChunkEncoder for Echo {
        fn encode(&mut self, frame: &Frame) -> anyhow::Result<Vec<EncodedOutput>> {
            if self.fail_on == Some(frame.index()) {
                anyhow::bail!("frame {} rejected", frame.index());
            }
            let kind = if frame.index() == 0 {
                ChunkKind::Key
            } else {
                ChunkKind::Delta
            };
            self.pending.push(
                EncodedChunk::new(
                    vec![frame.index() as u8],
                    kind,
                    frame.timestamp_micros(),
                    frame.duration_micros(),
                )
                .into(),
            );
            if self.pending.len() > self.delay {
                Ok(vec![self.pending.remove(0)])
            } else {
                Ok(Vec::new())
            }
        }

        fn flush(&mut self) -> anyhow::Result<Vec<EncodedOutput>> {
            Ok(std::mem::take(&mut self.pending))
        }
    }

    fn frame(index: u64) -> Frame {
        let image = VideoImage::new(2, 2, PixelFormat::Rgba, vec![0u8; 16]).unwrap();
        Frame::at_cadence(index, image, 30).unwrap()
    }

    async fn collect(mut rx: crate::chunk::ChunkReceiver) -> (Vec<u64>, bool) {
        let mut timestamps = Vec::new();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                ChunkCmd::Data(output) => timestamps.push(output.chunk.timestamp_micros()),
                ChunkCmd::EOF => return (timestamps, true),
            }
        }
        (timestamps, false)
    }

    #[test]
    fn test_bitrate_is_clamped() {
        let config = EncoderConfig::new(VideoCodec::Vp9, 2, 2, 50_000_000, 30, true);
        assert_eq!(config.bitrate_bps, EncoderConfig::MAX_BITRATE);
        let config = EncoderConfig::new(VideoCodec::H264, 2, 2, 1_000_000, 30, false);
        assert_eq!(config.bitrate_bps, 1_000_000);
        assert_eq!(config.codec_string(), "avc1.42001f");
    }

    #[tokio::test]
    async fn test_flush_drains_delayed_chunks_in_order() -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let backend = Box::new(Echo {
            fail_on: None,
            delay: 3,
            pending: Vec::new(),
        });
        let encoder = FrameEncoder::start(backend, tx, log_encode_error(), CancellationToken::new());
        for index in 0..10 {
            encoder.encode(frame(index))?;
        }
        let stats = encoder.stats();
        encoder.finish()?;

        let (timestamps, eof) = collect(rx).await;
        assert!(eof);
        let expected: Vec<u64> = (0..10).map(|i| i * 1_000_000 / 30).collect();
        assert_eq!(timestamps, expected);
        assert_eq!(stats.submitted(), 10);
        assert_eq!(stats.encoded(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_errors_go_to_callback_and_worker_continues() -> anyhow::Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_error: EncodeErrorCallback = Arc::new(move |e: &anyhow::Error| {
            sink.lock().unwrap().push(e.to_string());
        });

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let backend = Box::new(Echo {
            fail_on: Some(2),
            delay: 0,
            pending: Vec::new(),
        });
        let encoder = FrameEncoder::start(backend, tx, on_error, CancellationToken::new());
        for index in 0..5 {
            encoder.encode(frame(index))?;
        }
        let stats = encoder.stats();
        encoder.finish()?;

        let (timestamps, eof) = collect(rx).await;
        assert!(eof);
        assert_eq!(timestamps.len(), 4);
        assert_eq!(stats.errors(), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["frame 2 rejected"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_without_eof() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let backend = Box::new(Echo {
            fail_on: None,
            delay: 0,
            pending: Vec::new(),
        });
        let encoder = FrameEncoder::start(backend, tx, log_encode_error(), cancel.clone());
        cancel.cancel();

        let (_, eof) = collect(rx).await;
        assert!(!eof);
        // the worker is gone, so later frames are refused or silently dropped
        let _ = encoder.encode(frame(0));
        Ok(())
    }
}
