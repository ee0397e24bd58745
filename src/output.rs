use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkCmd, ChunkReceiver};
use crate::muxer::Muxer;

/// What the mux task hands back once the container is sealed.
#[derive(Debug)]
pub struct MuxOutput {
    pub data: Bytes,
    pub chunk_count: u64,
}

pub type MuxResult = oneshot::Receiver<anyhow::Result<MuxOutput>>;

/// Owns the muxer for the lifetime of one export.
pub struct OutputTask {
    muxer: Muxer,
    have_failed: bool,
}

impl OutputTask {
    pub fn new(muxer: Muxer) -> Self {
        Self {
            muxer,
            have_failed: false,
        }
    }

    /// Appends every chunk until EOF, then finalizes. The result arrives on
    /// the returned receiver; a cancelled task drops the sender instead.
    pub fn start(self, mut chunks: ChunkReceiver, cancel: CancellationToken) -> MuxResult {
        let (done_tx, done_rx) = oneshot::channel();
        let mut task = self;
        tokio::spawn(async move {
            log::info!("mux task started: {}", task.muxer.mime_type());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("mux task cancelled after {} chunks", task.muxer.chunk_count());
                        return;
                    }
                    cmd = chunks.recv() => match cmd {
                        Some(ChunkCmd::Data(output)) => task.write_chunk(output),
                        Some(ChunkCmd::EOF) => break,
                        None => {
                            log::debug!("encoder went away before EOF");
                            return;
                        }
                    }
                }
            }
            let _ = done_tx.send(task.finish());
        });
        done_rx
    }

    fn write_chunk(&mut self, output: crate::chunk::EncodedOutput) {
        if self.have_failed {
            return;
        }
        if let Err(e) = self.muxer.append(&output.chunk, output.metadata.as_ref()) {
            // the container is unusable past a rejected chunk
            log::error!("mux append failed: {:#}", e);
            self.have_failed = true;
        }
    }

    fn finish(mut self) -> anyhow::Result<MuxOutput> {
        if self.have_failed {
            anyhow::bail!("a chunk was rejected by the {} muxer", self.muxer.mime_type());
        }
        let data = self.muxer.finalize()?;
        Ok(MuxOutput {
            data,
            chunk_count: self.muxer.chunk_count(),
        })
    }
}
