use std::collections::VecDeque;

use crate::frame::Frame;

/// Frames submitted before the encoder exists. Drained in one go, in
/// submission order, once the encoder is configured.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Takes every queued frame, leaving the buffer empty.
    pub fn drain_all(&mut self) -> std::collections::vec_deque::IntoIter<Frame> {
        std::mem::take(&mut self.frames).into_iter()
    }

    /// Drops all queued frames and their pixel buffers.
    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }
}
