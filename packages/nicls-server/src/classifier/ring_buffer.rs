// Fixed-capacity frame buffer for the analysis window
//
// Always drops the oldest frame once full. The classifier owns the buffer
// behind its own lock, so no internal synchronization is needed here.

use crate::acquisition::Frame;
use ndarray::{s, Array2};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Counters for buffer monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferMetrics {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

pub struct FrameRingBuffer {
    frames: VecDeque<Arc<Frame>>,
    capacity: usize,
    total_pushed: u64,
    total_dropped: u64,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            total_pushed: 0,
            total_dropped: 0,
        }
    }

    /// Append a frame, evicting the oldest when full
    pub fn push(&mut self, frame: Arc<Frame>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.total_dropped += 1;
        }
        self.frames.push_back(frame);
        self.total_pushed += 1;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contiguous (channels, samples) copy of the buffered frames, oldest
    /// first. `None` when empty or when frame shapes disagree.
    pub fn snapshot(&self) -> Option<Array2<f64>> {
        let first = self.frames.front()?;
        let channels = first.num_channels();
        let total: usize = self.frames.iter().map(|f| f.num_samples()).sum();

        if self.frames.iter().any(|f| f.num_channels() != channels) {
            return None;
        }

        let mut window = Array2::zeros((channels, total));
        let mut offset = 0;
        for frame in &self.frames {
            let width = frame.num_samples();
            window
                .slice_mut(s![.., offset..offset + width])
                .assign(&frame.samples().mapv(f64::from));
            offset += width;
        }

        Some(window)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            total_pushed: self.total_pushed,
            total_dropped: self.total_dropped,
            current_size: self.frames.len(),
            capacity: self.capacity,
        }
    }
}
