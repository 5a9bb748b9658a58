// Decoded acquisition packets and the 24-bit wire codec
//
// A packet is `channels * samples * 3` bytes with no header or checksum. Each
// 3-byte group is a little-endian two's-complement integer.

use super::{StreamError, StreamResult};
use crate::config::{ExperimentConfig, WireLayout};
use ndarray::Array2;

/// Bytes per encoded sample
pub const SAMPLE_WIDTH: usize = 3;
/// Largest representable 24-bit sample
pub const SAMPLE_MAX: i32 = 0x7F_FFFF;
/// Smallest representable 24-bit sample
pub const SAMPLE_MIN: i32 = -0x80_0000;

/// One decoded packet, shaped (channels, samples)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Array2<i32>,
}

impl Frame {
    pub fn new(samples: Array2<i32>) -> Self {
        Self { samples }
    }

    pub fn zeros(channels: usize, samples: usize) -> Self {
        Self::new(Array2::zeros((channels, samples)))
    }

    pub fn num_channels(&self) -> usize {
        self.samples.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.samples.ncols()
    }

    /// Sample matrix, rows are channels
    pub fn samples(&self) -> &Array2<i32> {
        &self.samples
    }
}

#[inline]
fn decode_sample(bytes: &[u8]) -> i32 {
    // Place the 24 bits in the top of an i32 and shift back to sign-extend
    i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8
}

#[inline]
fn encode_sample(value: i32) -> [u8; SAMPLE_WIDTH] {
    let bytes = value.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

/// Converts between raw packets and [`Frame`]s of a fixed shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    channels: usize,
    samples: usize,
    layout: WireLayout,
}

impl FrameCodec {
    pub fn new(channels: usize, samples: usize, layout: WireLayout) -> Self {
        Self {
            channels,
            samples,
            layout,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.channels, config.datarate, config.wire_layout)
    }

    /// Size of one packet on the wire
    pub fn packet_bytes(&self) -> usize {
        self.channels * self.samples * SAMPLE_WIDTH
    }

    #[inline]
    fn offset(&self, channel: usize, sample: usize) -> usize {
        let index = match self.layout {
            WireLayout::SampleMajor => sample * self.channels + channel,
            WireLayout::ChannelMajor => channel * self.samples + sample,
        };
        index * SAMPLE_WIDTH
    }

    /// Decode exactly one packet
    pub fn decode(&self, bytes: &[u8]) -> StreamResult<Frame> {
        if bytes.len() != self.packet_bytes() {
            return Err(StreamError::FrameSize {
                expected: self.packet_bytes(),
                actual: bytes.len(),
            });
        }

        let samples = Array2::from_shape_fn((self.channels, self.samples), |(ch, s)| {
            let at = self.offset(ch, s);
            decode_sample(&bytes[at..at + SAMPLE_WIDTH])
        });

        Ok(Frame::new(samples))
    }

    /// Encode a frame into one packet
    pub fn encode(&self, frame: &Frame) -> StreamResult<Vec<u8>> {
        if frame.num_channels() != self.channels || frame.num_samples() != self.samples {
            return Err(StreamError::ShapeMismatch {
                expected: (self.channels, self.samples),
                actual: (frame.num_channels(), frame.num_samples()),
            });
        }

        let mut bytes = vec![0u8; self.packet_bytes()];
        for ((ch, s), &value) in frame.samples().indexed_iter() {
            if !(SAMPLE_MIN..=SAMPLE_MAX).contains(&value) {
                return Err(StreamError::SampleOutOfRange(value));
            }
            let at = self.offset(ch, s);
            bytes[at..at + SAMPLE_WIDTH].copy_from_slice(&encode_sample(value));
        }

        Ok(bytes)
    }
}
