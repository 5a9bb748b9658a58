// Acquisition stream handling
//
// Reads fixed-size 24-bit packets from the amplifier's TCP export and
// publishes each decoded frame on the event bus.

pub mod frame;
pub mod listener;

pub use frame::{Frame, FrameCodec, SAMPLE_MAX, SAMPLE_MIN};
pub use listener::AcquisitionReader;

use crate::bus::{BusError, Topic};
use std::sync::Arc;

/// Frames decoded by an [`AcquisitionReader`]
pub struct FrameTopic;

impl Topic for FrameTopic {
    const NAME: &'static str = "acquisition.frame";
    type Message = Arc<Frame>;
}

/// Acquisition errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream ended inside a packet: got {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error("Packet is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Frame shape {actual:?} does not match {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Sample {0} does not fit in 24 bits")]
    SampleOutOfRange(i32),

    #[error(transparent)]
    Publish(#[from] BusError),
}

pub type StreamResult<T> = Result<T, StreamError>;
