//! Audio frame buffering between the capture path and the transport.

pub mod control;
pub mod ring;

pub use control::{ControlQueue, Priority};
pub use ring::{ReadChunk, RingFrameBuffer, WriteOutcome, FRAME_STEP_MICROS};
