//! Wire-level types for the duplex speech endpoints.

pub mod audio;
pub mod frames;

pub use audio::{SAMPLE_RATE, SAMPLES_PER_FRAME};
pub use frames::{ClientFrame, ServerFrame, decode_frame, encode_frame};
