//! Compressed output buffers.

mod compressed;

pub use compressed::{CompressedSink, DEFAULT_COMPRESSION_LEVEL};
