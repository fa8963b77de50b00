//! Gzip sink that can be drained in pieces.
//!
//! The sink wraps a single gzip encoder writing into an in-memory buffer.
//! Draining the buffer never touches encoder state, so chunks drained over
//! the sink's lifetime concatenate, in order, into one valid gzip stream.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use snafu::prelude::*;
use std::io::Write;

use crate::error::{CompressSnafu, SinkError, SinkFinalizedSnafu};

/// gzip level used when none is configured.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Line-oriented gzip buffer.
pub struct CompressedSink {
    encoder: GzEncoder<Vec<u8>>,
    finalized: bool,
}

impl CompressedSink {
    /// Create an empty sink compressing at `level` (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::new(level)),
            finalized: false,
        }
    }

    /// Append each line followed by `\n`.
    ///
    /// Ends with a sync flush so every accepted line is reflected in
    /// [`buffered_size`](Self::buffered_size).
    pub fn write<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<(), SinkError> {
        ensure!(!self.finalized, SinkFinalizedSnafu { operation: "write" });
        if lines.is_empty() {
            return Ok(());
        }

        for line in lines {
            self.encoder
                .write_all(line.as_ref().as_bytes())
                .context(CompressSnafu)?;
            self.encoder.write_all(b"\n").context(CompressSnafu)?;
        }
        self.encoder.flush().context(CompressSnafu)
    }

    /// Compressed bytes accumulated since the last extraction.
    pub fn buffered_size(&self) -> usize {
        self.encoder.get_ref().len()
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn extract_and_reset(&mut self) -> Bytes {
        Bytes::from(std::mem::take(self.encoder.get_mut()))
    }

    /// Finish the gzip stream. The trailer lands in the buffer.
    pub fn finalize(&mut self) -> Result<(), SinkError> {
        ensure!(
            !self.finalized,
            SinkFinalizedSnafu {
                operation: "finalize"
            }
        );
        self.encoder.try_finish().context(CompressSnafu)?;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl Default for CompressedSink {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn decode(bytes: &[u8]) -> String {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn test_buffered_size_grows_with_each_write() {
        let mut sink = CompressedSink::default();
        assert_eq!(sink.buffered_size(), 0);

        let mut previous = 0;
        for i in 0..20 {
            sink.write(&[format!("row-{i},a,b,c")]).unwrap();
            let size = sink.buffered_size();
            assert!(size > previous, "write {i} did not grow the buffer");
            previous = size;
        }
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut sink = CompressedSink::default();
        let empty: [&str; 0] = [];
        sink.write(&empty).unwrap();
        assert_eq!(sink.buffered_size(), 0);
    }

    #[test]
    fn test_extract_resets_buffer() {
        let mut sink = CompressedSink::default();
        sink.write(&["a,b", "c,d"]).unwrap();

        let chunk = sink.extract_and_reset();
        assert!(!chunk.is_empty());
        assert_eq!(sink.buffered_size(), 0);

        sink.write(&["e,f"]).unwrap();
        assert!(sink.buffered_size() > 0);
    }

    #[test]
    fn test_chunks_concatenate_into_one_stream() {
        let mut sink = CompressedSink::new(1);
        let mut stream = Vec::new();
        let mut expected = String::new();

        for chunk in 0..5 {
            let lines: Vec<String> = (0..100).map(|i| format!("{chunk},{i},payload")).collect();
            for line in &lines {
                expected.push_str(line);
                expected.push('\n');
            }
            sink.write(&lines).unwrap();
            stream.extend_from_slice(&sink.extract_and_reset());
        }

        sink.finalize().unwrap();
        stream.extend_from_slice(&sink.extract_and_reset());

        assert_eq!(decode(&stream), expected);
    }

    #[test]
    fn test_finalize_empty_sink_is_valid_gzip() {
        let mut sink = CompressedSink::default();
        sink.finalize().unwrap();
        let bytes = sink.extract_and_reset();
        assert!(!bytes.is_empty());
        assert_eq!(decode(&bytes), "");
    }

    #[test]
    fn test_write_after_finalize_fails() {
        let mut sink = CompressedSink::default();
        sink.write(&["x"]).unwrap();
        sink.finalize().unwrap();
        assert!(sink.is_finalized());

        let err = sink.write(&["y"]).unwrap_err();
        assert!(matches!(err, SinkError::SinkFinalized { operation: "write" }));

        let err = sink.finalize().unwrap_err();
        assert!(matches!(
            err,
            SinkError::SinkFinalized {
                operation: "finalize"
            }
        ));
    }
}
