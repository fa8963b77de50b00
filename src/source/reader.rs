//! Batching line reader.
//!
//! Splits an async byte stream on newlines and groups the lines into
//! fixed-size batches. Only the final batch may be shorter.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

/// An ordered group of input records routed to one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based position of this batch in the input.
    pub seq: u64,
    pub records: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reads `batch_size` lines at a time from an async reader.
pub struct BatchReader<R> {
    lines: Lines<R>,
    batch_size: usize,
    next_seq: u64,
    records_read: u64,
}

impl<R: AsyncBufRead + Unpin> BatchReader<R> {
    pub fn new(reader: R, batch_size: usize) -> Self {
        Self {
            lines: reader.lines(),
            batch_size: batch_size.max(1),
            next_seq: 0,
            records_read: 0,
        }
    }

    /// Read the next batch, or `None` once the input is exhausted.
    pub async fn next_batch(&mut self) -> std::io::Result<Option<Batch>> {
        let mut records = Vec::with_capacity(self.batch_size);
        while records.len() < self.batch_size {
            match self.lines.next_line().await? {
                Some(line) => records.push(line),
                None => break,
            }
        }

        if records.is_empty() {
            return Ok(None);
        }

        self.records_read += records.len() as u64;
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(Some(Batch { seq, records }))
    }

    /// Total records returned so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batches_with_short_tail() {
        let input = "1\n2\n3\n4\n5\n6\n7\n";
        let mut reader = BatchReader::new(input.as_bytes(), 2);

        let mut batches = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            batches.push(batch);
        }

        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 2, 1]);
        assert_eq!(batches[3].records, vec!["7".to_string()]);
        assert_eq!(batches[3].seq, 3);
        assert_eq!(reader.records_read(), 7);
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_batches() {
        let mut reader = BatchReader::new(&b""[..], 10);
        assert!(reader.next_batch().await.unwrap().is_none());
        assert_eq!(reader.records_read(), 0);
    }

    #[tokio::test]
    async fn test_missing_trailing_newline_and_crlf() {
        let input = "a,1\r\nb,2\nc,3";
        let mut reader = BatchReader::new(input.as_bytes(), 10);

        let batch = reader.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.records, vec!["a,1", "b,2", "c,3"]);
        assert!(reader.next_batch().await.unwrap().is_none());
    }
}
