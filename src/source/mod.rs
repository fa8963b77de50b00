//! Input side of the pipeline: line framing and batching.

mod reader;

pub use reader::{Batch, BatchReader};
