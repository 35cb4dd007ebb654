//! # parbgzf
//!
//! Parallel compression and decompression of BGZF (blocked gzip) streams.
//!
//! A BGZF stream is a concatenation of independent gzip members of at most 64 KiB,
//! each carrying its own size in a `BC` extra subfield, and terminated by a fixed
//! empty block. Because blocks are independent they can be compressed and inflated
//! on many threads at once, as long as the output is put back in order.
//!
//! * [`BgzfWriter`] - `std::io::Write` facade compressing on a worker pool
//! * [`BgzfReader`] - `std::io::Read` facade decompressing on a worker pool
//! * [`BgzfTranscoder`] - a reader and writer sharing one pool
//! * [`compress`] / [`decompress`] - single-threaded one-shot helpers
//! * [`BlockIndex`] - per-block offsets, readable and writable as `.gzi`
//!
//! ```rust
//! use std::io::{Read, Write};
//! use parbgzf::{BgzfReaderBuilder, BgzfWriterBuilder};
//!
//! let mut writer = BgzfWriterBuilder::default().threads(2).build(Vec::new()).unwrap();
//! writer.write_all(b"hello bgzf").unwrap();
//! let stream = writer.into_inner().unwrap();
//!
//! let mut reader = BgzfReaderBuilder::default().threads(2).build(std::io::Cursor::new(stream)).unwrap();
//! let mut text = String::new();
//! reader.read_to_string(&mut text).unwrap();
//! assert_eq!(text, "hello bgzf");
//! ```

mod block;
mod codec;
mod error;
mod header;
mod index;
mod planner;
mod pool;
pub mod queue;
mod reader;
mod transcode;
mod writer;

pub use block::{compress, decompress, read_block_into};
pub use codec::{BlockSizes, Compressor, Decompressor, DEFAULT_LEVEL, DEFLATE_BOUND};
pub use error::{
    CapacityError, ConfigError, Error, FormatError, IntegrityError, PipelineError, Result,
};
pub use header::{
    is_eof_marker, BlockFooter, BlockHeader, DEFAULT_CHUNK_SIZE, EOF_MARKER, MAX_BLOCK_PAYLOAD,
    MAX_BLOCK_SIZE,
};
pub use index::{BlockIndex, BlockObserver, IndexEntry};
pub use planner::FlushPlanner;
pub use pool::{default_threads, Operation, WorkerPool, BUFFERS_PER_THREAD};
pub use reader::{BgzfReader, BgzfReaderBuilder};
pub use transcode::{BgzfTranscoder, BgzfTranscoderBuilder};
pub use writer::{BgzfWriter, BgzfWriterBuilder};
