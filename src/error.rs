/// Custom Result type for parbgzf operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the parbgzf library, encompassing all possible error cases
/// that can occur while compressing or decompressing BGZF streams.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum Error {
    /// Malformed BGZF framing (header, subfield, block size or deflate payload)
    FormatError(#[from] FormatError),
    /// Checksum or length mismatch between a block footer and its payload
    IntegrityError(#[from] IntegrityError),
    /// Input that cannot be packed into a BGZF block
    CapacityError(#[from] CapacityError),
    /// Invalid engine configuration
    ConfigError(#[from] ConfigError),
    /// Engine state errors (aborted or finished pipelines)
    PipelineError(#[from] PipelineError),
    /// Standard I/O errors from the underlying source or sink
    IoError(#[from] std::io::Error),
    /// Errors raised by the deflate backend while compressing
    CompressError(#[from] flate2::CompressError),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(inner) => inner,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Errors raised when a block does not follow the BGZF layout
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    /// The first two bytes are not the gzip magic number
    ///
    /// # Arguments
    /// * `[u8; 2]` - The bytes that were found instead
    #[error("Invalid gzip magic bytes: {0:02x?}")]
    InvalidMagic([u8; 2]),

    /// The compression method is not deflate (8)
    #[error("Unsupported compression method: {0}")]
    InvalidMethod(u8),

    /// The FEXTRA flag is not set, so the block cannot carry a BSIZE field
    #[error("Gzip flags ({0:#04x}) do not declare an extra field")]
    MissingExtraField(u8),

    /// The extra field does not contain a `BC` subfield of length 2
    #[error("Extra field of {0} bytes has no BC subfield")]
    MissingBlockSize(u16),

    /// The BSIZE field describes a block too small to hold a header and footer
    ///
    /// # Arguments
    /// * First `usize` - The declared total block size
    /// * Second `usize` - The minimum size implied by the header
    #[error("Declared block size ({0}) is smaller than its framing ({1})")]
    BlockTooSmall(usize, usize),

    /// The buffer handed to the decompressor does not match the declared BSIZE
    #[error("Block buffer holds {found} bytes but BSIZE declares {expected}")]
    BlockSizeMismatch { expected: usize, found: usize },

    /// The footer declares more uncompressed bytes than a block may hold
    #[error("Declared uncompressed size ({0}) exceeds the BGZF block limit")]
    UncompressedTooLarge(u32),

    /// The deflate payload could not be inflated
    #[error("Corrupt deflate payload: {0}")]
    CorruptPayload(#[from] flate2::DecompressError),
}

/// Errors raised when a decompressed payload disagrees with its footer
#[derive(thiserror::Error, Debug)]
pub enum IntegrityError {
    /// The CRC32 of the inflated payload does not match the footer
    #[error("CRC32 mismatch: footer declares {expected:#010x}, payload hashes to {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    /// The inflated payload length does not match the footer
    #[error("Uncompressed size mismatch: footer declares {expected}, payload inflates to {found}")]
    SizeMismatch { expected: u32, found: usize },
}

/// Errors raised when input cannot be fitted into the BGZF block ceiling
#[derive(thiserror::Error, Debug)]
pub enum CapacityError {
    /// A chunk that should always fit did not compress into a single block
    ///
    /// # Arguments
    /// * First `usize` - The size of the raw chunk
    /// * Second `usize` - The payload budget of a single block
    #[error("Chunk of {0} bytes does not deflate into a {1} byte block payload")]
    BlockOverflow(usize, usize),
}

/// Errors raised by invalid builder settings
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The chunk size is zero or larger than a block payload
    #[error("Invalid chunk size ({0}); expected a value in 1..={1}")]
    InvalidChunkSize(usize, usize),

    /// The compression level is outside the deflate range
    #[error("Invalid compression level ({0}); expected a value in 0..=9")]
    InvalidLevel(u32),

    /// The engine was configured without any buffer slots
    #[error("At least one buffer slot is required")]
    NoBuffers,
}

/// Errors describing the state of an engine
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// A previous error (or an explicit termination) aborted the pipeline
    #[error("The pipeline was aborted by an earlier error")]
    Aborted,

    /// Data was written after the stream was finished
    #[error("The stream has already been finished")]
    Finished,
}
