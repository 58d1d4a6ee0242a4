use std::path::PathBuf;

/// Errors raised by grid storage, raster I/O and run orchestration.
///
/// Per-cell numeric failures are never surfaced here; they are encoded as
/// sentinel values in the output grids (see [`crate::extract`]).
#[derive(thiserror::Error, Debug)]
pub enum DdcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("io error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tiff error in {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("grid descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported raster sample format in {path}: {format}")]
    UnsupportedRaster { path: PathBuf, format: String },

    #[error("shape mismatch for {what}: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },

    #[error("payload {path} holds {found} bytes, expected {expected}")]
    PayloadLength {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("result aggregator stopped: {0}")]
    Aggregator(String),

    /// Missing inputs or conflicting options, detected before any
    /// computation starts.
    #[error("setup error: {0}")]
    Setup(String),
}

impl DdcError {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt { path: path.into(), source }
    }

    pub(crate) fn tiff(path: impl Into<PathBuf>, source: tiff::TiffError) -> Self {
        Self::Tiff { path: path.into(), source }
    }

    /// True for configuration problems the user can fix by changing flags.
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}

pub type Result<T> = std::result::Result<T, DdcError>;
