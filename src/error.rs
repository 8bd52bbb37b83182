use std::path::PathBuf;

use thiserror::Error;

/// Error kinds produced by the fusion core.
///
/// Warnings for recoverable degradations (missing nodata/mask, CRS mismatch,
/// band-count truncation, a `proc_crs` override that contradicts the
/// resolution heuristic) are logged via [`log::warn!`] rather than returned
/// here.
#[derive(Error, Debug)]
pub enum RastFuseError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("format error: {0}")]
    Format(String),

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("content error: {0}")]
    Content(String),

    #[error("block size error: {0}")]
    BlockSize(String),

    #[error("output file already exists: {0}")]
    FileExists(PathBuf),

    #[error("shape error: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, RastFuseError>;
