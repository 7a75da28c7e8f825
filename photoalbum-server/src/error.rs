use std::path::PathBuf;

use thiserror::Error;

use crate::media::SUPPORTED_MIME_TYPES;

/// Rejection of an upload before anything touches the disk.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file too large ({size} bytes); maximum size is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported file type '{0}'; allowed types: {allowed}", allowed = SUPPORTED_MIME_TYPES.join(", "))]
    UnsupportedType(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while re-encoding a stored file. The file on disk is unchanged
/// whenever one of these is returned.
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a supported image")]
    Unsupported { path: PathBuf },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("encoding {path}: {message}")]
    Encode { path: PathBuf, message: String },
    #[error("replacing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
