use std::path::PathBuf;

use crate::Span;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unable to create spill directory: {0}")]
    Directory(#[source] std::io::Error),
    #[error("unable to create chunk {path}: {source}")]
    CreateChunk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to map chunk {path}: {source}")]
    MapChunk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("disk quota of {quota} bytes exceeded (requested {requested} more)")]
    QuotaExceeded { quota: u64, requested: u64 },
    #[error("span {0:?} is outside of the backing store")]
    InvalidSpan(Span),
}
