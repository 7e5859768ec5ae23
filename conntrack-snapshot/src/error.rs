use std::{io, path::PathBuf};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a single snapshot. Every variant is terminal for the call.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("getting monotonic clock time: {0}")]
    Clock(#[source] io::Error),
    #[error("unable to open map {}: map does not exist", path.display())]
    MapMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to open map {}", path.display())]
    MapOpen {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("error while collecting BPF map entries from {}", path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: MapDumpError,
    },
}

/// Reported by a map handle that could not be opened.
#[derive(Debug, Error)]
pub enum MapOpenError {
    #[error("map does not exist")]
    NotFound(#[source] io::Error),
    #[error(transparent)]
    Other(BoxError),
}

/// Reported by a map handle when iterating its contents fails.
#[derive(Debug, Error)]
#[error("map dump failed: {0}")]
pub struct MapDumpError(#[source] pub BoxError);

impl MapDumpError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self(err.into())
    }
}
