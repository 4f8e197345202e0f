use std::path::PathBuf;

use tessera_parallel::{CollectiveError, SyncCheckError, SynchronizationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NanosetError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("index {index} is out of bounds, we only have {len} samples")]
    Index { index: usize, len: usize },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("collective failed: {0}")]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Synchronization(#[from] SynchronizationError),
}

impl NanosetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<SyncCheckError> for NanosetError {
    fn from(value: SyncCheckError) -> Self {
        match value {
            SyncCheckError::Collective(err) => err.into(),
            SyncCheckError::Unsynchronized(err) => err.into(),
        }
    }
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::NanosetError::Configuration(format!($($arg)*))
    };
}

pub(crate) use config_error;
