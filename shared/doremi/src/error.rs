use tessera_parallel::{CollectiveError, SyncCheckError, SynchronizationError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DoReMiError {
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("collective failed: {0}")]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Synchronization(#[from] SynchronizationError),
}

impl From<SyncCheckError> for DoReMiError {
    fn from(value: SyncCheckError) -> Self {
        match value {
            SyncCheckError::Collective(err) => err.into(),
            SyncCheckError::Unsynchronized(err) => err.into(),
        }
    }
}

macro_rules! shape_error {
    ($($arg:tt)*) => {
        $crate::error::DoReMiError::Shape(format!($($arg)*))
    };
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::DoReMiError::Configuration(format!($($arg)*))
    };
}

pub(crate) use {config_error, shape_error};
