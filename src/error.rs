use std::time::Duration;

use gallery_model::{ContentId, FilterId, ImageId};
use thiserror::Error;

/// Coarse classification shared by every error the core surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: unreachable device, timeouts, dropped connections.
    Connectivity,
    /// The device refused a command for this input.
    Rejection,
    /// Device storage is full.
    Capacity,
    /// The active filter matched nothing.
    NoEligibleImages,
    /// A cached content id is no longer known to the device.
    StaleContent,
}

/// Errors surfaced by the device link and its transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Commands are refused while the link is not `Connected`.
    #[error("device is not connected")]
    NotConnected,

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("connection to device lost: {0}")]
    ConnectionLost(String),

    /// Pairing was refused; retrying with the same credentials will not help.
    #[error("device refused pairing: {0}")]
    Unauthorized(String),

    /// The link gave up and parked until an explicit reconnect.
    #[error("device connection failed: {0}")]
    Failed(String),

    #[error("device rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("device storage is full")]
    Capacity,

    #[error("content {0} is no longer on the device")]
    StaleContent(ContentId),
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceError::NotConnected
            | DeviceError::Unreachable(_)
            | DeviceError::Timeout(_)
            | DeviceError::ConnectionLost(_)
            | DeviceError::Unauthorized(_)
            | DeviceError::Failed(_) => ErrorClass::Connectivity,
            DeviceError::Rejected { .. } => ErrorClass::Rejection,
            DeviceError::Capacity => ErrorClass::Capacity,
            DeviceError::StaleContent(_) => ErrorClass::StaleContent,
        }
    }

    /// Handshake failures that must park the link in `Failed`.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeviceError::Unauthorized(_))
    }

    /// Command outcomes after which the session can no longer be trusted.
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            DeviceError::Timeout(_) | DeviceError::ConnectionLost(_)
        )
    }
}

/// Failure of `UploadCoordinator::ensure_uploaded`. Cloned to every caller
/// waiting on the same in-flight upload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("image {0} is not in the library")]
    UnknownImage(ImageId),

    #[error("failed to read {path}: {reason}")]
    Source { path: String, reason: String },

    #[error("unsupported file type for {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("upload task ended without a result")]
    Interrupted,
}

impl UploadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UploadError::Device(err) => err.class(),
            UploadError::Interrupted => ErrorClass::Connectivity,
            UploadError::UnknownImage(_)
            | UploadError::Source { .. }
            | UploadError::UnsupportedFormat(_) => ErrorClass::Rejection,
        }
    }
}

/// Problems with a saved filter expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter {id}: {reason}")]
    Malformed { id: FilterId, reason: String },

    #[error("unsupported field: {0}")]
    UnsupportedField(String),

    #[error("unsupported operator {operator} for field {field}")]
    UnsupportedOperator { field: String, operator: String },

    #[error("unsupported combinator: {0}")]
    UnsupportedCombinator(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Outcome of a scheduling decision that did not change the active image.
#[derive(Debug, Error)]
pub enum SlideshowError {
    #[error("device is not connected")]
    NotConnected,

    #[error("no images match the active filter")]
    NoEligibleImages,

    #[error("image {0} is not in the library")]
    UnknownImage(ImageId),

    #[error("slideshow configuration changed while the tick was in flight")]
    Superseded,

    #[error("scheduler is not running")]
    Stopped,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SlideshowError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            SlideshowError::NotConnected => Some(ErrorClass::Connectivity),
            SlideshowError::NoEligibleImages => Some(ErrorClass::NoEligibleImages),
            SlideshowError::Upload(err) => Some(err.class()),
            SlideshowError::Device(err) => Some(err.class()),
            SlideshowError::Filter(_) => Some(ErrorClass::Rejection),
            SlideshowError::UnknownImage(_)
            | SlideshowError::Superseded
            | SlideshowError::Stopped
            | SlideshowError::Store(_) => None,
        }
    }
}
