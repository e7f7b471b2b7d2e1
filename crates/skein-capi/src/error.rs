//! The boundary error-code enumeration.
//!
//! Every fallible entry point returns one of these instead of raising; the
//! mapping from engine errors is total, so no internal failure crosses the
//! boundary as anything else.

use skein::EngineError;

/// Status codes returned by every fallible entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkeinCode {
    Ok = 0,
    /// Null or stale handle.
    InvalidPtr = 1,
    InvalidArg = 2,
    Unsupported = 3,
    AllocFailed = 4,
    /// Shape/size inference or resize mismatch.
    ComputeSize = 5,
    /// Map/unmap pairing violation.
    MapState = 6,
    /// Requested metadata is not determinable yet.
    InfoNotAvailable = 7,
    BackendUnavailable = 8,
    IoError = 9,
    SerdeError = 10,
    Unknown = 100,
}

impl From<&EngineError> for SkeinCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::InvalidArgument(_) => SkeinCode::InvalidArg,
            EngineError::Unsupported(_) => SkeinCode::Unsupported,
            EngineError::AllocFailed(_) => SkeinCode::AllocFailed,
            EngineError::ShapeMismatch(_) => SkeinCode::ComputeSize,
            EngineError::MapState(_) => SkeinCode::MapState,
            EngineError::InfoNotAvailable => SkeinCode::InfoNotAvailable,
            EngineError::BackendUnavailable(_) => SkeinCode::BackendUnavailable,
            EngineError::Io(_) => SkeinCode::IoError,
            EngineError::Serde(_) => SkeinCode::SerdeError,
            EngineError::StaleHandle(_) => SkeinCode::InvalidPtr,
        }
    }
}

impl SkeinCode {
    pub(crate) fn from_result<T>(result: Result<T, EngineError>) -> SkeinCode {
        match result {
            Ok(_) => SkeinCode::Ok,
            Err(err) => {
                log::debug!("boundary call failed: {err}");
                SkeinCode::from(&err)
            }
        }
    }
}
