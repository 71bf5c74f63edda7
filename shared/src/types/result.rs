//! Result codes and the error type returned by every metrics operation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result codes reported across the metrics API surface
///
/// The discriminants follow the Level Zero `ze_result_t` values so a code can
/// be handed to C callers unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    NotReady = 1,
    ErrorNotAvailable = 0x7001_0001,
    ErrorDependencyUnavailable = 0x7002_0000,
    WarningDroppedData = 0x7002_0001,
    ErrorUninitialized = 0x7800_0001,
    ErrorUnsupportedFeature = 0x7800_0003,
    ErrorInvalidArgument = 0x7800_0004,
    ErrorInvalidNullHandle = 0x7800_0005,
    ErrorHandleObjectInUse = 0x7800_0006,
    ErrorInvalidNullPointer = 0x7800_0007,
    ErrorInvalidSize = 0x7800_0008,
    ErrorUnknown = 0x7fff_fffe,
}

impl ResultCode {
    /// `true` for `Success` and success-class warnings
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::WarningDroppedData)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "ZE_RESULT_SUCCESS",
            ResultCode::NotReady => "ZE_RESULT_NOT_READY",
            ResultCode::ErrorNotAvailable => "ZE_RESULT_ERROR_NOT_AVAILABLE",
            ResultCode::ErrorDependencyUnavailable => "ZE_RESULT_ERROR_DEPENDENCY_UNAVAILABLE",
            ResultCode::WarningDroppedData => "ZE_RESULT_WARNING_DROPPED_DATA",
            ResultCode::ErrorUninitialized => "ZE_RESULT_ERROR_UNINITIALIZED",
            ResultCode::ErrorUnsupportedFeature => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
            ResultCode::ErrorInvalidArgument => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
            ResultCode::ErrorInvalidNullHandle => "ZE_RESULT_ERROR_INVALID_NULL_HANDLE",
            ResultCode::ErrorHandleObjectInUse => "ZE_RESULT_ERROR_HANDLE_OBJECT_IN_USE",
            ResultCode::ErrorInvalidNullPointer => "ZE_RESULT_ERROR_INVALID_NULL_POINTER",
            ResultCode::ErrorInvalidSize => "ZE_RESULT_ERROR_INVALID_SIZE",
            ResultCode::ErrorUnknown => "ZE_RESULT_ERROR_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Errors produced by the metrics engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    #[error("data not ready: {0}")]
    NotReady(String),

    #[error("resource not available: {0}")]
    NotAvailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("required pointer is null: {0}")]
    InvalidNullPointer(&'static str),

    #[error("required handle is null: {0}")]
    InvalidNullHandle(&'static str),

    #[error("buffer too small: {required} bytes required, {provided} provided")]
    InvalidSize { required: usize, provided: usize },

    #[error("object still in use: {0}")]
    HandleObjectInUse(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("no metric source available: {0}")]
    DependencyUnavailable(String),

    #[error("not initialized: {0}")]
    Uninitialized(String),

    #[error("{0}")]
    Unknown(String),
}

impl MetricsError {
    /// Result code reported for this error at the API boundary
    pub fn code(&self) -> ResultCode {
        match self {
            MetricsError::NotReady(_) => ResultCode::NotReady,
            MetricsError::NotAvailable(_) => ResultCode::ErrorNotAvailable,
            MetricsError::InvalidArgument(_) => ResultCode::ErrorInvalidArgument,
            MetricsError::InvalidNullPointer(_) => ResultCode::ErrorInvalidNullPointer,
            MetricsError::InvalidNullHandle(_) => ResultCode::ErrorInvalidNullHandle,
            MetricsError::InvalidSize { .. } => ResultCode::ErrorInvalidSize,
            MetricsError::HandleObjectInUse(_) => ResultCode::ErrorHandleObjectInUse,
            MetricsError::UnsupportedFeature(_) => ResultCode::ErrorUnsupportedFeature,
            MetricsError::DependencyUnavailable(_) => ResultCode::ErrorDependencyUnavailable,
            MetricsError::Uninitialized(_) => ResultCode::ErrorUninitialized,
            MetricsError::Unknown(_) => ResultCode::ErrorUnknown,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MetricsError::InvalidArgument(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        MetricsError::Unknown(msg.into())
    }

    pub fn not_available(msg: impl Into<String>) -> Self {
        MetricsError::NotAvailable(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        MetricsError::UnsupportedFeature(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Collapse an engine result into the code reported to API callers
pub fn to_result_code<T>(result: &Result<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

/// Outcome of a successful raw-data read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStatus {
    /// All requested data was returned
    Complete,
    /// The hardware buffer overflowed since the previous read and reports were lost
    DroppedData,
}

impl ReadStatus {
    pub fn code(self) -> ResultCode {
        match self {
            ReadStatus::Complete => ResultCode::Success,
            ReadStatus::DroppedData => ResultCode::WarningDroppedData,
        }
    }
}
