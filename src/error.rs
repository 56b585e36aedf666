//! Unified error handling for the station-locator library.
//!
//! This module provides a consistent error type for all locator operations,
//! split along the failure taxonomy the core observes: data integrity,
//! input contract violations, geometry problems and storage failures.

use std::fmt;

/// Unified error type for station-locator operations.
#[derive(Debug, Clone)]
pub enum LocatorError {
    /// The installed dataset is internally inconsistent (missing node,
    /// segment/root mismatch, absent required coordinate). Not recoverable;
    /// callers are expected to treat this as requiring a full data reset.
    DataIntegrity { message: String },
    /// A caller violated an input contract (k < 1, non-finite query point,
    /// negative radius).
    InvalidParameter { message: String },
    /// Navigation was requested for a line that carries no track geometry.
    MissingGeometry { line: String },
    /// A track geometry document could not be decoded.
    MalformedGeometry { message: String },
    /// A storage lookup failed. The core does not retry; retry policy
    /// belongs to the storage collaborator.
    Storage { message: String },
}

impl fmt::Display for LocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocatorError::DataIntegrity { message } => {
                write!(f, "Dataset integrity error: {}", message)
            }
            LocatorError::InvalidParameter { message } => {
                write!(f, "Invalid parameter: {}", message)
            }
            LocatorError::MissingGeometry { line } => {
                write!(f, "Line '{}' has no track geometry", line)
            }
            LocatorError::MalformedGeometry { message } => {
                write!(f, "Malformed track geometry: {}", message)
            }
            LocatorError::Storage { message } => {
                write!(f, "Storage error: {}", message)
            }
        }
    }
}

impl std::error::Error for LocatorError {}

/// Result type alias for station-locator operations.
pub type Result<T> = std::result::Result<T, LocatorError>;

/// Extension trait for converting Option to LocatorError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a data integrity error.
    fn ok_or_integrity(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_integrity(self, message: &str) -> Result<T> {
        self.ok_or_else(|| LocatorError::DataIntegrity {
            message: message.to_string(),
        })
    }
}
