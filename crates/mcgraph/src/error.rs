use thiserror::Error;

use crate::device::DeviceError;

/// Errors surfaced by the compute context and framework.
///
/// Usage errors are caller bugs. Backend errors carry the failing operation and the
/// (slot, version) generation they happened in. Numerical-policy errors are raised
/// where the adaptive rules cannot produce a well-posed computation.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("{op}: {message}")]
    Usage { op: &'static str, message: String },

    #[error("{op} (slot {slot}, version {version}): {source}")]
    Backend {
        op: &'static str,
        slot: usize,
        version: usize,
        #[source]
        source: DeviceError,
    },

    #[error("{op}: {message}")]
    Numerical { op: &'static str, message: String },

    #[error(
        "{op} (slot {slot}, version {version}): least-squares solve for conditional expectation \
         {regression} failed with {paths} paths and basis size {basis_size}: {message}"
    )]
    Solve {
        op: &'static str,
        slot: usize,
        version: usize,
        regression: usize,
        paths: usize,
        basis_size: usize,
        message: String,
    },

    #[error("internal error in {op}: {message}")]
    Internal { op: &'static str, message: String },
}

impl ComputeError {
    pub fn usage(op: &'static str, message: impl Into<String>) -> Self {
        ComputeError::Usage {
            op,
            message: message.into(),
        }
    }

    pub fn numerical(op: &'static str, message: impl Into<String>) -> Self {
        ComputeError::Numerical {
            op,
            message: message.into(),
        }
    }

    pub fn internal(op: &'static str, message: impl Into<String>) -> Self {
        ComputeError::Internal {
            op,
            message: message.into(),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, ComputeError::Usage { .. })
    }
}

/// Convenience alias for results returned by the compute context.
pub type ComputeResult<T> = Result<T, ComputeError>;
