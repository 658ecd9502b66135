//! Error types.
//!
//! Panics inside processes are not errors here: they are caught by the
//! worker and routed to the process's panic handler. These types cover what
//! the host can observe.

use thiserror::Error;

use crate::pid::Pid;

/// A heap refused an allocation because it would exceed `HeapConfig::max_bytes`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("heap limit of {limit} bytes exceeded ({used} in use, {requested} requested)")]
pub struct AllocError {
    pub limit: usize,
    pub used: usize,
    pub requested: usize,
}

/// Fatal runtime conditions, reported by `Runtime::join` and `Runtime::shutdown`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("process {pid} panicked without a handler: {message}")]
    UnhandledPanic { pid: Pid, message: String },

    #[error("message copy failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("failed to start {what}: {reason}")]
    Startup { what: &'static str, reason: String },
}

/// Why a spawn request was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("process table is full ({capacity} slots)")]
    TableFull { capacity: usize },

    #[error("runtime is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RuntimeError::UnhandledPanic {
            pid: Pid::new(2, 0),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "process <2.0> panicked without a handler: boom");

        let alloc = AllocError { limit: 64, used: 60, requested: 10 };
        let err: RuntimeError = alloc.into();
        assert!(err.to_string().contains("64 bytes"));
    }
}
