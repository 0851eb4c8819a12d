//! Error taxonomy shared by the chunk memory, hashing and delegation core
//! (mem_region, chunk_list, hash_pipeline, delegator, request_list).
//!
//! Mirrors the six-way split the engine is built against: invariant
//! violations abort, storage errors surface to the download, communication
//! errors surface to the connection, resource errors stay local, input
//! errors surface to the user, and shutdown is a cooperative teardown
//! signal for the hash worker.

use std::io;

/// Raw OS errno preserved across a failed syscall, so callers can log or
/// branch on it (e.g. ENOSPC vs EACCES) without re-deriving it from an
/// `io::Error` that may have lost it by the time it reaches the caller.
pub type Errno = i32;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// An invariant was violated. The caller should log, dump state, and
    /// abort — there is no recovery path.
    #[error("internal error: {0}")]
    Internal(String),

    /// The filesystem refused a required operation.
    #[error("storage error (errno={errno:?}): {message}")]
    Storage {
        message: String,
        errno: Option<Errno>,
        #[source]
        source: Option<io::Error>,
    },

    /// A peer sent bytes violating the wire protocol contract this
    /// component is responsible for validating (e.g. a mismatched block
    /// length in a PIECE message).
    #[error("communication error: {0}")]
    Communication(String),

    /// Transient, local-only condition: the caller is expected to retry
    /// or back off. Must never propagate past the immediate caller.
    #[error("resource exhausted: {0}")]
    Resource(ResourceKind),

    /// Malformed metainfo or configuration.
    #[error("input error: {0}")]
    Input(String),

    /// Cooperative signal used by the hash worker to unwind during
    /// teardown. Not a failure.
    #[error("shutting down")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResourceKind {
    #[error("EAGAIN")]
    Again,
    #[error("ENOMEM (reservation ceiling reached)")]
    NoMemory,
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn storage(message: impl Into<String>, source: io::Error) -> Self {
        let errno = source.raw_os_error();
        Self::Storage {
            message: message.into(),
            errno,
            source: Some(source),
        }
    }

    pub fn storage_errno(message: impl Into<String>, errno: Errno) -> Self {
        Self::Storage {
            message: message.into(),
            errno: Some(errno),
            source: None,
        }
    }

    pub fn again() -> Self {
        Self::Resource(ResourceKind::Again)
    }

    pub fn no_memory() -> Self {
        Self::Resource(ResourceKind::NoMemory)
    }

    pub const fn is_again(&self) -> bool {
        matches!(self, Self::Resource(ResourceKind::Again))
    }

    /// `true` for errors that mean "this download is no longer usable
    /// until the operator intervenes" per the storage_error contract.
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn again_is_resource_kind() {
        let e = EngineError::again();
        assert!(e.is_again());
        assert!(!e.is_storage());
    }

    #[test]
    fn storage_preserves_errno() {
        let io_err = io::Error::from_raw_os_error(28); // ENOSPC
        let e = EngineError::storage("preallocating piece", io_err);
        match e {
            EngineError::Storage { errno, .. } => assert_eq!(errno, Some(28)),
            _ => panic!("wrong variant"),
        }
    }
}
