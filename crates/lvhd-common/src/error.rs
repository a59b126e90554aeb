//! Error types for LVHD
//!
//! Every storage operation has a distinct error identity so the dispatcher
//! can report clone vs. resize vs. delete failures separately (§7 of the
//! design notes). Crash/interruption is deliberately absent: it is resolved
//! by the recovery pass at SR attach, not surfaced to callers.

use thiserror::Error;

/// Common result type for LVHD operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Common error type for LVHD
#[derive(Debug, Error)]
pub enum StorageError {
    /// Not enough free space in the volume group for the operation,
    /// detected up front before any destructive step
    #[error("insufficient space in SR: required {required} bytes, available {available} bytes")]
    SrNoSpace { required: u64, available: u64 },

    /// The SR-wide lock could not be acquired within the bounded retry
    /// window (typically a concurrent coalesce run holds it)
    #[error("SR is busy")]
    SrBusy,

    /// The VDI cannot be used for the requested operation
    #[error("VDI {uuid} unavailable: {reason}")]
    VdiUnavailable { uuid: String, reason: String },

    /// Snapshot/clone operation failed
    #[error("VDI clone failed: {0}")]
    VdiClone(String),

    /// Resize operation failed
    #[error("VDI resize failed: {0}")]
    VdiResize(String),

    /// Create operation failed
    #[error("VDI create failed: {0}")]
    VdiCreate(String),

    /// Delete operation failed
    #[error("VDI delete failed: {0}")]
    VdiDelete(String),

    /// VDI not present in this SR
    #[error("VDI not found: {0}")]
    VdiNotFound(String),

    /// Logical volume not present in the volume group
    #[error("LV not found: {0}")]
    LvNotFound(String),

    /// An external LVM/VHD tool invocation failed
    #[error("command `{cmd}` failed with status {status}: {stderr}")]
    CmdFailed {
        cmd: String,
        status: i32,
        stderr: String,
    },

    /// VHD integrity check failed
    #[error("VHD check failed for {0}")]
    VhdInvalid(String),

    /// Recovery found on-disk state it cannot resolve safely
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    /// Metadata store error
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Journal error
    #[error("journal error: {0}")]
    Journal(String),

    /// Refcount persistence error
    #[error("refcount error: {0}")]
    Refcount(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create an unexpected-state error
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedState(msg.into())
    }

    /// Create a VDI-unavailable error
    pub fn unavailable(uuid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VdiUnavailable {
            uuid: uuid.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VdiNotFound(_) | Self::LvNotFound(_))
    }

    /// Check if the caller may retry after a bounded wait
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::SrBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(StorageError::VdiNotFound("x".into()).is_not_found());
        assert!(StorageError::LvNotFound("VHD-x".into()).is_not_found());
        assert!(!StorageError::SrBusy.is_not_found());
    }

    #[test]
    fn test_cmd_failed_display() {
        let err = StorageError::CmdFailed {
            cmd: "lvcreate -n VHD-a vg".into(),
            status: 5,
            stderr: "insufficient free space".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("lvcreate"));
        assert!(msg.contains("status 5"));
    }
}
