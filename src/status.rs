//! Status codes shared by the synchronous API and completion callbacks.
//!
//! The provider speaks errno-like integers on the wire; everything inside the
//! crate speaks [`DboxError`].

/// Result delivered to completion callbacks.
pub type Status = Result<(), DboxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DboxError {
    /// Stale handle, handle not yet identified, or a bad argument
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("out of memory")]
    OutOfMemory,
    /// An operation of the same kind is already in flight
    #[error("busy")]
    Busy,
    /// The requested value equals the current one
    #[error("already in requested state")]
    Already,
    /// Not allowed for system (non-user) instances
    #[error("permission denied")]
    PermissionDenied,
    /// Transport failure: no reply, request not sent, backend failure
    #[error("fault")]
    Fault,
    #[error("instance does not exist")]
    NotExist,
    /// A pending create was superseded by a delete
    #[error("canceled")]
    Canceled,
    /// The detail surface already carries this buffer
    #[error("already exists")]
    Exist,
    #[error("provider disconnected")]
    Disconnected,
}

impl DboxError {
    /// Wire code of this status.
    pub fn code(self) -> i32 {
        match self {
            DboxError::InvalidParameter => -22,
            DboxError::OutOfMemory => -12,
            DboxError::Busy => -16,
            DboxError::Already => -114,
            DboxError::PermissionDenied => -1,
            DboxError::Fault => -14,
            DboxError::NotExist => -2,
            DboxError::Canceled => -125,
            DboxError::Exist => -17,
            DboxError::Disconnected => -107,
        }
    }

    /// Decode a wire status. Non-negative values are success; unknown
    /// negative values collapse to `Fault`.
    pub fn from_code(code: i32) -> Status {
        let err = match code {
            c if c >= 0 => return Ok(()),
            -22 => DboxError::InvalidParameter,
            -12 => DboxError::OutOfMemory,
            -16 => DboxError::Busy,
            -114 => DboxError::Already,
            -1 => DboxError::PermissionDenied,
            -2 => DboxError::NotExist,
            -125 => DboxError::Canceled,
            -17 => DboxError::Exist,
            -107 => DboxError::Disconnected,
            _ => DboxError::Fault,
        };
        Err(err)
    }
}

/// Wire code of a status (0 on success).
pub fn status_code(status: Status) -> i32 {
    match status {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}
