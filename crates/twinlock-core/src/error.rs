//! Error types for the lock and metadata subsystem.
//!
//! Lock outcomes such as `Aborted` or `Cancelled` are reported as
//! [`LockStatus`](crate::request::LockStatus) values on the request, never as
//! errors. Errors cover API misuse and resource exhaustion only.

use thiserror::Error;
use twinlock_cmi::{CmiError, ElementHandle, ObjectId};

/// Result type alias for lock and metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Error variants for lock and metadata operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The handle does not name a registered element.
    #[error("unknown or stale element handle {0:?}")]
    UnknownElement(ElementHandle),

    /// An element for this object is already registered.
    #[error("object 0x{object_id:x} is already registered")]
    AlreadyRegistered {
        /// Object id of the existing element.
        object_id: ObjectId,
    },

    /// A non-paged access falls outside the record.
    #[error("non-paged access at offset {offset} size {size} exceeds record size {capacity}")]
    OutOfBounds {
        /// Byte offset of the access.
        offset: u64,
        /// Bytes touched by the access.
        size: u64,
        /// Declared record size.
        capacity: u64,
    },

    /// A non-paged record or payload is larger than the configured maximum.
    #[error("record of {size} bytes exceeds maximum {max_size}")]
    RecordTooLarge {
        /// Requested size.
        size: usize,
        /// Configured maximum.
        max_size: usize,
    },

    /// The request is not held by this element.
    #[error("request {id} is not held by this element")]
    UnknownRequest {
        /// Request id.
        id: u64,
    },

    /// The stripe range is empty or reversed.
    #[error("invalid stripe range [{first}, {last}]")]
    InvalidRange {
        /// First stripe.
        first: u64,
        /// Last stripe.
        last: u64,
    },

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The lock domain has been shut down.
    #[error("lock domain stopped")]
    DomainStopped,

    /// Wraps transport and codec errors.
    #[error(transparent)]
    Cmi(#[from] CmiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_display() {
        let err = MetadataError::OutOfBounds {
            offset: 250,
            size: 10,
            capacity: 256,
        };
        assert_eq!(
            format!("{}", err),
            "non-paged access at offset 250 size 10 exceeds record size 256"
        );
    }

    #[test]
    fn test_already_registered_display() {
        let err = MetadataError::AlreadyRegistered { object_id: 0x10c };
        assert_eq!(format!("{}", err), "object 0x10c is already registered");
    }

    #[test]
    fn test_cmi_error_is_transparent() {
        let err: MetadataError = CmiError::Serialization("eof".into()).into();
        assert_eq!(format!("{}", err), "serialization error: eof");
    }
}
