//! Error types for the CMI subsystem.

use thiserror::Error;

/// Errors raised while encoding, decoding or moving CMI messages.
#[derive(Debug, Error)]
pub enum CmiError {
    /// Encoded message exceeds the wire limit.
    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Largest size the wire accepts.
        max_size: usize,
    },

    /// Payload inside a message exceeds its field limit.
    #[error("payload too large for {field}: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Name of the offending field.
        field: &'static str,
        /// Payload size in bytes.
        size: usize,
        /// Field limit in bytes.
        max_size: usize,
    },

    /// bincode failed to encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for the CMI subsystem.
pub type Result<T> = std::result::Result<T, CmiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_too_large_display() {
        let err = CmiError::MessageTooLarge {
            size: 9000,
            max_size: 4096,
        };
        assert_eq!(format!("{}", err), "message too large: 9000 bytes (max 4096)");
    }

    #[test]
    fn test_payload_too_large_display() {
        let err = CmiError::PayloadTooLarge {
            field: "memory_update",
            size: 300,
            max_size: 256,
        };
        assert!(format!("{}", err).contains("memory_update"));
    }
}
