//! bincode wire codec for [`CmiMessage`].

use crate::error::{CmiError, Result};
use crate::message::CmiMessage;

/// Largest encoded message accepted on the wire.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Encodes a message after checking its payload limits.
pub fn encode_message(msg: &CmiMessage) -> Result<Vec<u8>> {
    msg.validate()?;
    let bytes = bincode::serialize(msg).map_err(|e| CmiError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CmiError::MessageTooLarge {
            size: bytes.len(),
            max_size: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decodes a message received from the wire.
pub fn decode_message(bytes: &[u8]) -> Result<CmiMessage> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CmiError::MessageTooLarge {
            size: bytes.len(),
            max_size: MAX_MESSAGE_SIZE,
        });
    }
    bincode::deserialize(bytes).map_err(|e| CmiError::Serialization(e.to_string()))
}
