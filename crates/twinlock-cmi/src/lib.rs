#![warn(missing_docs)]

//! Twinlock CMI subsystem: the message vocabulary two controller nodes use to
//! coordinate stripe locks and mirror non-paged metadata, the bincode wire
//! codec, the transport collaborator traits and an in-process loopback link.

pub mod codec;
pub mod error;
pub mod handle;
pub mod loopback;
pub mod message;
pub mod region;
pub mod transport;

pub use codec::{decode_message, encode_message, MAX_MESSAGE_SIZE};
pub use error::{CmiError, Result};
pub use handle::{ElementHandle, ObjectId, RequestToken};
pub use loopback::{LoopbackEndpoint, LoopbackLink, LoopbackStats};
pub use message::{
    ChangeKind, CmiLockFlags, CmiMessage, LockMode, MessageBody, MessageHeader, MessageType,
    NonpagedChange, NonpagedWrite, OperationFlags, StripeLockMessage, MEMORY_UPDATE_MAX,
    NONPAGED_PAYLOAD_MAX, PROTOCOL_VERSION,
};
pub use region::StripeRegion;
pub use transport::{CmiClient, CmiEvent, CmiTransport, SendToken};
