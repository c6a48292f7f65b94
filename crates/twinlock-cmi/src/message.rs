//! CMI message vocabulary.
//!
//! Every message is a fixed envelope ([`MessageHeader`]) followed by a tagged
//! body. Stripe-lock traffic carries explicit request/grant tokens instead of
//! one pointer field reinterpreted per message type.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::error::{CmiError, Result};
use crate::handle::{ElementHandle, ObjectId, RequestToken};
use crate::region::StripeRegion;

/// Wire protocol version emitted by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest metadata-memory block a `MemoryUpdate` may carry.
pub const MEMORY_UPDATE_MAX: usize = 256;

/// Largest data payload of a non-paged write or change.
pub const NONPAGED_PAYLOAD_MAX: usize = 1024;

/// Flags describing a metadata operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OperationFlags(u32);

impl OperationFlags {
    /// The write must be persisted; the receiver marks peer persist pending.
    pub const PERSIST: Self = Self(0x1);
    /// The body carries a sequence number for a system object.
    pub const SEQ_NUM: Self = Self(0x2);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for OperationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-exchange stripe-lock flags carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CmiLockFlags(u32);

impl CmiLockFlags {
    /// The grant covers an exact range and must be released explicitly.
    pub const NEED_RELEASE: Self = Self(0x1);
    /// The request was issued by a monitor (background) operation.
    pub const MONITOR_OP: Self = Self(0x2);
    /// The abort was produced by a destroy; wait for peer-lost instead.
    pub const ABORT_DESTROY: Self = Self(0x4);
    /// The request guards always-resident metadata.
    pub const NON_PAGED: Self = Self(0x8);
    /// The request guards demand-paged metadata.
    pub const PAGED: Self = Self(0x10);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for CmiLockFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Read or write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Flat message-type discriminant, derived from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Metadata memory block mirror.
    MemoryUpdate,
    /// Non-paged byte-range write.
    NonpagedWrite,
    /// Persist fence for a prior non-paged write.
    NonpagedPostPersist,
    /// Unconditional checkpoint overwrite.
    ForceSetCheckpoint,
    /// OR a repeated bit pattern.
    SetBits,
    /// AND-NOT a repeated bit pattern.
    ClearBits,
    /// Ordered checkpoint update.
    SetCheckpoint,
    /// Compare-and-increment checkpoint.
    IncrCheckpoint,
    /// Element started taking peer lock traffic.
    StripeLockStart,
    /// Element stopped taking peer lock traffic.
    StripeLockStop,
    /// Shared lock request.
    StripeReadLock,
    /// Exclusive lock request.
    StripeWriteLock,
    /// Shared lock grant.
    StripeReadGrant,
    /// Exclusive lock grant.
    StripeWriteGrant,
    /// Release of a need-release grant.
    StripeRelease,
    /// Request refused or withdrawn.
    StripeAborted,
}

/// Fixed message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol version of the sender.
    pub version: u8,
    /// Sender's handle for its own element.
    pub sender: ElementHandle,
    /// Receiver's handle as last learned by the sender, or null.
    pub receiver: ElementHandle,
    /// Object the element guards; validated against any resolved handle.
    pub object_id: ObjectId,
    /// Metadata operation flags.
    pub flags: OperationFlags,
}

impl MessageHeader {
    /// Builds a current-version header.
    pub fn new(sender: ElementHandle, receiver: ElementHandle, object_id: ObjectId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender,
            receiver,
            object_id,
            flags: OperationFlags::empty(),
        }
    }

    /// Replaces the operation flags.
    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Non-paged byte-range write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonpagedWrite {
    /// Byte offset into the record.
    pub offset: u64,
    /// Bytes to copy; the write size is `data.len()`.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Sequence number for system objects.
    pub seq_number: u64,
}

/// Non-paged bit or checkpoint change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonpagedChange {
    /// Byte offset into the record.
    pub offset: u64,
    /// Bit pattern, or the little-endian checkpoint value.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Pattern repeat count, or the increment for `IncrCheckpoint`.
    pub repeat_count: u64,
    /// Offset of a second tracked checkpoint; zero when unused.
    pub second_offset: u64,
    /// Sequence number for system objects.
    pub seq_number: u64,
}

impl NonpagedChange {
    /// Builds a checkpoint change carrying `value`.
    pub fn checkpoint(offset: u64, value: u64, repeat_count: u64, second_offset: u64) -> Self {
        Self {
            offset,
            data: value.to_le_bytes().to_vec(),
            repeat_count,
            second_offset,
            seq_number: 0,
        }
    }

    /// Checkpoint value carried in `data`, if it holds eight bytes.
    pub fn checkpoint_value(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.data.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }
}

/// Kind of a [`NonpagedChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// OR the pattern.
    SetBits,
    /// AND-NOT the pattern.
    ClearBits,
    /// Ordered checkpoint update.
    SetCheckpoint,
    /// Unconditional checkpoint overwrite.
    ForceSetCheckpoint,
    /// Compare-and-increment.
    IncrCheckpoint,
}

/// Stripe-lock exchange, tagged by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeLockMessage {
    /// The sender attached its lock blob; also used to exchange handles.
    Start,
    /// The sender detached its lock blob.
    Stop,
    /// Ask the peer for a lock over `region`.
    Request {
        /// Requested access.
        mode: LockMode,
        /// Range as reflected by the initiator.
        region: StripeRegion,
        /// Initiator's original request.
        request: RequestToken,
        /// Exchange flags; `None` from version-0 peers, which expect a
        /// full-slice grant.
        flags: Option<CmiLockFlags>,
    },
    /// Grant a previously requested lock.
    Grant {
        /// Granted access.
        mode: LockMode,
        /// Shared range the granter recorded for the initiator.
        read_region: StripeRegion,
        /// Exclusive range the granter recorded for the initiator.
        write_region: StripeRegion,
        /// Initiator's original request.
        request: RequestToken,
        /// Granter's shadow, addressed by a later `Release`.
        grant: RequestToken,
        /// Exchange flags.
        flags: CmiLockFlags,
    },
    /// Release a need-release grant.
    Release {
        /// Granter's shadow.
        grant: RequestToken,
    },
    /// The request was refused or withdrawn.
    Aborted {
        /// Initiator's original request.
        request: RequestToken,
        /// Exchange flags.
        flags: CmiLockFlags,
    },
}

/// Type-specific message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Mirror of the element's metadata memory block.
    MemoryUpdate {
        /// Block contents.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Non-paged write.
    NonpagedWrite(NonpagedWrite),
    /// Persist fence.
    NonpagedPostPersist,
    /// Non-paged bit or checkpoint change.
    NonpagedChange {
        /// Change kind.
        kind: ChangeKind,
        /// Change parameters.
        change: NonpagedChange,
    },
    /// Stripe-lock traffic.
    StripeLock(StripeLockMessage),
}

/// A complete CMI message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmiMessage {
    /// Envelope.
    pub header: MessageHeader,
    /// Body.
    pub body: MessageBody,
}

impl CmiMessage {
    /// Builds a message.
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// Flat type of this message.
    pub fn message_type(&self) -> MessageType {
        match &self.body {
            MessageBody::MemoryUpdate { .. } => MessageType::MemoryUpdate,
            MessageBody::NonpagedWrite(_) => MessageType::NonpagedWrite,
            MessageBody::NonpagedPostPersist => MessageType::NonpagedPostPersist,
            MessageBody::NonpagedChange { kind, .. } => match kind {
                ChangeKind::SetBits => MessageType::SetBits,
                ChangeKind::ClearBits => MessageType::ClearBits,
                ChangeKind::SetCheckpoint => MessageType::SetCheckpoint,
                ChangeKind::ForceSetCheckpoint => MessageType::ForceSetCheckpoint,
                ChangeKind::IncrCheckpoint => MessageType::IncrCheckpoint,
            },
            MessageBody::StripeLock(lock) => match lock {
                StripeLockMessage::Start => MessageType::StripeLockStart,
                StripeLockMessage::Stop => MessageType::StripeLockStop,
                StripeLockMessage::Request { mode, .. } => match mode {
                    LockMode::Read => MessageType::StripeReadLock,
                    LockMode::Write => MessageType::StripeWriteLock,
                },
                StripeLockMessage::Grant { mode, .. } => match mode {
                    LockMode::Read => MessageType::StripeReadGrant,
                    LockMode::Write => MessageType::StripeWriteGrant,
                },
                StripeLockMessage::Release { .. } => MessageType::StripeRelease,
                StripeLockMessage::Aborted { .. } => MessageType::StripeAborted,
            },
        }
    }

    /// Returns true for stripe-lock traffic.
    pub fn is_stripe_lock(&self) -> bool {
        matches!(self.body, MessageBody::StripeLock(_))
    }

    /// Checks payload limits before the message goes on the wire.
    pub fn validate(&self) -> Result<()> {
        match &self.body {
            MessageBody::MemoryUpdate { data } if data.len() > MEMORY_UPDATE_MAX => {
                Err(CmiError::PayloadTooLarge {
                    field: "memory_update",
                    size: data.len(),
                    max_size: MEMORY_UPDATE_MAX,
                })
            }
            MessageBody::NonpagedWrite(write) if write.data.len() > NONPAGED_PAYLOAD_MAX => {
                Err(CmiError::PayloadTooLarge {
                    field: "nonpaged_write",
                    size: write.data.len(),
                    max_size: NONPAGED_PAYLOAD_MAX,
                })
            }
            MessageBody::NonpagedChange { change, .. }
                if change.data.len() > NONPAGED_PAYLOAD_MAX =>
            {
                Err(CmiError::PayloadTooLarge {
                    field: "nonpaged_change",
                    size: change.data.len(),
                    max_size: NONPAGED_PAYLOAD_MAX,
                })
            }
            _ => Ok(()),
        }
    }
}
