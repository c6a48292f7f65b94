//! Non-paged metadata records and their replication to the peer.
//!
//! Every local operation mutates the record under the element's record lock
//! and, while that lock is still held, hands the same mutation to the
//! transport. Holding the lock across the send keeps the peer's view of the
//! record in the order the local mutations happened.
//!
//! The receive side applies the same mutations clamped to its own record
//! size; a peer running with a larger record after an online upgrade only
//! ever writes the prefix this node knows about.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use twinlock_cmi::{
    ChangeKind, CmiEvent, ElementHandle, MessageBody, MessageHeader, NonpagedChange,
    NonpagedWrite, OperationFlags,
};

use crate::completion::Completion;
use crate::domain::{InFlight, LockDomain};
use crate::element::{MetadataElement, NonpagedRecord};
use crate::error::{MetadataError, MetadataResult};

const CHECKPOINT_SIZE: u64 = 8;

/// How far a metadata update got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationOutcome {
    /// Applied locally; there was no peer to mirror it to.
    LocalOnly,
    /// Applied locally and transmitted to the peer.
    Replicated,
    /// Applied locally; the transport refused the mirror.
    Failed,
}

impl ReplicationOutcome {
    /// Maps a delivery outcome. A peer that is gone counts as nothing to
    /// replicate to.
    pub fn from_event(event: CmiEvent) -> Self {
        match event {
            CmiEvent::Transmitted => ReplicationOutcome::Replicated,
            CmiEvent::PeerNotPresent | CmiEvent::PeerContactLost => ReplicationOutcome::LocalOnly,
            CmiEvent::FatalError | CmiEvent::PeerBusy => ReplicationOutcome::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        *self == ReplicationOutcome::Failed
    }
}

impl LockDomain {
    /// Overwrites `data.len()` bytes of the record at `offset`.
    pub fn write_nonpaged(
        &self,
        handle: ElementHandle,
        offset: u64,
        data: &[u8],
        flags: OperationFlags,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        self.check_payload(data.len())?;
        let mut record = el.nonpaged.lock();
        let range = checked_range(&record.data, offset, data.len() as u64)?;
        record.data[range].copy_from_slice(data);

        let (flags, seq_number) = stamp(&el, &mut record, flags);
        let body = MessageBody::NonpagedWrite(NonpagedWrite {
            offset,
            data: data.to_vec(),
            seq_number,
        });
        Ok(self.replicate(&el, flags, body))
    }

    /// ORs `pattern` into the record `repeat` times, back to back from `offset`.
    pub fn set_bits(
        &self,
        handle: ElementHandle,
        offset: u64,
        pattern: &[u8],
        repeat: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        self.change_bits(handle, ChangeKind::SetBits, offset, pattern, repeat)
    }

    /// Clears the bits of `pattern` in the record `repeat` times from `offset`.
    pub fn clear_bits(
        &self,
        handle: ElementHandle,
        offset: u64,
        pattern: &[u8],
        repeat: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        self.change_bits(handle, ChangeKind::ClearBits, offset, pattern, repeat)
    }

    fn change_bits(
        &self,
        handle: ElementHandle,
        kind: ChangeKind,
        offset: u64,
        pattern: &[u8],
        repeat: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        self.check_payload(pattern.len())?;
        let span = (pattern.len() as u64)
            .checked_mul(repeat)
            .ok_or(MetadataError::OutOfBounds {
                offset,
                size: u64::MAX,
                capacity: el.config().nonpaged_size as u64,
            })?;
        let mut record = el.nonpaged.lock();
        checked_range(&record.data, offset, span)?;
        apply_pattern(&mut record.data, kind, offset, pattern, repeat);

        let (flags, seq_number) = stamp(&el, &mut record, OperationFlags::empty());
        let body = MessageBody::NonpagedChange {
            kind,
            change: NonpagedChange {
                offset,
                data: pattern.to_vec(),
                repeat_count: repeat,
                second_offset: 0,
                seq_number,
            },
        };
        Ok(self.replicate(&el, flags, body))
    }

    /// Moves the checkpoint at `offset` forward to `value`. A `second_offset`
    /// other than zero names a second checkpoint tracked alongside it.
    ///
    /// A value not above the stored one leaves the record unchanged.
    pub fn set_checkpoint(
        &self,
        handle: ElementHandle,
        offset: u64,
        value: u64,
        second_offset: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        let mut record = el.nonpaged.lock();
        checked_checkpoints(&record.data, offset, second_offset)?;
        advance_checkpoint(&mut record.data, offset, value);
        if second_offset != 0 {
            advance_checkpoint(&mut record.data, second_offset, value);
        }
        let (flags, seq_number) = stamp(&el, &mut record, OperationFlags::empty());
        let mut change = NonpagedChange::checkpoint(offset, value, 0, second_offset);
        change.seq_number = seq_number;
        let body = MessageBody::NonpagedChange {
            kind: ChangeKind::SetCheckpoint,
            change,
        };
        Ok(self.replicate(&el, flags, body))
    }

    /// Overwrites the checkpoint at `offset` regardless of its current value.
    /// A nonzero `second_offset` is overwritten with the same value.
    pub fn force_set_checkpoint(
        &self,
        handle: ElementHandle,
        offset: u64,
        value: u64,
        second_offset: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        let mut record = el.nonpaged.lock();
        checked_checkpoints(&record.data, offset, second_offset)?;
        force_checkpoints(&mut record.data, offset, value, second_offset);
        let (flags, seq_number) = stamp(&el, &mut record, OperationFlags::empty());
        let mut change = NonpagedChange::checkpoint(offset, value, 0, second_offset);
        change.seq_number = seq_number;
        let body = MessageBody::NonpagedChange {
            kind: ChangeKind::ForceSetCheckpoint,
            change,
        };
        Ok(self.replicate(&el, flags, body))
    }

    /// Adds `delta` to the checkpoint at `offset` if it still equals
    /// `expected`, and to the checkpoint at a nonzero `second_offset` along
    /// with it. A checkpoint that already moved is left alone and the call
    /// still succeeds; the peer applies the same comparison.
    pub fn incr_checkpoint(
        &self,
        handle: ElementHandle,
        offset: u64,
        expected: u64,
        delta: u64,
        second_offset: u64,
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        let mut record = el.nonpaged.lock();
        checked_checkpoints(&record.data, offset, second_offset)?;
        if !increment_checkpoints(&mut record.data, offset, expected, delta, second_offset) {
            debug!(object_id = el.object_id(), offset, expected, "checkpoint already moved");
        }
        let (flags, seq_number) = stamp(&el, &mut record, OperationFlags::empty());
        let mut change = NonpagedChange::checkpoint(offset, expected, delta, second_offset);
        change.seq_number = seq_number;
        let body = MessageBody::NonpagedChange {
            kind: ChangeKind::IncrCheckpoint,
            change,
        };
        Ok(self.replicate(&el, flags, body))
    }

    /// Local-only form of [`incr_checkpoint`](Self::incr_checkpoint). Returns
    /// true if the checkpoint was incremented.
    pub fn incr_checkpoint_no_peer(
        &self,
        handle: ElementHandle,
        offset: u64,
        expected: u64,
        delta: u64,
        second_offset: u64,
    ) -> MetadataResult<bool> {
        let el = self.element(handle)?;
        let mut record = el.nonpaged.lock();
        checked_checkpoints(&record.data, offset, second_offset)?;
        Ok(increment_checkpoints(&mut record.data, offset, expected, delta, second_offset))
    }

    /// Tells the peer a prior persisted write has reached stable storage.
    pub fn post_persist(&self, handle: ElementHandle) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        let _record = el.nonpaged.lock();
        Ok(self.replicate(&el, OperationFlags::empty(), MessageBody::NonpagedPostPersist))
    }

    /// Stores `data` as the element's metadata memory block and mirrors it.
    pub fn update_metadata_memory(
        &self,
        handle: ElementHandle,
        data: &[u8],
    ) -> MetadataResult<Completion<ReplicationOutcome>> {
        let el = self.element(handle)?;
        let max_size = self.config.memory_update_size;
        if data.len() > max_size {
            return Err(MetadataError::RecordTooLarge {
                size: data.len(),
                max_size,
            });
        }
        el.store_memory(data);
        let body = MessageBody::MemoryUpdate {
            data: data.to_vec(),
        };
        Ok(self.replicate(&el, OperationFlags::empty(), body))
    }

    /// Copies `len` bytes of the record starting at `offset`.
    pub fn read_nonpaged(&self, handle: ElementHandle, offset: u64, len: usize) -> MetadataResult<Vec<u8>> {
        let el = self.element(handle)?;
        let record = el.nonpaged.lock();
        let range = checked_range(&record.data, offset, len as u64)?;
        Ok(record.data[range].to_vec())
    }

    /// Reads the checkpoint stored at `offset`.
    pub fn read_checkpoint(&self, handle: ElementHandle, offset: u64) -> MetadataResult<u64> {
        let el = self.element(handle)?;
        let record = el.nonpaged.lock();
        checked_range(&record.data, offset, CHECKPOINT_SIZE)?;
        read_checkpoint(&record.data, offset).ok_or(MetadataError::OutOfBounds {
            offset,
            size: CHECKPOINT_SIZE,
            capacity: record.data.len() as u64,
        })
    }

    /// Last sequence number received from the peer.
    pub fn peer_seq_number(&self, handle: ElementHandle) -> MetadataResult<u64> {
        Ok(self.element(handle)?.nonpaged.lock().peer_seq_number)
    }

    /// Sequence number of the last update this node sent.
    pub fn seq_number(&self, handle: ElementHandle) -> MetadataResult<u64> {
        Ok(self.element(handle)?.nonpaged.lock().seq_number)
    }

    /// Returns true while the peer has a persisted write it has not fenced.
    pub fn is_peer_persist_pending(&self, handle: ElementHandle) -> MetadataResult<bool> {
        Ok(self.element(handle)?.attributes.is_peer_persist_pending())
    }

    fn check_payload(&self, size: usize) -> MetadataResult<()> {
        let max_size = self.config.max_nonpaged_size;
        if size > max_size {
            return Err(MetadataError::RecordTooLarge { size, max_size });
        }
        Ok(())
    }

    fn replicate(
        &self,
        el: &MetadataElement,
        flags: OperationFlags,
        body: MessageBody,
    ) -> Completion<ReplicationOutcome> {
        if !self.replication_enabled(el) {
            return Completion::ready(ReplicationOutcome::LocalOnly);
        }
        el.stats.inc_nonpaged_update();
        let (completer, completion) = Completion::channel();
        self.transmit(
            self.header(el).with_flags(flags),
            body,
            InFlight::Nonpaged {
                completer: Some(completer),
            },
        );
        completion
    }

    /// Applies a non-paged update received from the peer.
    pub(crate) fn apply_peer_nonpaged(&self, el: &MetadataElement, header: &MessageHeader, body: MessageBody) {
        el.stats.inc_nonpaged_received();
        let mut record = el.nonpaged.lock();
        match body {
            MessageBody::NonpagedWrite(write) => {
                if header.flags.contains(OperationFlags::SEQ_NUM) {
                    record.peer_seq_number = write.seq_number;
                }
                if header.flags.contains(OperationFlags::PERSIST) {
                    el.attributes.set_peer_persist_pending();
                }
                self.apply_peer_write(el, &mut record.data, write);
            }
            MessageBody::NonpagedPostPersist => el.attributes.clear_peer_persist_pending(),
            MessageBody::NonpagedChange { kind, change } => {
                if header.flags.contains(OperationFlags::SEQ_NUM) {
                    record.peer_seq_number = change.seq_number;
                }
                self.apply_peer_change(el, &mut record.data, kind, change);
            }
            other => {
                error!(object_id = el.object_id(), body = ?other, "unexpected non-paged message");
                self.stats.inc_protocol_error();
            }
        }
    }

    fn apply_peer_write(&self, el: &MetadataElement, dest: &mut [u8], write: NonpagedWrite) {
        let size = dest.len() as u64;
        if write.offset >= size {
            warn!(
                object_id = el.object_id(),
                offset = write.offset,
                size,
                "peer write starts past the local record, ignored"
            );
            return;
        }
        let start = write.offset as usize;
        let room = dest.len() - start;
        let n = write.data.len().min(room);
        if n < write.data.len() {
            warn!(
                object_id = el.object_id(),
                offset = write.offset,
                received = write.data.len(),
                applied = n,
                "peer write truncated to the local record size"
            );
            el.stats.inc_truncated();
        }
        dest[start..start + n].copy_from_slice(&write.data[..n]);
    }

    fn apply_peer_change(&self, el: &MetadataElement, dest: &mut [u8], kind: ChangeKind, change: NonpagedChange) {
        match kind {
            ChangeKind::SetBits | ChangeKind::ClearBits => {
                let span = (change.data.len() as u64).saturating_mul(change.repeat_count);
                if change.offset.saturating_add(span) > dest.len() as u64 {
                    warn!(
                        object_id = el.object_id(),
                        offset = change.offset,
                        span,
                        "peer bit change clamped to the local record size"
                    );
                    el.stats.inc_truncated();
                }
                apply_pattern(dest, kind, change.offset, &change.data, change.repeat_count);
            }
            ChangeKind::SetCheckpoint | ChangeKind::ForceSetCheckpoint | ChangeKind::IncrCheckpoint => {
                let Some(value) = change.checkpoint_value() else {
                    error!(object_id = el.object_id(), ?kind, "checkpoint change without a value");
                    self.stats.inc_protocol_error();
                    return;
                };
                match kind {
                    ChangeKind::SetCheckpoint => {
                        advance_checkpoint(dest, change.offset, value);
                        if change.second_offset != 0 {
                            advance_checkpoint(dest, change.second_offset, value);
                        }
                    }
                    ChangeKind::ForceSetCheckpoint => {
                        force_checkpoints(dest, change.offset, value, change.second_offset);
                    }
                    _ => {
                        increment_checkpoints(
                            dest,
                            change.offset,
                            value,
                            change.repeat_count,
                            change.second_offset,
                        );
                    }
                }
            }
        }
    }
}

/// Bumps the sequence number of a system object's record and flags the
/// update as carrying it.
fn stamp(el: &MetadataElement, record: &mut NonpagedRecord, mut flags: OperationFlags) -> (OperationFlags, u64) {
    if !el.config().is_system_object {
        return (flags, 0);
    }
    record.seq_number += 1;
    flags.insert(OperationFlags::SEQ_NUM);
    (flags, record.seq_number)
}

fn checked_range(data: &[u8], offset: u64, size: u64) -> MetadataResult<std::ops::Range<usize>> {
    let capacity = data.len() as u64;
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(offset as usize..end as usize),
        _ => Err(MetadataError::OutOfBounds {
            offset,
            size,
            capacity,
        }),
    }
}

/// Applies `pattern` at `offset + k * pattern.len()` for each repeat, stopping
/// at the end of `dest`.
fn apply_pattern(dest: &mut [u8], kind: ChangeKind, offset: u64, pattern: &[u8], repeat: u64) {
    if pattern.is_empty() {
        return;
    }
    let len = dest.len() as u64;
    let stride = pattern.len() as u64;
    for k in 0..repeat {
        let Some(start) = k.checked_mul(stride).and_then(|s| s.checked_add(offset)) else {
            return;
        };
        if start >= len {
            return;
        }
        let start = start as usize;
        for (byte, bits) in dest[start..].iter_mut().zip(pattern) {
            match kind {
                ChangeKind::ClearBits => *byte &= !bits,
                _ => *byte |= bits,
            }
        }
    }
}

fn read_checkpoint(data: &[u8], offset: u64) -> Option<u64> {
    let start = usize::try_from(offset).ok()?;
    let bytes: [u8; 8] = data.get(start..start.checked_add(8)?)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Stores `value`; a checkpoint not wholly inside `data` is skipped.
fn write_checkpoint(data: &mut [u8], offset: u64, value: u64) -> bool {
    let Ok(start) = usize::try_from(offset) else {
        return false;
    };
    let Some(slot) = start
        .checked_add(8)
        .and_then(|end| data.get_mut(start..end))
    else {
        return false;
    };
    slot.copy_from_slice(&value.to_le_bytes());
    true
}

fn advance_checkpoint(data: &mut [u8], offset: u64, value: u64) -> bool {
    match read_checkpoint(data, offset) {
        Some(current) if value > current => write_checkpoint(data, offset, value),
        _ => false,
    }
}

fn increment_checkpoint(data: &mut [u8], offset: u64, expected: u64, delta: u64) -> bool {
    match read_checkpoint(data, offset) {
        Some(current) if current == expected => {
            write_checkpoint(data, offset, current.wrapping_add(delta))
        }
        _ => false,
    }
}

/// Bounds of a checkpoint and its optional companion; zero means none.
fn checked_checkpoints(data: &[u8], offset: u64, second_offset: u64) -> MetadataResult<()> {
    checked_range(data, offset, CHECKPOINT_SIZE)?;
    if second_offset != 0 {
        checked_range(data, second_offset, CHECKPOINT_SIZE)?;
    }
    Ok(())
}

fn force_checkpoints(data: &mut [u8], offset: u64, value: u64, second_offset: u64) {
    write_checkpoint(data, offset, value);
    if second_offset != 0 {
        write_checkpoint(data, second_offset, value);
    }
}

/// Compare-and-increment of the first checkpoint; the companion moves by
/// the same delta from its own value when the first one did.
fn increment_checkpoints(data: &mut [u8], offset: u64, expected: u64, delta: u64, second_offset: u64) -> bool {
    if !increment_checkpoint(data, offset, expected, delta) {
        return false;
    }
    if second_offset != 0 {
        if let Some(current) = read_checkpoint(data, second_offset) {
            write_checkpoint(data, second_offset, current.wrapping_add(delta));
        }
    }
    true
}
