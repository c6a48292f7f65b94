//! Opaque, locally validated handles exchanged between nodes.
//!
//! A node never dereferences what its peer sends. Element handles are
//! generation-stamped slots in the receiver's registry and request tokens name
//! a lock request by id plus the stripe that routes it to its shard; both are
//! checked against local state before use.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the storage object an element guards.
pub type ObjectId = u32;

/// Generation-stamped index into a node's element registry.
///
/// Generation zero is reserved for the null handle, so a freshly zeroed handle
/// never resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ElementHandle {
    index: u32,
    generation: u32,
}

impl ElementHandle {
    /// Handle that refers to nothing.
    pub const NULL: ElementHandle = ElementHandle {
        index: 0,
        generation: 0,
    };

    /// Builds a handle from a slot index and generation.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the owning registry.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true for the null handle.
    pub fn is_null(&self) -> bool {
        self.generation == 0
    }
}

impl fmt::Debug for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ElementHandle(null)")
        } else {
            write!(f, "ElementHandle({}v{})", self.index, self.generation)
        }
    }
}

/// Names one lock request on the node that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken {
    /// Request id, unique within the issuing node.
    pub id: u64,
    /// First stripe of the request; selects the shard holding it.
    pub first: u64,
}

impl RequestToken {
    /// Builds a token.
    pub fn new(id: u64, first: u64) -> Self {
        Self { id, first }
    }
}
