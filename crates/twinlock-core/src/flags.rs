//! Typed flag sets.
//!
//! Element attributes are many independent booleans that several threads flip
//! concurrently, so they live in one atomic word behind named accessors.
//! Request flags are only touched under the owning shard lock and are plain
//! bit sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            /// No flags set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Raw bits.
            pub const fn bits(&self) -> u32 {
                self.0
            }

            /// Returns true if every bit of `other` is set.
            pub const fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            /// Returns true if any bit of `other` is set.
            pub const fn intersects(&self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }

            /// Sets the bits of `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears the bits of `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Sets or clears the bits of `other`.
            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }

            const NAMES: &'static [(&'static str, u32)] = &[$((stringify!($flag), $value)),*];
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let names: Vec<&str> = Self::NAMES
                    .iter()
                    .filter(|(_, bit)| self.0 & bit != 0)
                    .map(|(name, _)| *name)
                    .collect();
                write!(f, "{}({})", stringify!($name), names.join("|"))
            }
        }
    };
}

flag_set! {
    /// Public flags of a lock request.
    RequestFlags {
        /// Request originated on this node.
        LOCAL_REQUEST = 0x0001;
        /// Shadow of a request that originated on the peer.
        PEER_REQUEST = 0x0002;
        /// Peer request granted locally; a grant message is owed.
        GRANT = 0x0004;
        /// Grant message has been built for this peer request.
        GRANTED = 0x0008;
        /// Request was pulled from the queue to break a cross-node deadlock.
        DEAD_LOCK = 0x0010;
        /// Local grant blocked by peer slice ownership.
        PEER_COLLISION = 0x0020;
        /// A cross-node request is in flight for this request.
        WAITING_FOR_PEER = 0x0040;
        /// Version-0 peer request covering a full slice.
        FULL_SLOT = 0x0080;
        /// A peer request is parked behind this request.
        HOLDING_PEER = 0x0100;
        /// Held until the write log is flushed after peer loss.
        PEER_LOST = 0x0200;
        /// Caller reads immediate outcomes from the return value.
        SYNC_MODE = 0x0400;
    }
}

flag_set! {
    /// Engine-private request state.
    PrivateFlags {
        /// Shared access.
        READ = 0x01;
        /// Lock operation in progress.
        PENDING = 0x02;
        /// Request won its place in the local queue.
        LOCAL_GRANT = 0x04;
        /// Range spans slices; counted in the large-I/O counter.
        LARGE = 0x08;
        /// Non-paged metadata lock.
        NP = 0x10;
        /// Paged metadata lock.
        PAGED = 0x20;
    }
}

flag_set! {
    /// Element attribute bits.
    ElementAttr {
        /// Shards are merged into the global queue.
        SL_HASH_DISABLED = 0x0001;
        /// Abort stripe locks except non-paged ones.
        ABORT_STRIPE_LOCKS = 0x0002;
        /// Abort every stripe lock; the element is being destroyed.
        DESTROY_ABORT_STRIPE_LOCKS = 0x0004;
        /// A non-paged request is outstanding.
        NONPAGED_REQUEST_PENDING = 0x0008;
        /// Aborted requests were completed since the last restart.
        ABORTED_REQUESTS_PRESENT = 0x0010;
        /// The peer element is gone.
        PEER_DEAD = 0x0020;
        /// Do not replicate to the peer.
        CMI_DISABLED = 0x0040;
        /// The peer has an unpersisted write.
        PEER_PERSIST_PENDING = 0x0080;
        /// Peer lost; data locks held for write-log flush.
        SL_PEER_LOST = 0x0100;
        /// Abort monitor-initiated data locks.
        ABORT_MONITOR_OPS = 0x0200;
        /// An inbound message is being processed.
        CMI_MSG_PROCESSING = 0x0400;
    }
}

/// Atomically updated [`ElementAttr`] word.
#[derive(Default)]
pub struct ElementAttributes {
    bits: AtomicU32,
}

macro_rules! attribute_accessors {
    ($( $attr:ident => $is:ident, $set:ident, $clear:ident; )*) => {
        $(
            #[doc = concat!("Returns true if `", stringify!($attr), "` is set.")]
            pub fn $is(&self) -> bool {
                self.contains(ElementAttr::$attr)
            }

            #[doc = concat!("Sets `", stringify!($attr), "`.")]
            pub fn $set(&self) {
                self.set(ElementAttr::$attr)
            }

            #[doc = concat!("Clears `", stringify!($attr), "`.")]
            pub fn $clear(&self) {
                self.clear(ElementAttr::$attr)
            }
        )*
    };
}

impl ElementAttributes {
    /// Creates an empty attribute word.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attributes.
    pub fn load(&self) -> ElementAttr {
        ElementAttr(self.bits.load(Ordering::Acquire))
    }

    /// Returns true if every bit of `attr` is set.
    pub fn contains(&self, attr: ElementAttr) -> bool {
        self.load().contains(attr)
    }

    /// Returns true if any bit of `attr` is set.
    pub fn intersects(&self, attr: ElementAttr) -> bool {
        self.load().intersects(attr)
    }

    /// Sets `attr`.
    pub fn set(&self, attr: ElementAttr) {
        self.bits.fetch_or(attr.bits(), Ordering::AcqRel);
    }

    /// Clears `attr`.
    pub fn clear(&self, attr: ElementAttr) {
        self.bits.fetch_and(!attr.bits(), Ordering::AcqRel);
    }

    attribute_accessors! {
        SL_HASH_DISABLED => is_hash_disabled, set_hash_disabled, clear_hash_disabled;
        ABORT_STRIPE_LOCKS => is_abort, set_abort, clear_abort;
        DESTROY_ABORT_STRIPE_LOCKS => is_destroy_abort, set_destroy_abort, clear_destroy_abort;
        NONPAGED_REQUEST_PENDING => is_nonpaged_request_pending, set_nonpaged_request_pending, clear_nonpaged_request_pending;
        ABORTED_REQUESTS_PRESENT => is_aborted_requests_present, set_aborted_requests_present, clear_aborted_requests_present;
        PEER_DEAD => is_peer_dead, set_peer_dead, clear_peer_dead;
        CMI_DISABLED => is_cmi_disabled, set_cmi_disabled, clear_cmi_disabled;
        PEER_PERSIST_PENDING => is_peer_persist_pending, set_peer_persist_pending, clear_peer_persist_pending;
        SL_PEER_LOST => is_sl_peer_lost, set_sl_peer_lost, clear_sl_peer_lost;
        ABORT_MONITOR_OPS => is_abort_monitor_ops, set_abort_monitor_ops, clear_abort_monitor_ops;
        CMI_MSG_PROCESSING => is_cmi_msg_processing, set_cmi_msg_processing, clear_cmi_msg_processing;
    }
}

impl fmt::Debug for ElementAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
