#![warn(missing_docs)]

//! Twinlock core: dual-node stripe-range locking and non-paged metadata
//! replication for an active/passive controller pair.
//!
//! A [`LockDomain`] owns the element registry, the peer shadow pool and the
//! blob worker. Elements are registered per protected object; stripe locks
//! are taken through [`LockDomain::lock`] and non-paged records are mutated
//! through the replicating operations in [`nonpaged`].

mod blob;
mod cmi_dispatch;
pub mod completion;
pub mod config;
pub mod domain;
mod element;
pub mod error;
pub mod flags;
pub mod nonpaged;
mod peer;
pub mod pool;
mod queue;
mod registry;
pub mod request;
mod slice;
pub mod stats;
pub mod stripe_lock;
pub mod telemetry;
mod worker;

pub use completion::{CancelToken, Completion};
pub use config::{DomainConfig, ElementConfig};
pub use domain::LockDomain;
pub use element::ElementState;
pub use error::{MetadataError, MetadataResult};
pub use flags::{ElementAttr, RequestFlags};
pub use nonpaged::ReplicationOutcome;
pub use pool::ShadowPool;
pub use request::{LockClass, LockOpcode, LockOptions, LockStatus, LockTicket, RequestId};
pub use slice::SliceState;
pub use stats::{DomainStatsSnapshot, ElementStatsSnapshot};
pub use stripe_lock::GrantedLock;
