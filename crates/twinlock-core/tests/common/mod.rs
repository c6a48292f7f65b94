//! Two-node fixture: an active and a passive lock domain joined by a
//! loopback link, stepped deterministically.

#![allow(dead_code)]

use std::sync::Arc;
use twinlock_cmi::{ElementHandle, LoopbackLink};
use twinlock_core::telemetry::init_test_tracing;
use twinlock_core::{DomainConfig, ElementConfig, ElementState, LockDomain};

/// Link side of the active node.
pub const ACTIVE_SIDE: usize = 0;
/// Link side of the passive node.
pub const PASSIVE_SIDE: usize = 1;

/// Small pool, default slice geometry.
pub fn test_config() -> DomainConfig {
    DomainConfig {
        cpu_count: 2,
        max_peer_sl_per_cpu: 8,
        slice_table_size: 8,
        ..DomainConfig::default()
    }
}

pub struct TwoNodes {
    pub link: LoopbackLink,
    pub active: Arc<LockDomain>,
    pub passive: Arc<LockDomain>,
}

/// Element handles for one object on both nodes.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub active: ElementHandle,
    pub passive: ElementHandle,
}

impl TwoNodes {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DomainConfig) -> Self {
        init_test_tracing();
        let (link, a, b) = LoopbackLink::pair();
        let active = LockDomain::new(config.clone()).unwrap();
        let passive = LockDomain::new(config).unwrap();
        a.attach(active.cmi_client());
        b.attach(passive.cmi_client());
        active.attach_transport(Arc::new(a));
        passive.attach_transport(Arc::new(b));
        Self {
            link,
            active,
            passive,
        }
    }

    /// Registers `config` on both nodes, assigns roles, starts peer traffic
    /// and lets the handle exchange finish.
    pub fn register(&self, config: ElementConfig) -> Pair {
        self.register_split(config.clone(), config)
    }

    /// Like [`register`](Self::register) with a different record layout per node.
    pub fn register_split(&self, active: ElementConfig, passive: ElementConfig) -> Pair {
        let a = self.active.register(active).unwrap();
        self.active.set_state(a, ElementState::Active).unwrap();
        self.active.stripe_lock_start(a).unwrap();
        let p = self.passive.register(passive).unwrap();
        self.passive.set_state(p, ElementState::Passive).unwrap();
        self.passive.stripe_lock_start(p).unwrap();
        self.settle();
        Pair {
            active: a,
            passive: p,
        }
    }

    /// Pumps the link and runs both workers until nothing moves.
    /// Returns the number of steps taken.
    pub fn settle(&self) -> usize {
        let mut total = 0;
        for _ in 0..256 {
            let moved =
                self.link.pump() + self.active.run_worker() + self.passive.run_worker();
            if moved == 0 {
                break;
            }
            total += moved;
        }
        total
    }

    /// Takes the passive side down; the active node sees contact loss.
    pub fn lose_passive(&self) {
        self.link.fail_side(PASSIVE_SIDE);
    }

    /// Takes the active side down; the passive node sees contact loss.
    pub fn lose_active(&self) {
        self.link.fail_side(ACTIVE_SIDE);
    }

    /// `(allocated, free)` shadows on each node.
    pub fn pools(&self) -> ((usize, usize), (usize, usize)) {
        (
            self.active.shadow_pool_usage(),
            self.passive.shadow_pool_usage(),
        )
    }

    /// True when neither node holds a shadow.
    pub fn pools_idle(&self) -> bool {
        let ((a, _), (p, _)) = self.pools();
        a == 0 && p == 0
    }
}
