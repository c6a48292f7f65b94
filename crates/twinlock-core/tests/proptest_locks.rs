//! Property-based tests for the stripe-lock queue on a single active node
//! and for the shadow pool.

mod common;

use proptest::prelude::*;
use std::sync::Arc;
use twinlock_cmi::{LockMode, StripeRegion};
use twinlock_core::{
    DomainConfig, ElementConfig, ElementState, LockDomain, LockOptions, LockStatus, LockTicket,
    ShadowPool, SliceState,
};

#[derive(Debug, Clone)]
enum Op {
    Lock { mode: LockMode, first: u64, len: u64 },
    Unlock { pick: usize },
}

fn any_mode() -> impl Strategy<Value = LockMode> {
    prop_oneof![Just(LockMode::Read), Just(LockMode::Write)]
}

/// Mostly single-slice requests, with the odd one spanning slices.
fn any_op() -> impl Strategy<Value = Op> {
    let len = prop_oneof![4 => 0u64..4, 1 => 4u64..40];
    prop_oneof![
        3 => (any_mode(), 0u64..96, len).prop_map(|(mode, first, len)| Op::Lock { mode, first, len }),
        2 => any::<usize>().prop_map(|pick| Op::Unlock { pick }),
    ]
}

/// One short lock in each of the first six slices, so the shards are
/// populated before any request spans slices and merges them.
fn shard_seed() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec((any_mode(), 0u64..14, 0u64..2), 6).prop_map(|locks| {
        locks
            .into_iter()
            .enumerate()
            .map(|(slice, (mode, offset, len))| Op::Lock {
                mode,
                first: slice as u64 * 16 + offset,
                len,
            })
            .collect()
    })
}

/// Active node without a peer; 16-stripe slices so multi-slice requests
/// show up often.
fn single_node() -> (Arc<LockDomain>, twinlock_cmi::ElementHandle) {
    twinlock_core::telemetry::init_test_tracing();
    let domain = LockDomain::new(DomainConfig {
        cpu_count: 1,
        max_peer_sl_per_cpu: 4,
        slice_table_size: 4,
        stripes_per_slice: 16,
        ..DomainConfig::default()
    })
    .unwrap();
    let handle = domain.register(ElementConfig::new(1)).unwrap();
    domain.set_state(handle, ElementState::Active).unwrap();
    (domain, handle)
}

fn check_no_conflicting_grants(domain: &LockDomain, handle: twinlock_cmi::ElementHandle) -> Result<(), TestCaseError> {
    let granted = domain.granted_locks(handle).unwrap();
    for (i, a) in granted.iter().enumerate() {
        for b in &granted[i + 1..] {
            let shared = a.mode == LockMode::Read && b.mode == LockMode::Read;
            prop_assert!(
                shared || !a.stripe.overlaps(&b.stripe),
                "conflicting grants {:?} and {:?}",
                a,
                b
            );
        }
    }
    Ok(())
}

/// Unlocks one granted ticket; returns false if none was granted.
fn unlock_one(domain: &LockDomain, tickets: &mut Vec<LockTicket>, pick: usize) -> Result<bool, TestCaseError> {
    let granted: Vec<usize> = tickets
        .iter_mut()
        .enumerate()
        .filter_map(|(i, t)| t.is_granted().then_some(i))
        .collect();
    if granted.is_empty() {
        return Ok(false);
    }
    let ticket = tickets.swap_remove(granted[pick % granted.len()]);
    let mut done = domain.unlock(ticket.element(), ticket.token()).unwrap();
    prop_assert_eq!(done.poll(), Some(LockStatus::Ok));
    Ok(true)
}

fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let (domain, handle) = single_node();
    let mut tickets: Vec<LockTicket> = Vec::new();

    for op in ops {
        match op {
            Op::Lock { mode, first, len } => {
                let region = StripeRegion::new(first, first + len);
                let ticket = domain.lock(handle, mode, region, LockOptions::default()).unwrap();
                tickets.push(ticket);
            }
            Op::Unlock { pick } => {
                unlock_one(&domain, &mut tickets, pick)?;
            }
        }
        check_no_conflicting_grants(&domain, handle)?;
    }

    while !tickets.is_empty() {
        prop_assert!(
            unlock_one(&domain, &mut tickets, 0)?,
            "{} requests left with no holder",
            tickets.len()
        );
        check_no_conflicting_grants(&domain, handle)?;
    }

    prop_assert!(domain.is_quiesced(handle).unwrap());
    prop_assert_eq!(domain.large_io_count(handle).unwrap(), 0);
    domain.run_worker();
    prop_assert!(!domain.is_hash_disabled(handle).unwrap());
    prop_assert_eq!(domain.shadow_pool_usage().0, 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Overlapping grants are always shared, and once every holder lets go
    /// each waiter is granted in turn until the element is idle again.
    #[test]
    fn test_no_conflicting_grants(ops in proptest::collection::vec(any_op(), 1..40)) {
        run_ops(ops)?;
    }

    /// Same, starting from populated shards so the hash is disabled while
    /// several slices hold locks.
    #[test]
    fn test_no_conflicting_grants_across_merged_shards(
        seed in shard_seed(),
        ops in proptest::collection::vec(any_op(), 1..40),
    ) {
        run_ops(seed.into_iter().chain(ops).collect())?;
    }

    /// Slots are never double-issued and every drop returns one.
    #[test]
    fn test_shadow_pool_conserves_slots(
        capacity in 1usize..16,
        steps in proptest::collection::vec(any::<bool>(), 1..64),
    ) {
        let pool = ShadowPool::new(capacity);
        let mut held = Vec::new();
        for take in steps {
            if take {
                match pool.acquire() {
                    Some(permit) => {
                        prop_assert!(held.len() < capacity);
                        prop_assert!(held.iter().all(|p: &twinlock_core::pool::ShadowPermit| p.slot() != permit.slot()));
                        held.push(permit);
                    }
                    None => prop_assert_eq!(held.len(), capacity),
                }
            } else {
                held.pop();
            }
            let (allocated, free) = pool.snapshot();
            prop_assert_eq!(allocated, held.len());
            prop_assert_eq!(allocated + free, capacity);
        }
        drop(held);
        prop_assert_eq!(pool.available(), capacity);
    }
}

/// Locks in two shards, then a request spanning slices merges them; the
/// repeated write must still find its earlier twin.
#[test]
fn test_repeat_write_after_shards_merge() {
    let w = |first: u64, last: u64| Op::Lock { mode: LockMode::Write, first, len: last - first };
    let ops = vec![w(0, 1), w(16, 17), w(40, 60), w(16, 17)];
    run_ops(ops).unwrap();
}

/// A peer write that collides with nothing leaves no shadow behind; after
/// peer loss the data locks are released and the slice comes home.
#[test]
fn test_uncontended_peer_grant_then_peer_loss() -> anyhow::Result<()> {
    let nodes = common::TwoNodes::new();
    let pair = nodes.register(ElementConfig::new(4));
    let mut remote = nodes.passive.lock(
        pair.passive,
        LockMode::Write,
        StripeRegion::new(10, 20),
        LockOptions::default(),
    )?;
    nodes.settle();
    assert_eq!(remote.status(), LockStatus::Ok);
    assert!(nodes.active.is_quiesced(pair.active)?);
    assert_eq!(nodes.active.slice_state(pair.active, 10)?, SliceState::ExclusivePeer);

    nodes.lose_passive();
    nodes.active.peer_lost(pair.active)?;
    assert!(nodes.active.is_quiesced(pair.active)?);
    nodes.active.release_peer_data_stripe_locks(pair.active)?;
    assert_eq!(nodes.active.slice_state(pair.active, 10)?, SliceState::ExclusiveLocal);

    let mut local = nodes.active.lock(
        pair.active,
        LockMode::Write,
        StripeRegion::new(10, 20),
        LockOptions::default(),
    )?;
    assert_eq!(local.status(), LockStatus::Ok);
    assert_eq!(nodes.pools().0 .0, 0);
    Ok(())
}
