//! Property tests for `MessageStore` under arbitrary operation sequences.
//!
//! After every operation:
//! 1. the snapshot is ordered by timestamp,
//! 2. no two entries share a local key,
//! 3. entry and pending counts match a simple model of what was inserted,
//!    resolved, and rolled back.

use std::collections::HashSet;

use chatline::message::{LocalKey, Message};
use chatline::store::{FailurePolicy, MessageStore, StoreError};
use chatline_proto::message::{DeliveryStatus, MessageId, Timestamp};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Append(u64),
    Insert(u64),
    Resolve(usize),
    Rollback(usize),
    ResolveUnknown,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..50).prop_map(Op::Append),
        (0u64..50).prop_map(Op::Insert),
        any::<usize>().prop_map(Op::Resolve),
        any::<usize>().prop_map(Op::Rollback),
        Just(Op::ResolveUnknown),
    ]
}

fn arb_policy() -> impl Strategy<Value = FailurePolicy> {
    prop_oneof![Just(FailurePolicy::Remove), Just(FailurePolicy::MarkFailed)]
}

#[derive(Default)]
struct Model {
    next_key: u64,
    /// Keys handed out, in insertion order.
    issued: Vec<LocalKey>,
    pending: HashSet<LocalKey>,
    entries: usize,
    failed: usize,
}

fn assert_invariants(store: &MessageStore, model: &Model) -> Result<(), TestCaseError> {
    let snapshot: Vec<&Message> = store.snapshot().collect();
    prop_assert!(
        snapshot.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "snapshot out of order"
    );

    let mut keys = HashSet::new();
    for key in snapshot.iter().filter_map(|m| m.local_key) {
        prop_assert!(keys.insert(key), "duplicate key {key}");
    }

    prop_assert_eq!(snapshot.len(), model.entries);
    let pending = snapshot.iter().filter(|m| m.is_pending()).count();
    prop_assert_eq!(pending, model.pending.len());
    let failed = snapshot
        .iter()
        .filter(|m| m.status == DeliveryStatus::Failed)
        .count();
    prop_assert_eq!(failed, model.failed);
    Ok(())
}

proptest! {
    #[test]
    fn operation_sequences_preserve_invariants(
        policy in arb_policy(),
        ops in prop::collection::vec(arb_op(), 1..64),
    ) {
        let mut store = MessageStore::new(policy);
        let mut model = Model { next_key: 1, ..Model::default() };

        for op in ops {
            match op {
                Op::Append(ts) => {
                    let msg = Message::inbound("in".into(), Timestamp::from_millis(ts));
                    prop_assert!(store.append_confirmed(msg).is_ok());
                    model.entries += 1;
                }
                Op::Insert(ts) => {
                    let key = LocalKey::from_raw(model.next_key);
                    model.next_key += 1;
                    let msg = Message::pending(key, "out".into(), Timestamp::from_millis(ts));
                    prop_assert!(store.insert_pending(msg).is_ok());
                    model.issued.push(key);
                    model.pending.insert(key);
                    model.entries += 1;
                }
                Op::Resolve(pick) if !model.issued.is_empty() => {
                    let key = model.issued[pick % model.issued.len()];
                    let result = store.resolve_pending(key, MessageId::new(format!("m{}", key.as_raw())));
                    if model.pending.remove(&key) {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert_eq!(result, Err(StoreError::NotFound(key)));
                    }
                }
                Op::Rollback(pick) if !model.issued.is_empty() => {
                    let key = model.issued[pick % model.issued.len()];
                    let was_pending = model.pending.remove(&key);
                    prop_assert_eq!(store.rollback_pending(key), was_pending);
                    if was_pending {
                        match policy {
                            FailurePolicy::Remove => model.entries -= 1,
                            FailurePolicy::MarkFailed => model.failed += 1,
                        }
                    }
                }
                Op::Resolve(_) | Op::Rollback(_) => {}
                Op::ResolveUnknown => {
                    let key = LocalKey::from_raw(u64::MAX);
                    prop_assert_eq!(
                        store.resolve_pending(key, MessageId::new("ghost")),
                        Err(StoreError::NotFound(key))
                    );
                }
            }
            assert_invariants(&store, &model)?;
        }
    }

    #[test]
    fn load_orders_any_input(timestamps in prop::collection::vec(0u64..1000, 0..64)) {
        let mut store = MessageStore::new(FailurePolicy::Remove);
        let initial: Vec<Message> = timestamps
            .iter()
            .map(|&ts| Message::inbound(ts.to_string(), Timestamp::from_millis(ts)))
            .collect();
        prop_assert!(store.load(initial).is_ok());

        let loaded: Vec<u64> = store.snapshot().map(|m| m.timestamp.as_millis()).collect();
        let mut expected = timestamps;
        expected.sort_unstable();
        prop_assert_eq!(loaded, expected);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order(count in 1usize..32) {
        let mut store = MessageStore::new(FailurePolicy::Remove);
        for i in 0..count {
            let msg = Message::inbound(i.to_string(), Timestamp::from_millis(7));
            prop_assert!(store.append_confirmed(msg).is_ok());
        }
        let bodies: Vec<String> = store.snapshot().map(|m| m.body.clone()).collect();
        let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
        prop_assert_eq!(bodies, expected);
    }
}
