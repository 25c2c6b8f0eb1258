use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use treelock::primitives::concurrency::{LockHandle, LockRequest, LockStack, NodeLock};
use treelock::storage::tree::{
    BlockStore, Item, ItemBody, MemStore, SortedLayout, WalkControl, WalkDirection, WalkItem,
    WalkStart,
};
use treelock::types::{Key, LockPriority, LEAF_LEVEL};
use treelock::{Tree, TreeOptions};

type Model = BTreeMap<Key, VecDeque<u64>>;

#[derive(Debug, Clone)]
enum TreeOp {
    Insert(Key),
    Delete(Key),
    Get(Key),
}

fn arb_key() -> impl Strategy<Value = Key> {
    (0u64..3, 0u64..8).prop_map(|(object, offset)| Key::new(object, offset))
}

fn arb_tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        5 => arb_key().prop_map(TreeOp::Insert),
        2 => arb_key().prop_map(TreeOp::Delete),
        2 => arb_key().prop_map(TreeOp::Get),
    ]
}

fn new_tree(capacity: usize, cache_slots: usize) -> Tree {
    let store: Arc<dyn BlockStore> = Arc::new(MemStore::new(1 << 14));
    let options = TreeOptions::default()
        .node_capacity(capacity)
        .cache_slots(cache_slots);
    Tree::create(store, Arc::new(SortedLayout), options).unwrap()
}

fn sequence_of(item: &Item) -> u64 {
    match &item.body {
        ItemBody::Data(bytes) => u64::from_le_bytes(bytes[..8].try_into().unwrap()),
        other => panic!("unexpected leaf body {other:?}"),
    }
}

/// Applies `ops` to both the tree and the model, checking every answer.
fn run_ops(tree: &Tree, ops: &[TreeOp]) -> Result<Model, TestCaseError> {
    let stack = LockStack::new();
    let mut model = Model::new();
    for (seq, op) in ops.iter().enumerate() {
        match op {
            TreeOp::Insert(key) => {
                tree.insert(&stack, Item::data(*key, (seq as u64).to_le_bytes().to_vec()))
                    .unwrap();
                model.entry(*key).or_default().push_back(seq as u64);
            }
            TreeOp::Delete(key) => {
                let removed = tree.delete(&stack, key).unwrap().map(|item| sequence_of(&item));
                let expected = model.get_mut(key).and_then(|dups| dups.pop_front());
                if model.get(key).map_or(false, |dups| dups.is_empty()) {
                    model.remove(key);
                }
                prop_assert_eq!(removed, expected, "delete {}", key);
            }
            TreeOp::Get(key) => {
                let found = tree.get(&stack, key).unwrap().map(|item| sequence_of(&item));
                let expected = model.get(key).and_then(|dups| dups.front().copied());
                prop_assert_eq!(found, expected, "get {}", key);
            }
        }
        prop_assert!(stack.is_clean());
    }
    Ok(model)
}

fn walk_leaves(tree: &Tree, start: WalkStart, direction: WalkDirection) -> Vec<(Key, u64)> {
    let stack = LockStack::new();
    let mut seen = Vec::new();
    let mut visitor = |item: &WalkItem<'_>| -> treelock::Result<WalkControl> {
        if item.level == LEAF_LEVEL {
            seen.push((item.item.key, sequence_of(item.item)));
        }
        Ok(WalkControl::Continue)
    };
    tree.walk(&stack, start, direction, &mut visitor).unwrap();
    seen
}

fn flatten<'a>(entries: impl Iterator<Item = (&'a Key, &'a VecDeque<u64>)>) -> Vec<(Key, u64)> {
    entries
        .flat_map(|(key, dups)| dups.iter().map(move |seq| (*key, *seq)))
        .collect()
}

#[derive(Debug, Clone)]
enum LockOp {
    TryLock { node: usize, write: bool, high: bool },
    SetPriority(bool),
    Release(usize),
    HighWaiter(usize),
}

const LOCKS: usize = 3;

fn arb_lock_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        4 => (0..LOCKS, any::<bool>(), any::<bool>())
            .prop_map(|(node, write, high)| LockOp::TryLock { node, write, high }),
        2 => any::<bool>().prop_map(LockOp::SetPriority),
        2 => (0usize..8).prop_map(LockOp::Release),
        2 => (0..LOCKS).prop_map(LockOp::HighWaiter),
    ]
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "helper thread never queued");
        thread::sleep(Duration::from_micros(200));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_tree_matches_model(
        ops in prop::collection::vec(arb_tree_op(), 1..150),
        capacity in 3usize..6,
        cache_slots in 0usize..4,
    ) {
        let tree = new_tree(capacity, cache_slots);
        let model = run_ops(&tree, &ops)?;

        let expected = flatten(model.iter());
        prop_assert_eq!(walk_leaves(&tree, WalkStart::Edge, WalkDirection::Rightward), expected.clone());
        let mut reversed = expected;
        reversed.reverse();
        prop_assert_eq!(walk_leaves(&tree, WalkStart::Edge, WalkDirection::Leftward), reversed);
        prop_assert!(tree.check_links().is_ok());
    }

    #[test]
    fn prop_walk_from_key_matches_model(
        ops in prop::collection::vec(arb_tree_op(), 1..120),
        start in arb_key(),
    ) {
        let tree = new_tree(4, 2);
        let model = run_ops(&tree, &ops)?;

        let expected = flatten(model.range(start..));
        let walked = walk_leaves(&tree, WalkStart::Key(start), WalkDirection::Rightward);
        prop_assert_eq!(walked, expected);
    }

    #[test]
    fn prop_signal_counter_matches_signaled_handles(
        ops in prop::collection::vec(arb_lock_op(), 1..40),
    ) {
        let locks: Vec<Arc<NodeLock>> = (0..LOCKS as u64).map(|id| Arc::new(NodeLock::new(id, 4))).collect();
        let stack = LockStack::new();
        let mut held: Vec<LockHandle> = Vec::new();
        let mut helpers = Vec::new();

        for op in ops {
            match op {
                LockOp::TryLock { node, write, high } => {
                    let request = if write { LockRequest::write() } else { LockRequest::read() };
                    let request = if high { request.high_priority() } else { request };
                    if let Ok(handle) = locks[node].acquire(&stack, request.try_lock()) {
                        held.push(handle);
                    }
                }
                LockOp::SetPriority(high) => {
                    stack.set_priority(if high { LockPriority::High } else { LockPriority::Low });
                }
                LockOp::Release(idx) => {
                    if !held.is_empty() {
                        let handle = held.remove(idx % held.len());
                        handle.release();
                    }
                }
                LockOp::HighWaiter(node) => {
                    let lock = Arc::clone(&locks[node]);
                    let waiters_before = lock.snapshot().waiters;
                    let done = Arc::new(AtomicBool::new(false));
                    let finished = Arc::clone(&done);
                    let waiter = Arc::clone(&lock);
                    helpers.push(thread::spawn(move || {
                        let helper = LockStack::new();
                        let outcome = waiter.acquire(&helper, LockRequest::write().high_priority()).map(drop);
                        finished.store(true, Ordering::Release);
                        outcome
                    }));
                    wait_for(|| done.load(Ordering::Acquire) || lock.snapshot().waiters > waiters_before);
                }
            }
            prop_assert_eq!(stack.signaled(), stack.signaled_handles());
            if stack.priority() == LockPriority::High {
                prop_assert_eq!(stack.signaled(), 0);
            }
        }

        held.clear();
        for helper in helpers {
            prop_assert!(helper.join().unwrap().is_ok());
        }
        prop_assert_eq!(stack.signaled(), 0);
        prop_assert!(stack.is_clean());
        for lock in &locks {
            prop_assert!(!lock.is_locked());
            prop_assert_eq!(lock.snapshot().hipri_requests, 0);
        }
    }
}
