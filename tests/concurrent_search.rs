use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use treelock::storage::tree::{
    BlockStore, Item, MemStore, ObjectRange, SearchRequest, SortedLayout, WalkControl,
    WalkDirection, WalkItem, WalkStart,
};
use treelock::primitives::concurrency::LockStack;
use treelock::types::{Key, LockMode, LEAF_LEVEL};
use treelock::{Result, Tree, TreeOptions};

const STABLE_KEYS: u64 = 300;
const WRITERS: usize = 3;
const INSERTS_PER_WRITER: u64 = 400;

fn payload(key: Key) -> Vec<u8> {
    key.offset.to_le_bytes().to_vec()
}

fn small_tree() -> Result<Arc<Tree>> {
    let store: Arc<dyn BlockStore> = Arc::new(MemStore::new(1 << 16));
    let options = TreeOptions::default().node_capacity(4).cache_slots(8);
    Ok(Arc::new(Tree::create(store, Arc::new(SortedLayout), options)?))
}

/// Fills object 0 with even offsets, in shuffled order.
fn prefill(tree: &Tree, seed: u64) -> Result<Vec<Key>> {
    let mut keys: Vec<Key> = (0..STABLE_KEYS).map(|i| Key::new(0, i * 2)).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let stack = LockStack::new();
    for key in &keys {
        tree.insert(&stack, Item::data(*key, payload(*key)))?;
    }
    keys.sort();
    Ok(keys)
}

fn leaf_keys(tree: &Tree, direction: WalkDirection) -> Result<Vec<Key>> {
    let stack = LockStack::new();
    let mut keys = Vec::new();
    let mut visitor = |item: &WalkItem<'_>| -> Result<WalkControl> {
        if item.level == LEAF_LEVEL {
            keys.push(item.item.key);
        }
        Ok(WalkControl::Continue)
    };
    tree.walk(&stack, WalkStart::Edge, direction, &mut visitor)?;
    Ok(keys)
}

/// Writer `id` inserts unique keys spread over objects 0..4 (odd offsets in
/// object 0, so they never collide with the stable keys).
fn spawn_writers(tree: &Arc<Tree>, barrier: &Arc<Barrier>) -> Vec<thread::JoinHandle<Result<()>>> {
    (0..WRITERS)
        .map(|id| {
            let tree = Arc::clone(tree);
            let barrier = Arc::clone(barrier);
            thread::spawn(move || -> Result<()> {
                let stack = LockStack::new();
                let mut rng = ChaCha8Rng::seed_from_u64(100 + id as u64);
                barrier.wait();
                for i in 0..INSERTS_PER_WRITER {
                    let offset = (id as u64 * INSERTS_PER_WRITER + i) * 2 + 1;
                    let key = Key::new(rng.gen_range(0..4), offset);
                    tree.insert(&stack, Item::data(key, payload(key)))?;
                    assert!(stack.is_clean());
                }
                Ok(())
            })
        })
        .collect()
}

#[test]
fn readers_find_stable_keys_while_writers_split() -> Result<()> {
    let tree = small_tree()?;
    let stable = Arc::new(prefill(&tree, 1)?);
    let height_before = tree.height();
    let barrier = Arc::new(Barrier::new(WRITERS + 4));
    let writers = spawn_writers(&tree, &barrier);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|id| {
            let tree = Arc::clone(&tree);
            let stable = Arc::clone(&stable);
            let barrier = Arc::clone(&barrier);
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<u64> {
                let stack = LockStack::new();
                let mut rng = ChaCha8Rng::seed_from_u64(200 + id);
                let mut lookups = 0;
                barrier.wait();
                while !stop.load(Ordering::Acquire) || lookups < 200 {
                    let key = stable[rng.gen_range(0..stable.len())];
                    let item = tree.get(&stack, &key)?;
                    assert_eq!(item.map(|item| item.key), Some(key), "stable key {key} vanished");
                    assert!(stack.is_clean());
                    lookups += 1;
                }
                Ok(lookups)
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap()?;
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap()? >= 200);
    }

    assert!(tree.height() >= height_before);
    assert!(tree.stats().snapshot().splits > 0);
    let keys = leaf_keys(&tree, WalkDirection::Rightward)?;
    assert_eq!(keys.len() as u64, STABLE_KEYS + WRITERS as u64 * INSERTS_PER_WRITER);
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    tree.check_links()?;
    Ok(())
}

#[test]
fn walkers_see_each_key_once_during_inserts() -> Result<()> {
    let tree = small_tree()?;
    let stable = Arc::new(prefill(&tree, 2)?);
    let barrier = Arc::new(Barrier::new(WRITERS + 2));
    let writers = spawn_writers(&tree, &barrier);
    let stop = Arc::new(AtomicBool::new(false));

    let walkers: Vec<_> = [WalkDirection::Rightward, WalkDirection::Leftward]
        .into_iter()
        .map(|direction| {
            let tree = Arc::clone(&tree);
            let stable = Arc::clone(&stable);
            let barrier = Arc::clone(&barrier);
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<u32> {
                let mut walks = 0;
                barrier.wait();
                while !stop.load(Ordering::Acquire) || walks < 3 {
                    let keys = leaf_keys(&tree, direction)?;
                    let ordered = keys.windows(2).all(|pair| match direction {
                        WalkDirection::Rightward => pair[0] < pair[1],
                        WalkDirection::Leftward => pair[0] > pair[1],
                    });
                    assert!(ordered, "{direction:?} walk out of order or repeated a key");
                    let seen: BTreeSet<Key> = keys.into_iter().collect();
                    assert!(stable.iter().all(|key| seen.contains(key)), "walk skipped a stable key");
                    walks += 1;
                }
                Ok(walks)
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap()?;
    }
    stop.store(true, Ordering::Release);
    for walker in walkers {
        assert!(walker.join().unwrap()? >= 3);
    }
    tree.check_links()?;
    Ok(())
}

#[test]
fn deleters_and_readers_share_the_tree() -> Result<()> {
    let tree = small_tree()?;
    let stable = Arc::new(prefill(&tree, 3)?);
    let stack = LockStack::new();
    let victims: Vec<Key> = (0..STABLE_KEYS).map(|i| Key::new(1, i)).collect();
    for key in &victims {
        tree.insert(&stack, Item::data(*key, payload(*key)))?;
    }

    let barrier = Arc::new(Barrier::new(4));
    let deleters: Vec<_> = victims
        .chunks(victims.len() / 2)
        .map(|chunk| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            let mut chunk = chunk.to_vec();
            thread::spawn(move || -> Result<()> {
                let stack = LockStack::new();
                let seed = chunk.len() as u64;
                chunk.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
                barrier.wait();
                for key in chunk {
                    let removed = tree.delete(&stack, &key)?;
                    assert_eq!(removed.map(|item| item.key), Some(key));
                }
                Ok(())
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|id| {
            let tree = Arc::clone(&tree);
            let stable = Arc::clone(&stable);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                let stack = LockStack::new();
                let mut rng = ChaCha8Rng::seed_from_u64(300 + id);
                barrier.wait();
                for _ in 0..1_000 {
                    let key = stable[rng.gen_range(0..stable.len())];
                    assert!(tree.get(&stack, &key)?.is_some(), "stable key {key} vanished");
                }
                Ok(())
            })
        })
        .collect();

    for handle in deleters.into_iter().chain(readers) {
        handle.join().unwrap()?;
    }
    for key in &victims {
        assert!(tree.get(&stack, key)?.is_none());
    }
    assert_eq!(leaf_keys(&tree, WalkDirection::Rightward)?, *stable);
    tree.check_links()?;
    Ok(())
}

#[test]
fn virtual_root_searches_survive_splits() -> Result<()> {
    let tree = small_tree()?;
    let stable = Arc::new(prefill(&tree, 4)?);
    let object = Arc::new(ObjectRange::object(0));
    let barrier = Arc::new(Barrier::new(WRITERS + 3));
    let writers = spawn_writers(&tree, &barrier);

    let searchers: Vec<_> = (0..3)
        .map(|id| {
            let tree = Arc::clone(&tree);
            let stable = Arc::clone(&stable);
            let object = Arc::clone(&object);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                let stack = LockStack::new();
                let mut rng = ChaCha8Rng::seed_from_u64(400 + id);
                barrier.wait();
                for _ in 0..600 {
                    let key = stable[rng.gen_range(0..stable.len())];
                    let request = SearchRequest::new(key, LockMode::Read).object(&object);
                    let found = tree.search_by_key(&stack, &request)?;
                    assert!(found.is_found(), "object search lost {key}");
                    assert_eq!(found.item().map(|item| item.key), Some(key));
                    drop(found);
                    assert!(stack.is_clean());
                }
                Ok(())
            })
        })
        .collect();

    for handle in writers.into_iter().chain(searchers) {
        handle.join().unwrap()?;
    }
    assert!(object.vroot().is_some());
    tree.check_links()?;
    Ok(())
}
