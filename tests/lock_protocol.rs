use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use treelock::primitives::concurrency::{LockRequest, LockStack, NodeLock};
use treelock::types::{LockPriority, Result, TreeError};

const NUM_THREADS: usize = 8;
const ROUNDS_PER_THREAD: usize = 300;

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn writers_exclude_everyone_and_readers_share() -> Result<()> {
    let lock = Arc::new(NodeLock::new(1, 4));
    // Positive: readers inside; -1: one writer inside.
    let inside = Arc::new(AtomicI64::new(0));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let lock = Arc::clone(&lock);
        let inside = Arc::clone(&inside);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let stack = LockStack::new();
            barrier.wait();
            for round in 0..ROUNDS_PER_THREAD {
                if (thread_id + round) % 3 == 0 {
                    let _w = lock.acquire(&stack, LockRequest::write())?;
                    assert_eq!(inside.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst), Ok(0));
                    thread::yield_now();
                    inside.store(0, Ordering::SeqCst);
                } else {
                    let _r = lock.acquire(&stack, LockRequest::read())?;
                    let before = inside.fetch_add(1, Ordering::SeqCst);
                    assert!(before >= 0, "reader entered while a writer was inside");
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }
            assert!(stack.is_clean());
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }
    let snap = lock.snapshot();
    assert_eq!(snap.readers, 0);
    assert_eq!(snap.waiters, 0);
    assert_eq!(snap.owners, 0);
    Ok(())
}

/// Locks taken in ascending id order run at low priority, locks against that
/// order at high priority. Any wait cycle then contains a low-priority owner
/// that gets signaled, so every thread finishes.
#[test]
fn random_two_node_acquisitions_never_deadlock() -> Result<()> {
    const NODES: u64 = 6;
    let locks: Arc<Vec<Arc<NodeLock>>> =
        Arc::new((0..NODES).map(|id| Arc::new(NodeLock::new(id, 4))).collect());
    let yields = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let locks = Arc::clone(&locks);
        let yields = Arc::clone(&yields);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let stack = LockStack::new();
            let mut rng = ChaCha8Rng::seed_from_u64(thread_id as u64);
            barrier.wait();
            let mut done = 0;
            while done < ROUNDS_PER_THREAD {
                let first = rng.gen_range(0..NODES);
                let mut second = rng.gen_range(0..NODES - 1);
                if second >= first {
                    second += 1;
                }
                let priority = if second < first { LockPriority::High } else { LockPriority::Low };
                let request = |write: bool| if write { LockRequest::write() } else { LockRequest::read() };

                let held = match locks[first as usize].acquire(&stack, request(rng.gen_bool(0.5))) {
                    Ok(handle) => handle,
                    Err(TreeError::Deadlock) => {
                        yields.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let next = locks[second as usize].acquire(&stack, request(rng.gen_bool(0.5)).priority(priority));
                match next {
                    Ok(handle) => {
                        thread::yield_now();
                        drop(handle);
                        drop(held);
                        done += 1;
                    }
                    Err(TreeError::Deadlock) => {
                        drop(held);
                        yields.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => return Err(err),
                }
                assert!(stack.is_clean());
                assert_eq!(stack.signaled(), 0);
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }
    for lock in locks.iter() {
        let snap = lock.snapshot();
        assert!(!lock.is_locked());
        assert_eq!(snap.hipri_owners, 0);
        assert_eq!(snap.hipri_requests, 0);
        assert_eq!(snap.waiters, 0);
    }
    Ok(())
}

#[test]
fn crossing_low_and_high_requests_resolve() -> Result<()> {
    let a = Arc::new(NodeLock::new(10, 4));
    let b = Arc::new(NodeLock::new(11, 4));
    let both_hold = Arc::new(Barrier::new(2));

    // Natural order: a then b, low priority. Retries from scratch on a yield.
    let low = {
        let (a, b, both_hold) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&both_hold));
        thread::spawn(move || -> Result<u32> {
            let stack = LockStack::new();
            let mut attempts = 0;
            let mut first_round = true;
            loop {
                attempts += 1;
                let held = a.acquire(&stack, LockRequest::write())?;
                if first_round {
                    both_hold.wait();
                    first_round = false;
                }
                match b.acquire(&stack, LockRequest::write()) {
                    Ok(_inner) => return Ok(attempts),
                    Err(TreeError::Deadlock) => {
                        drop(held);
                        thread::yield_now();
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    };

    // Against the order: holds b, then asks for a at high priority.
    let stack = LockStack::new();
    let held_b = b.acquire(&stack, LockRequest::write())?;
    both_hold.wait();
    let got_a = a.acquire(&stack, LockRequest::write().high_priority())?;
    assert_eq!(stack.priority(), LockPriority::High);
    drop(got_a);
    drop(held_b);

    let attempts = low.join().unwrap()?;
    assert!(attempts >= 2, "low-priority thread should have yielded once");
    assert!(!a.is_locked());
    assert!(!b.is_locked());
    Ok(())
}

#[test]
fn invalidated_lock_rejects_queued_and_new_requests() -> Result<()> {
    let lock = Arc::new(NodeLock::new(20, 4));
    let stack = LockStack::new();
    let held = lock.acquire(&stack, LockRequest::write())?;

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let stack = LockStack::new();
                lock.acquire(&stack, LockRequest::read()).map(|_| ())
            })
        })
        .collect();
    wait_until("queued readers", || lock.snapshot().waiters == 3);
    NodeLock::invalidate(held)?;
    for waiter in waiters {
        assert!(matches!(waiter.join().unwrap(), Err(TreeError::Invalid)));
    }
    assert!(lock.is_invalid());
    assert!(matches!(lock.acquire(&stack, LockRequest::read()), Err(TreeError::Invalid)));
    assert!(stack.is_clean());
    Ok(())
}
