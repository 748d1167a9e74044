//! Sequence and concurrent runner admission properties, plus named-runner
//! registry sharing semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use taskpool::{Config, ErrorCode, Payload, Priority, TaskPool};

fn pool_with_workers(n: usize) -> TaskPool {
    let config = Config::builder()
        .min_workers(n)
        .max_workers(n)
        .balance_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    TaskPool::with_config(config).unwrap()
}

#[test]
fn test_sequence_completion_order_equals_submission_order() {
    // Plenty of workers: ordering must come from the runner, not the pool.
    let pool = pool_with_workers(4);
    let runner = pool.sequence_runner(Priority::Medium);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..6)
        .map(|n| {
            let order = Arc::clone(&order);
            runner.execute(move |_| {
                // Give later submissions a chance to overtake if the runner
                // ever let them through.
                std::thread::sleep(Duration::from_millis(5));
                order.lock().push(n);
                Ok(Box::new(()) as Payload)
            })
        })
        .collect();

    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(*order.lock(), (0..6).collect::<Vec<_>>());
}

#[test]
fn test_sequence_at_most_one_in_flight() {
    let pool = pool_with_workers(4);
    let runner = pool.sequence_runner(Priority::Medium);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            runner.execute(move |_| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(3));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Box::new(()) as Payload)
            })
        })
        .collect();

    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sequence_continues_after_a_failure() {
    let pool = pool_with_workers(2);
    let runner = pool.sequence_runner(Priority::Medium);

    let first = runner.execute(|_| Err(taskpool::Error::task_failed("first fails")));
    let second = runner.execute(|_| Ok(Box::new(2i32) as Payload));

    assert!(first.wait().is_err());
    assert_eq!(*second.wait().unwrap().downcast::<i32>().unwrap(), 2);
}

#[test]
fn test_sequence_cancel_waiting_promotes_next() {
    let pool = pool_with_workers(2);
    let runner = pool.sequence_runner(Priority::Medium);

    let (gate_tx, gate_rx) = unbounded::<()>();
    let first = runner.execute(move |_| {
        let _ = gate_rx.recv();
        Ok(Box::new(()) as Payload)
    });
    let second = runner.execute(|_| Ok(Box::new(()) as Payload));
    let third = runner.execute(|_| Ok(Box::new(()) as Payload));

    // Second is pending inside the runner; cancel removes it without
    // disturbing the rest of the sequence.
    pool.cancel(second.id());
    assert_eq!(
        second.wait().unwrap_err().code(),
        Some(ErrorCode::Canceled)
    );

    gate_tx.send(()).unwrap();
    first.wait().unwrap();
    third.wait().unwrap();
}

#[test]
fn test_concurrent_runner_caps_parallelism() {
    let pool = pool_with_workers(4);
    let runner = pool.concurrent_runner(2, 0).unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            runner.execute(move |_| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Box::new(()) as Payload)
            })
        })
        .collect();

    for handle in handles {
        handle.wait().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_concurrent_overflow_discards_oldest_waiter() {
    let pool = pool_with_workers(4);
    // 2 running slots, 1 waiting slot.
    let runner = pool.concurrent_runner(2, 1).unwrap();

    let (gate_tx, gate_rx) = unbounded::<()>();
    let mut running = Vec::new();
    for _ in 0..2 {
        let gate = gate_rx.clone();
        running.push(runner.execute(move |_| {
            let _ = gate.recv();
            Ok(Box::new(()) as Payload)
        }));
    }

    // Third waits; fourth overflows the waiting queue and evicts it.
    let third = runner.execute(|_| Ok(Box::new(3i32) as Payload));
    let fourth = runner.execute(|_| Ok(Box::new(4i32) as Payload));

    let evicted = third
        .wait_timeout(Duration::from_secs(2))
        .expect("discard must be delivered while the running slots are still blocked");
    assert_eq!(evicted.unwrap_err().code(), Some(ErrorCode::Discarded));

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    for handle in running {
        handle.wait().unwrap();
    }
    assert_eq!(*fourth.wait().unwrap().downcast::<i32>().unwrap(), 4);
}

#[test]
fn test_concurrent_zero_running_capacity_rejected() {
    let pool = pool_with_workers(1);
    assert!(pool.concurrent_runner(0, 4).is_err());
}

#[test]
fn test_named_runner_shared_and_config_checked() {
    let pool = pool_with_workers(2);

    let first = pool.named_concurrent_runner("shared-io", 2, 4).unwrap();
    let second = pool.named_concurrent_runner("shared-io", 2, 4).unwrap();
    assert_eq!(first.id(), second.id());

    // Mismatched capacities fail and leave the existing runner usable.
    let mismatch = pool.named_concurrent_runner("shared-io", 3, 4);
    assert!(mismatch.is_err());

    let handle = first.execute(|_| Ok(Box::new(1i32) as Payload));
    assert_eq!(*handle.wait().unwrap().downcast::<i32>().unwrap(), 1);
}

#[test]
fn test_named_runner_recreated_after_all_handles_drop() {
    let pool = pool_with_workers(2);

    let id_before = {
        let runner = pool.named_sequence_runner("drain", Priority::Low).unwrap();
        let handle = runner.execute(|_| Ok(Box::new(()) as Payload));
        handle.wait().unwrap();
        runner.id()
    };

    // The runner's completion callback may still be in flight right after
    // wait() returns, so give the name a moment to be released.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let reborn = loop {
        match pool.named_sequence_runner("drain", Priority::High) {
            Ok(runner) => break runner,
            Err(_) if std::time::Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("name never released: {err}"),
        }
    };
    assert_ne!(reborn.id(), id_before);
}

#[test]
fn test_runner_outlives_dropped_handle_until_drained() {
    let pool = pool_with_workers(2);

    let (gate_tx, gate_rx) = unbounded::<()>();
    let pending = {
        let runner = pool.sequence_runner(Priority::Medium);
        let blocked = runner.execute(move |_| {
            let _ = gate_rx.recv();
            Ok(Box::new(()) as Payload)
        });
        let queued = runner.execute(|_| Ok(Box::new(9i32) as Payload));
        drop(runner);
        (blocked, queued)
    };

    // Destruction is deferred: the queued task still runs to completion.
    gate_tx.send(()).unwrap();
    pending.0.wait().unwrap();
    assert_eq!(*pending.1.wait().unwrap().downcast::<i32>().unwrap(), 9);
}

#[test]
fn test_clone_shares_the_same_runner() {
    let pool = pool_with_workers(2);
    let runner = pool.sequence_runner(Priority::Medium);
    let alias = runner.clone();
    assert_eq!(runner.id(), alias.id());

    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);
    let a = runner.execute(move |_| {
        o.lock().push(1);
        Ok(Box::new(()) as Payload)
    });
    let o = Arc::clone(&order);
    let b = alias.execute(move |_| {
        o.lock().push(2);
        Ok(Box::new(()) as Payload)
    });

    a.wait().unwrap();
    b.wait().unwrap();
    assert_eq!(*order.lock(), vec![1, 2]);
}
