//! Task-group cohort semantics: combined resolution, first-failure
//! rejection, resubmission, timeout, and group cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
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
fn test_group_success_yields_all_payloads_in_order() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();
    for n in 0..5i32 {
        group.add_task(move |_| Ok(Box::new(n * 10) as Payload));
    }

    let handle = pool.submit_group(&group, Priority::Medium);
    let result = handle.wait().unwrap();
    assert!(result.is_success());

    let payloads = result.into_outcome().unwrap();
    assert_eq!(payloads.len(), 5);
    for (n, payload) in payloads.into_iter().enumerate() {
        assert_eq!(*payload.downcast::<i32>().unwrap(), n as i32 * 10);
    }
}

#[test]
fn test_group_rejects_only_after_every_member_lands() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();

    let (gate_tx, gate_rx) = unbounded::<()>();
    group.add_task(move |_| Err(taskpool::Error::task_failed("member one failed")));
    group.add_task(move |_| {
        let _ = gate_rx.recv();
        Ok(Box::new(2i32) as Payload)
    });

    let handle = pool.submit_group(&group, Priority::Medium);

    // The failure has already landed, but the slow member has not, so the
    // cohort must still be unresolved.
    assert!(handle.wait_timeout(Duration::from_millis(100)).is_none());

    gate_tx.send(()).unwrap();
    let mut result = handle.wait().unwrap();
    assert_eq!(result.failed_index(), Some(0));

    // The successful member's payload is still readable alongside the error.
    let slow = result.take_slot(1).unwrap().unwrap();
    assert_eq!(*slow.downcast::<i32>().unwrap(), 2);
    assert!(result.into_outcome().is_err());
}

#[test]
fn test_group_can_be_resubmitted() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    group.add_task(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(n) as Payload)
    });

    let first = pool.submit_group(&group, Priority::Medium);
    let second = pool.submit_group(&group, Priority::Medium);

    assert!(first.wait().unwrap().is_success());
    assert!(second.wait().unwrap().is_success());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_group_resubmission_while_prior_in_flight() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();

    let (gate_tx, gate_rx) = unbounded::<()>();
    group.add_task(move |_| {
        let _ = gate_rx.recv();
        Ok(Box::new(()) as Payload)
    });

    let first = pool.submit_group(&group, Priority::Medium);
    let second = pool.submit_group(&group, Priority::Medium);

    // Each submission tracks its own progress; releasing both gates
    // resolves both handles.
    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    assert!(first.wait().unwrap().is_success());
    assert!(second.wait().unwrap().is_success());
}

#[test]
fn test_group_timeout_rejects_unfinished_cohort() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();

    let (gate_tx, gate_rx) = unbounded::<()>();
    group.add_task(|_| Ok(Box::new(1i32) as Payload));
    group.add_task(move |_| {
        let _ = gate_rx.recv();
        Ok(Box::new(2i32) as Payload)
    });

    let handle =
        pool.submit_group_with_timeout(&group, Priority::Medium, Duration::from_millis(50));
    let result = handle.wait().unwrap();
    assert!(result.timed_out());
    assert!(!result.is_success());

    // The member that did finish kept its slot; the straggler has none.
    assert!(result.slots()[0].is_some());
    assert!(result.slots()[1].is_none());
    match result.into_outcome() {
        Err(error) => assert_eq!(error.code(), Some(ErrorCode::Timeout)),
        Ok(_) => panic!("timed-out group must not succeed"),
    }

    gate_tx.send(()).unwrap();
}

#[test]
fn test_group_timeout_unused_when_cohort_lands_first() {
    let pool = pool_with_workers(2);
    let group = taskpool::TaskGroup::new();
    group.add_task(|_| Ok(Box::new(7i32) as Payload));

    let handle = pool.submit_group_with_timeout(&group, Priority::Medium, Duration::from_secs(30));
    let result = handle.wait().unwrap();
    assert!(result.is_success());
    assert!(!result.timed_out());
}

#[test]
fn test_cancel_group_rejects_waiting_members() {
    let pool = pool_with_workers(1);

    // Park the only worker so the whole cohort stays waiting.
    let (gate_tx, gate_rx) = unbounded::<()>();
    let plug = pool.submit(move |_| {
        let _ = gate_rx.recv();
        Ok(Box::new(()) as Payload)
    });

    let ran = Arc::new(AtomicUsize::new(0));
    let group = taskpool::TaskGroup::new();
    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        group.add_task(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(()) as Payload)
        });
    }

    let handle = pool.submit_group(&group, Priority::Medium);
    pool.cancel_group(&group);

    let result = handle.wait().unwrap();
    assert!(!result.is_success());
    match result.into_outcome() {
        Err(error) => assert_eq!(error.code(), Some(ErrorCode::Canceled)),
        Ok(_) => panic!("canceled group must not succeed"),
    }

    gate_tx.send(()).unwrap();
    plug.wait().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_group_without_submission_is_a_noop() {
    let pool = pool_with_workers(1);
    let group = taskpool::TaskGroup::new();
    group.add_task(|_| Ok(Box::new(()) as Payload));

    // Nothing in flight: cancel does nothing, and the group stays usable.
    pool.cancel_group(&group);
    let handle = pool.submit_group(&group, Priority::Medium);
    assert!(handle.wait().unwrap().is_success());
}

#[test]
fn test_empty_group_resolves_immediately() {
    let pool = pool_with_workers(1);
    let group = taskpool::TaskGroup::new();

    let handle = pool.submit_group(&group, Priority::Medium);
    let result = handle.wait().unwrap();
    assert!(result.is_success());
    assert!(result.into_outcome().unwrap().is_empty());
}

#[test]
fn test_named_group_keeps_its_name() {
    let group = taskpool::TaskGroup::with_name("image-decode");
    assert_eq!(group.name(), Some("image-decode"));
    assert!(taskpool::TaskGroup::new().name().is_none());
}
