//! Work queue ordering tests.
//!
//! These tests verify that dependencies gate dequeue order, that priority
//! and arrival order break ties, and that concurrency slots are respected
//! over randomly generated dependency graphs.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use conductor::core::{ItemStatus, Priority, Submission, WorkItemId};

use crate::fixtures::{create_test_queue, task};

/// Test: dependency beats priority
/// Given A (Normal) and B (High, depends on A)
/// When dequeuing
/// Then A comes first, and B only after A completes
#[test]
fn test_dependency_gates_higher_priority_item() {
    let mut queue = create_test_queue(2);
    let a = queue.enqueue(task("A")).unwrap();
    let b = queue
        .enqueue(task("B").priority(Priority::High).depends_on(a))
        .unwrap();

    assert_eq!(queue.dequeue().unwrap().id, a);
    assert!(queue.dequeue().is_none(), "B must wait for A");

    queue.complete(a, "ok").unwrap();
    assert_eq!(queue.dequeue().unwrap().id, b);
}

#[test]
fn test_priority_then_arrival_order() {
    let mut queue = create_test_queue(10);
    let low = queue.enqueue(task("low").priority(Priority::Low)).unwrap();
    let first = queue.enqueue(task("first")).unwrap();
    let critical = queue.enqueue(task("critical").priority(Priority::Critical)).unwrap();
    let second = queue.enqueue(task("second")).unwrap();

    let order: Vec<WorkItemId> = std::iter::from_fn(|| queue.dequeue().map(|i| i.id)).collect();
    assert_eq!(order, vec![critical, first, second, low]);
}

#[test]
fn test_reschedule_moves_item_ahead() {
    let mut queue = create_test_queue(1);
    let a = queue.enqueue(task("a")).unwrap();
    let b = queue.enqueue(task("b")).unwrap();
    queue.reschedule(b, Priority::High).unwrap();

    assert_eq!(queue.dequeue().unwrap().id, b);
    queue.complete(b, "ok").unwrap();
    assert_eq!(queue.dequeue().unwrap().id, a);
}

#[test]
fn test_failed_dependency_stalls_dependents() {
    let mut queue = create_test_queue(1);
    let a = queue.enqueue(task("a").max_retries(0)).unwrap();
    let b = queue.enqueue(task("b").depends_on(a)).unwrap();

    queue.dequeue().unwrap();
    queue.fail(a, "boom").unwrap();

    assert_eq!(queue.status(&a), Some(ItemStatus::Failed));
    assert!(queue.dequeue().is_none());
    assert_eq!(queue.stalled(), vec![b]);
}

/// Property: over random DAGs, every dequeued item has all dependencies
/// completed, concurrency never exceeds the slot count, and everything
/// eventually completes.
#[test]
fn test_random_dags_respect_dependencies() {
    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let max_concurrent = rng.gen_range(1..=4);
        let mut queue = create_test_queue(max_concurrent);

        let count = rng.gen_range(5..30);
        let mut ids: Vec<WorkItemId> = Vec::with_capacity(count);
        for n in 0..count {
            let mut submission = Submission::new(&format!("item {}", n), "done");
            submission = submission.priority(match rng.gen_range(0..5) {
                0 => Priority::Background,
                1 => Priority::Low,
                2 => Priority::Normal,
                3 => Priority::High,
                _ => Priority::Critical,
            });
            // Dependencies only point backwards, so the graph is acyclic.
            for dep in ids.iter() {
                if rng.gen_bool(0.2) {
                    submission = submission.depends_on(*dep);
                }
            }
            ids.push(queue.enqueue(submission).unwrap());
        }

        let mut completed: HashSet<WorkItemId> = HashSet::new();
        let mut running: Vec<WorkItemId> = Vec::new();
        let mut rounds = 0;
        while completed.len() < count {
            rounds += 1;
            assert!(rounds < 10_000, "seed {} did not converge", seed);

            while let Some(item) = queue.dequeue() {
                assert!(
                    item.dependencies.iter().all(|d| completed.contains(d)),
                    "seed {}: dequeued before dependencies completed",
                    seed
                );
                running.push(item.id);
                assert!(running.len() <= max_concurrent, "seed {}: slots exceeded", seed);
            }

            assert!(!running.is_empty(), "seed {}: nothing runnable", seed);
            let pick = rng.gen_range(0..running.len());
            let done = running.swap_remove(pick);
            queue.complete(done, "ok").unwrap();
            completed.insert(done);
        }

        assert!(queue.is_empty());
        assert_eq!(queue.stats().total_completed, count as u64);
    }
}
