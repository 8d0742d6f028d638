//! Admission limits and device binding checked on every step of a busy run.

mod common;

use common::{Harness, cpus};
use kiln_orchestrator::JobState;
use kiln_training::JobId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const GLOBAL_LIMIT: usize = 3;
const PER_USER_LIMIT: usize = 1;

/// Asserts the limits over a registry snapshot and returns how many jobs run.
fn assert_invariants(h: &Harness) -> usize {
    let jobs = h.scheduler.list_all_jobs();
    let mut per_user: HashMap<&str, usize> = HashMap::new();
    let mut bound = HashSet::new();
    let mut running = 0;

    for job in &jobs {
        let is_running = job.state == JobState::Running;
        assert_eq!(
            job.assigned_device.is_some(),
            is_running,
            "job {} is {} with device {:?}",
            job.id,
            job.state,
            job.assigned_device
        );
        if let Some(device) = &job.assigned_device {
            assert!(bound.insert(device.clone()), "device {device} bound twice");
        }
        if is_running {
            running += 1;
            *per_user.entry(job.user_id.as_str()).or_default() += 1;
        }
    }

    assert!(running <= GLOBAL_LIMIT, "{running} jobs running");
    for (user, count) in per_user {
        assert!(count <= PER_USER_LIMIT, "user {user} runs {count} jobs");
    }
    running
}

#[tokio::test]
async fn test_limits_hold_under_churn() {
    let h = Harness::new(GLOBAL_LIMIT, PER_USER_LIMIT, cpus(4));
    let users = ["alice", "bob", "carol", "dave", "erin"];

    let mut ids: Vec<JobId> = Vec::new();
    for i in 0..25 {
        let user = users[i % users.len()];
        let epochs = 1 + (i % 3) as u64;
        ids.push(h.submit_train(user, &format!("model_{i}"), epochs).await);
        assert_invariants(&h);
    }
    let mut max_running = assert_invariants(&h);
    assert_eq!(max_running, GLOBAL_LIMIT);

    let mut stops = 0;
    for round in 0..500 {
        if ids.iter().all(|id| h.state(id).is_terminal()) {
            break;
        }
        h.advance(2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        max_running = max_running.max(assert_invariants(&h));

        if round % 3 == 0 {
            let victim = h.scheduler.list_all_jobs().into_iter().find(|job| job.state == JobState::Running);
            if let Some(job) = victim {
                if h.scheduler.stop(&job.user_id, &job.id).await {
                    stops += 1;
                }
            }
            assert_invariants(&h);
        }
    }

    for id in &ids {
        assert!(h.finished(id).await.is_terminal());
    }
    assert_invariants(&h);
    assert!(max_running <= GLOBAL_LIMIT);
    assert!(stops > 0);

    let stats = h.scheduler.stats().await;
    assert_eq!(stats.running_total, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.free_devices, 4);
}
