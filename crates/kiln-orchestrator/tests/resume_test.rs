//! Stop, checkpoint and resume tests.

mod common;

use common::{Harness, cpus, recv_until_step};
use kiln_orchestrator::{JobState, SchedulerError};
use kiln_training::{JobArtifact, JobKind};
use serde_json::json;

#[tokio::test]
async fn test_stop_then_resume_continues_from_checkpoint() {
    let h = Harness::new(1, 1, cpus(1));
    let original = h.submit_train("alice", "veh_v1", 10).await;

    let mut progress = h.scheduler.subscribe(&original).await.unwrap();
    h.advance(3);
    recv_until_step(&mut progress, 3).await;

    assert!(h.scheduler.stop("alice", &original).await);
    let stopped = h.finished(&original).await;
    assert_eq!(stopped.state, JobState::Stopped);
    let checkpoint = stopped.checkpoint_ref.clone().unwrap();
    assert_eq!(checkpoint.step, 3);
    assert!(checkpoint.path.exists());
    assert_eq!(stopped.current_step(), Some(3));

    let resumed = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": original }))
        .await
        .unwrap();
    let job = h.scheduler.get_job(&resumed).unwrap();
    assert_eq!(job.resumed_from.as_ref(), Some(&original));
    assert_eq!(job.checkpoint_ref.as_ref().map(|c| c.step), Some(3));

    let mut progress = h.scheduler.subscribe(&resumed).await.unwrap();
    h.advance(7);
    let mut steps = Vec::new();
    while let Some(event) = progress.recv().await {
        assert_eq!(event.total, Some(10));
        steps.push(event.step);
    }
    assert_eq!(steps, (4..=10).collect::<Vec<_>>());

    let job = h.scheduler.get_job(&resumed).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(matches!(job.result, Some(JobArtifact::Model { ref model }) if model.model_name == "veh_v1"));
    assert_eq!(job.checkpoint_ref.map(|c| c.step), Some(10));

    // The source keeps its own checkpoint.
    let source = h.scheduler.get_job(&original).unwrap();
    assert_eq!(source.checkpoint_ref.map(|c| c.step), Some(3));
}

#[tokio::test]
async fn test_resume_without_checkpoint_is_rejected() {
    let h = Harness::new(1, 1, cpus(1));
    let id = h.submit_train("alice", "m", 10).await;

    assert!(h.scheduler.stop("alice", &id).await);
    let stopped = h.finished(&id).await;
    assert!(stopped.checkpoint_ref.is_none());

    let err = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": id }))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoCheckpoint(ref source) if *source == id));
    assert_eq!(h.scheduler.list_jobs("alice").len(), 1);
}

#[tokio::test]
async fn test_resume_requires_stopped_or_failed_source() {
    let h = Harness::new(1, 1, cpus(1));
    let id = h.submit_train("alice", "m", 10).await;
    let mut progress = h.scheduler.subscribe(&id).await.unwrap();
    h.advance(1);
    recv_until_step(&mut progress, 1).await;

    let err = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": id }))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(ref m) if m.contains("running")));

    assert!(h.scheduler.stop("alice", &id).await);
    h.finished(&id).await;

    let err = h
        .scheduler
        .submit("bob", JobKind::Resume, json!({ "source_job": id }))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(ref m) if m.contains("another user")));

    let err = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": "no-such-job" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
}

#[tokio::test]
async fn test_resume_chain_reaches_original_params() {
    let h = Harness::new(1, 1, cpus(1));
    let first = h.submit_train("alice", "m", 6).await;
    let mut progress = h.scheduler.subscribe(&first).await.unwrap();
    h.advance(2);
    recv_until_step(&mut progress, 2).await;
    assert!(h.scheduler.stop("alice", &first).await);
    h.finished(&first).await;

    let second = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": first }))
        .await
        .unwrap();
    let mut progress = h.scheduler.subscribe(&second).await.unwrap();
    h.advance(2);
    recv_until_step(&mut progress, 4).await;
    assert!(h.scheduler.stop("alice", &second).await);
    assert_eq!(h.finished(&second).await.checkpoint_ref.map(|c| c.step), Some(4));

    let third = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": second }))
        .await
        .unwrap();
    h.advance(2);
    let job = h.finished(&third).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.current_step(), Some(6));
}

#[tokio::test]
async fn test_resume_holds_the_destination_model() {
    let h = Harness::new(2, 2, cpus(2));
    let id = h.submit_train("alice", "m", 5).await;
    let mut progress = h.scheduler.subscribe(&id).await.unwrap();
    h.advance(1);
    recv_until_step(&mut progress, 1).await;
    assert!(h.scheduler.stop("alice", &id).await);
    h.finished(&id).await;

    let resumed = h
        .scheduler
        .submit("alice", JobKind::Resume, json!({ "source_job": id }))
        .await
        .unwrap();
    let err = h
        .scheduler
        .submit("alice", JobKind::Train, h.train_params("m", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ModelBusy { ref holder, .. } if *holder == resumed));
}
