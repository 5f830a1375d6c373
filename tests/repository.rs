//! Repository contract checks against both implementations, plus durability
//! of a kernel across a reopen of its sled store.

mod common;

use batchkernel::{
    BatchError, BatchKernel, BatchStatus, ExecutionPlan, ExecutionRepository, InMemoryRepository,
    InstanceQuery, InstanceState, JobParameters, KernelConfig, NewJobInstance, SledRepository, StepDef,
};
use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn repositories(dir: &tempfile::TempDir) -> Vec<(&'static str, Arc<dyn ExecutionRepository>)> {
    vec![
        ("memory", Arc::new(InMemoryRepository::new())),
        ("sled", Arc::new(SledRepository::open(dir.path().join("repo")).unwrap())),
    ]
}

async fn new_instance(repo: &Arc<dyn ExecutionRepository>, job: &str, submitter: &str) -> u64 {
    repo.create_job_instance(NewJobInstance {
        job_name: job.to_string(),
        submitter: submitter.to_string(),
        ..Default::default()
    })
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn test_instance_state_random_walk() {
    let dir = tempfile::tempdir().unwrap();
    for (name, repo) in repositories(&dir) {
        for _ in 0..20 {
            let id = new_instance(&repo, "walk", "tester").await;
            let mut current = InstanceState::Submitted;
            for _ in 0..12 {
                let next = InstanceState::ALL[fastrand::usize(..InstanceState::ALL.len())];
                let result = repo.update_instance_state(id, next, None).await;
                if current.can_transition_to(next) {
                    assert_eq!(result.unwrap().state, next, "{}: {} -> {}", name, current, next);
                    current = next;
                } else {
                    assert!(
                        matches!(result, Err(BatchError::IllegalJobStatusTransition { .. })),
                        "{}: {} -> {} should be refused",
                        name,
                        current,
                        next
                    );
                }
                assert_eq!(repo.get_job_instance(id).await.unwrap().state, current);
            }
        }
    }
}

#[tokio::test]
async fn test_execution_sequences_are_dense_and_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    for (name, repo) in repositories(&dir) {
        let id = new_instance(&repo, "seq", "tester").await;
        let mut last = None;
        for expected in 1..=4u32 {
            let execution = repo
                .create_job_execution(id, JobParameters::new(), last)
                .await
                .unwrap();
            assert_eq!(execution.sequence, expected, "{}", name);
            repo.update_execution_started(execution.id, "node").await.unwrap();
            repo.update_execution_status(execution.id, BatchStatus::Failed, None)
                .await
                .unwrap();
            last = Some(execution.id);
        }

        let sequences: Vec<u32> = repo
            .list_job_executions(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![4, 3, 2, 1], "{}", name);
        assert_eq!(repo.get_most_recent_execution(id).await.unwrap().sequence, 4);
        assert_eq!(repo.get_execution_by_sequence(id, 2).await.unwrap().sequence, 2);
        assert!(repo.get_execution_by_sequence(id, 9).await.unwrap_err().is_not_found());

        let instance = repo.get_job_instance(id).await.unwrap();
        assert_eq!(instance.execution_count, 4);
        assert_eq!(instance.last_execution_id, last);
    }
}

#[tokio::test]
async fn test_listing_pages_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    for (name, repo) in repositories(&dir) {
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(new_instance(&repo, "paged", if i % 2 == 0 { "alice" } else { "bob" }).await);
        }
        ids.reverse();

        let first: Vec<u64> = repo
            .list_job_instances(&InstanceQuery::by_job_name("paged").page(0, 2))
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        let second: Vec<u64> = repo
            .list_job_instances(&InstanceQuery::by_job_name("paged").page(1, 2))
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(first, ids[0..2].to_vec(), "{}", name);
        assert_eq!(second, ids[2..4].to_vec(), "{}", name);

        let bobs = repo
            .list_job_instances(&InstanceQuery::by_submitter("bob"))
            .await
            .unwrap();
        assert_eq!(bobs.len(), 2);
    }
}

#[tokio::test]
async fn test_stop_before_assigned_race() {
    let dir = tempfile::tempdir().unwrap();
    for (_, repo) in repositories(&dir) {
        let id = new_instance(&repo, "race", "tester").await;
        let execution = repo
            .create_job_execution(id, JobParameters::new(), None)
            .await
            .unwrap();
        repo.update_execution_started(execution.id, "node-a").await.unwrap();
        let err = repo
            .stop_execution_before_assigned(execution.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::ExecutionAssignedToServer { ref server_id, .. } if server_id == "node-a"));

        let id = new_instance(&repo, "race", "tester").await;
        let execution = repo
            .create_job_execution(id, JobParameters::new(), None)
            .await
            .unwrap();
        let stopped = repo.stop_execution_before_assigned(execution.id).await.unwrap();
        assert_eq!(stopped.status, BatchStatus::Stopped);
        assert!(matches!(
            repo.update_execution_started(execution.id, "node-a").await,
            Err(BatchError::IllegalBatchStatusTransition { .. })
        ));
        assert_eq!(repo.get_job_instance(id).await.unwrap().state, InstanceState::Stopped);
    }
}

#[tokio::test]
async fn test_purge_refused_while_running() {
    let dir = tempfile::tempdir().unwrap();
    for (_, repo) in repositories(&dir) {
        let id = new_instance(&repo, "purge", "tester").await;
        let execution = repo
            .create_job_execution(id, JobParameters::new(), None)
            .await
            .unwrap();
        repo.update_execution_started(execution.id, "node").await.unwrap();
        assert!(matches!(
            repo.purge_job_instance(id).await,
            Err(BatchError::InstanceNotPurgeable { .. })
        ));

        repo.update_execution_status(execution.id, BatchStatus::Completed, None)
            .await
            .unwrap();
        repo.purge_job_instance(id).await.unwrap();
        assert!(repo.list_job_executions(id).await.unwrap().is_empty());
        assert!(repo.get_job_instance(id).await.unwrap_err().is_not_found());
    }
}

/// Build a kernel over `config`, retrying while the previous kernel's
/// tasks still hold the sled lock.
async fn reopen(config: &KernelConfig, load: Arc<CheckpointStep>) -> BatchKernel {
    for _ in 0..50 {
        match BatchKernel::builder()
            .config(config.clone())
            .step("load", load.clone())
            .build()
        {
            Ok(kernel) => return kernel,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("sled store stayed locked");
}

#[tokio::test]
async fn test_restart_survives_kernel_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig::builder()
        .server_id("durable")
        .db_path(dir.path().join("kernel"))
        .build()
        .unwrap();
    let plan = ExecutionPlan::new("durable").step(StepDef::new("load"));

    let load = Arc::new(CheckpointStep::default());
    let kernel = reopen(&config, load.clone()).await;
    let instance_id = instance_for(&kernel, &plan).await;
    let params: JobParameters = [
        ("items".to_string(), "4".to_string()),
        ("fail_at".to_string(), "2".to_string()),
    ]
    .into();
    let (first, handle) = kernel.start_job(instance_id, None, params, None).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), BatchStatus::Failed);
    kernel.shutdown().await.unwrap();
    drop(kernel);

    let load = Arc::new(CheckpointStep::default());
    let kernel = reopen(&config, load.clone()).await;
    let instance = kernel.get_job_instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Failed);
    assert!(instance.job_document.is_some());

    let overrides: JobParameters = [("fail_at".to_string(), "never".to_string())].into();
    let (second, handle) = kernel.restart_job(first, overrides).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), BatchStatus::Completed);
    assert_eq!(load.processed(), vec![2, 3]);
    assert!(second > first);
    kernel.shutdown().await.unwrap();
}
