use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, ExecutionId, InstanceId, JobExecution, JobParameters, RemoteWorkState, RestartMode,
    StepExecutionUpdate, StepThreadKey,
};
use crate::plan::{ExecutionPlan, PlanElement};
use crate::repository::ExecutionRepository;

/// What a restart does with one step of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    /// Never ran before; created when the job reaches it.
    Fresh,
    /// Completed before and does not allow another start.
    Skip,
    Restart(RestartMode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRestartDecision {
    pub step_name: String,
    pub action: RestartAction,
}

#[derive(Debug, Clone)]
pub struct ResolvedRestart {
    pub previous: JobExecution,
    pub execution: JobExecution,
    pub decisions: Vec<StepRestartDecision>,
}

/// Turns a restart request into a new execution plus one step execution per
/// previously executed step.
pub struct RestartResolver {
    repository: Arc<dyn ExecutionRepository>,
}

impl RestartResolver {
    pub fn new(repository: Arc<dyn ExecutionRepository>) -> Self {
        Self { repository }
    }

    /// Validate and create the restart. `expected_last`, when given, must be
    /// the instance's most recent execution.
    pub async fn resolve(
        &self,
        instance_id: InstanceId,
        plan: &ExecutionPlan,
        overrides: JobParameters,
        expected_last: Option<ExecutionId>,
    ) -> Result<ResolvedRestart> {
        let repo = &self.repository;
        let instance = repo.get_job_instance(instance_id).await?;
        let previous = match repo.get_most_recent_execution(instance_id).await {
            Ok(execution) => execution,
            Err(BatchError::NoJobExecutions { .. }) => {
                return Err(BatchError::JobRestart {
                    instance_id,
                    reason: "instance has never been started".to_string(),
                })
            }
            Err(err) => return Err(err),
        };

        if let Some(expected) = expected_last {
            if expected != previous.id {
                return Err(BatchError::JobExecutionNotMostRecent {
                    instance_id,
                    execution_id: expected,
                    most_recent: previous.id,
                });
            }
        }
        match previous.status {
            BatchStatus::Completed => {
                return Err(BatchError::JobExecutionAlreadyComplete {
                    execution_id: previous.id,
                })
            }
            BatchStatus::Abandoned => {
                return Err(BatchError::JobRestart {
                    instance_id,
                    reason: format!("execution {} was abandoned", previous.id),
                })
            }
            status if !status.is_terminal() => {
                return Err(BatchError::JobRestart {
                    instance_id,
                    reason: format!("execution {} is still {}", previous.id, status),
                })
            }
            _ => {}
        }
        if !instance.state.is_restartable() {
            return Err(BatchError::JobRestart {
                instance_id,
                reason: format!("instance is {}", instance.state),
            });
        }
        if plan.job_name != instance.job_name {
            return Err(BatchError::JobRestart {
                instance_id,
                reason: format!("plan is for job {}, instance runs {}", plan.job_name, instance.job_name),
            });
        }

        let decisions = self.decide(instance_id, plan).await?;

        let mut parameters = previous.parameters.clone();
        parameters.extend(overrides);
        let execution = repo
            .create_job_execution(instance_id, parameters, Some(previous.id))
            .await?;

        if let Err(err) = self.prepare_steps(instance_id, plan, &decisions, &execution, previous.id).await {
            warn!(execution_id = %execution.id, error = %err, "Restart setup failed, discarding new execution");
            self.discard(&execution).await;
            return Err(err);
        }

        info!(
            instance_id = %instance_id,
            previous_execution_id = %previous.id,
            execution_id = %execution.id,
            sequence = execution.sequence,
            restarted_steps = decisions.iter().filter(|d| matches!(d.action, RestartAction::Restart(_))).count(),
            "Job restart resolved"
        );
        Ok(ResolvedRestart {
            previous,
            execution,
            decisions,
        })
    }

    /// Per-step decisions. Start limits are checked here so a refused restart
    /// creates nothing.
    pub async fn decide(&self, instance_id: InstanceId, plan: &ExecutionPlan) -> Result<Vec<StepRestartDecision>> {
        let mut decisions = Vec::new();
        for step in plan.all_steps() {
            let key = StepThreadKey::top_level(instance_id, step.name.clone());
            let action = match self.repository.get_step_thread_instance(&key).await? {
                None => RestartAction::Fresh,
                Some(thread) => {
                    let last = self.repository.get_step_execution(thread.last_execution_id).await?;
                    let completed = last.status == BatchStatus::Completed;
                    if completed && !step.allow_start_if_complete {
                        RestartAction::Skip
                    } else {
                        if step.start_limit > 0 && thread.start_count >= step.start_limit {
                            return Err(BatchError::StartLimitExceeded {
                                step_name: step.name.clone(),
                                limit: step.start_limit,
                            });
                        }
                        RestartAction::Restart(if completed {
                            RestartMode::Clean
                        } else {
                            RestartMode::Resume
                        })
                    }
                }
            };
            debug!(step = %step.name, action = ?action, "Restart decision");
            decisions.push(StepRestartDecision {
                step_name: step.name.clone(),
                action,
            });
        }
        Ok(decisions)
    }

    /// Step executions for every restarted step, then recovery of the
    /// superseded execution's remote work.
    async fn prepare_steps(
        &self,
        instance_id: InstanceId,
        plan: &ExecutionPlan,
        decisions: &[StepRestartDecision],
        execution: &JobExecution,
        previous: ExecutionId,
    ) -> Result<()> {
        for decision in decisions {
            let RestartAction::Restart(mode) = decision.action else { continue };
            let plan_size = plan
                .find_step(&decision.step_name)
                .and_then(|s| s.partition.as_ref())
                .map(|p| p.partitions);
            self.repository
                .create_step_thread_restart(
                    StepThreadKey::top_level(instance_id, decision.step_name.clone()),
                    execution.id,
                    mode,
                    plan_size,
                )
                .await?;
        }
        self.recover_remote_work(plan, previous).await
    }

    /// Stop a restart execution nobody will run, along with any step
    /// executions already created for it.
    async fn discard(&self, execution: &JobExecution) {
        let repo = &self.repository;
        match repo.list_step_executions(execution.id).await {
            Ok(steps) => {
                for step in steps.into_iter().filter(|s| !s.status.is_terminal()) {
                    let update = StepExecutionUpdate {
                        status: Some(BatchStatus::Stopped),
                        ..Default::default()
                    };
                    if let Err(err) = repo.update_step_execution(step.id, update).await {
                        warn!(step_execution_id = %step.id, error = %err, "Could not stop step execution");
                    }
                }
            }
            Err(err) => warn!(execution_id = %execution.id, error = %err, "Could not list step executions"),
        }
        if let Err(err) = repo.stop_execution_before_assigned(execution.id).await {
            warn!(execution_id = %execution.id, error = %err, "Could not stop discarded execution");
        }
    }

    /// Remote partitions and flows of the superseded execution that never
    /// reported are marked RECOVERED so late reports are ignored.
    async fn recover_remote_work(&self, plan: &ExecutionPlan, previous: ExecutionId) -> Result<()> {
        for step in plan.all_steps().into_iter().filter(|s| s.partition.is_some()) {
            for record in self.repository.list_recovery_partitions(previous, &step.name).await? {
                self.repository
                    .update_remotable_partition(&record.key, RemoteWorkState::Recovered, None)
                    .await?;
                debug!(step = %step.name, partition = record.key.partition, "Remote partition recovered");
            }
        }
        let has_splits = plan.elements.iter().any(|e| matches!(e, PlanElement::Split(_)));
        if has_splits {
            for flow in self.repository.list_split_flows(previous).await? {
                if flow.state.is_outstanding() {
                    self.repository
                        .update_remotable_split_flow(&flow.key, RemoteWorkState::Recovered, flow.status, None)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceState, NewJobInstance, RemotablePartitionKey};
    use crate::plan::{PartitionPlan, StepDef};
    use crate::repository::test_support::FailingSink;
    use crate::repository::{Change, InMemoryRepository, RecordStore, StoreRepository};
    use std::sync::atomic::Ordering;

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new("nightlyLoad")
            .step(StepDef::new("extract"))
            .step(StepDef::new("report").allow_start_if_complete(true))
            .step(StepDef::new("load").partitioned(PartitionPlan::new(2).remote(true)))
            .step(StepDef::new("archive"))
    }

    /// First execution: extract and report complete, load fails, archive never runs.
    async fn failed_first_run(repo: &Arc<dyn ExecutionRepository>) -> (InstanceId, JobExecution) {
        let instance = repo
            .create_job_instance(NewJobInstance {
                job_name: "nightlyLoad".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let execution = repo
            .create_job_execution(instance.id, [("day".to_string(), "mon".to_string())].into(), None)
            .await
            .unwrap();
        repo.update_execution_started(execution.id, "node").await.unwrap();
        for (name, status) in [
            ("extract", BatchStatus::Completed),
            ("report", BatchStatus::Completed),
            ("load", BatchStatus::Failed),
        ] {
            let step = repo
                .create_step_thread(StepThreadKey::top_level(instance.id, name), execution.id, None)
                .await
                .unwrap();
            repo.update_step_execution(
                step.id,
                StepExecutionUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        repo.create_remotable_partition(
            RemotablePartitionKey {
                job_execution_id: execution.id,
                step_name: "load".into(),
                partition: 1,
            },
            99,
        )
        .await
        .unwrap();
        let execution = repo
            .update_execution_status(execution.id, BatchStatus::Failed, None)
            .await
            .unwrap();
        (instance.id, execution)
    }

    #[tokio::test]
    async fn test_restart_decisions() {
        let repo: Arc<dyn ExecutionRepository> = Arc::new(InMemoryRepository::new());
        let (instance_id, first) = failed_first_run(&repo).await;
        let resolver = RestartResolver::new(repo.clone());

        let resolved = resolver
            .resolve(instance_id, &plan(), [("day".to_string(), "tue".to_string())].into(), Some(first.id))
            .await
            .unwrap();
        let actions: Vec<(String, RestartAction)> = resolved
            .decisions
            .iter()
            .map(|d| (d.step_name.clone(), d.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("extract".to_string(), RestartAction::Skip),
                ("report".to_string(), RestartAction::Restart(RestartMode::Clean)),
                ("load".to_string(), RestartAction::Restart(RestartMode::Resume)),
                ("archive".to_string(), RestartAction::Fresh),
            ]
        );
        assert_eq!(resolved.execution.sequence, 2);
        assert_eq!(resolved.execution.status, BatchStatus::Starting);
        assert_eq!(resolved.execution.parameters.get("day").map(String::as_str), Some("tue"));

        let steps = repo.list_step_executions(resolved.execution.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == BatchStatus::Starting));

        assert!(repo
            .list_recovery_partitions(first.id, "load")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            repo.get_job_instance(instance_id).await.unwrap().state,
            InstanceState::Submitted
        );
    }

    #[tokio::test]
    async fn test_stale_and_running_restarts_refused() {
        let repo: Arc<dyn ExecutionRepository> = Arc::new(InMemoryRepository::new());
        let (instance_id, first) = failed_first_run(&repo).await;
        let resolver = RestartResolver::new(repo.clone());

        let second = resolver
            .resolve(instance_id, &plan(), JobParameters::new(), Some(first.id))
            .await
            .unwrap()
            .execution;

        // second is still STARTING
        let err = resolver
            .resolve(instance_id, &plan(), JobParameters::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::JobRestart { .. }));

        let err = resolver
            .resolve(instance_id, &plan(), JobParameters::new(), Some(first.id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::JobExecutionNotMostRecent { most_recent, .. } if most_recent == second.id
        ));
    }

    #[tokio::test]
    async fn test_start_limit_refuses_before_creating() {
        let repo: Arc<dyn ExecutionRepository> = Arc::new(InMemoryRepository::new());
        let (instance_id, first) = failed_first_run(&repo).await;
        let resolver = RestartResolver::new(repo.clone());
        let limited = ExecutionPlan::new("nightlyLoad").step(StepDef::new("load").start_limit(1));

        let err = resolver
            .resolve(instance_id, &limited, JobParameters::new(), Some(first.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::StartLimitExceeded { limit: 1, .. }));
        assert_eq!(repo.list_job_executions(instance_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_setup_discards_new_execution() {
        let (sink, armed) = FailingSink::new(|change| matches!(change, Change::StepInstance(_)));
        let repo: Arc<dyn ExecutionRepository> = Arc::new(StoreRepository::with_sink(RecordStore::new(), sink));
        let (instance_id, first) = failed_first_run(&repo).await;
        let resolver = RestartResolver::new(repo.clone());

        armed.store(true, Ordering::SeqCst);
        let err = resolver
            .resolve(instance_id, &plan(), JobParameters::new(), Some(first.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Storage(_)));

        let discarded = repo.get_most_recent_execution(instance_id).await.unwrap();
        assert_ne!(discarded.id, first.id);
        assert_eq!(discarded.status, BatchStatus::Stopped);
        assert!(repo
            .list_step_executions(discarded.id)
            .await
            .unwrap()
            .iter()
            .all(|s| s.status.is_terminal()));

        // the instance can still be restarted once storage recovers
        armed.store(false, Ordering::SeqCst);
        let resolved = resolver
            .resolve(instance_id, &plan(), JobParameters::new(), Some(discarded.id))
            .await
            .unwrap();
        assert_eq!(resolved.execution.sequence, 3);
        assert_eq!(resolved.execution.status, BatchStatus::Starting);
    }
}
