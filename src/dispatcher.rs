use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::KernelConfig;
use crate::error::{BatchError, Result};
use crate::model::{BatchStatus, ExecutionId, RemoteWorkState, RemotablePartitionKey, SplitFlowKey, StepExecutionUpdate};
use crate::partition::PartitionTransport;
use crate::repository::ExecutionRepository;
use crate::runner;
use crate::step::StepRegistry;
use crate::work_unit::{FlowCompletion, PartitionReply, StopToken, WorkUnit, WorkUnitId};

/// Terminal result of a work unit body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UnitResult {
    pub status: BatchStatus,
    pub exit_status: Option<String>,
}

impl UnitResult {
    pub fn new(status: BatchStatus, exit_status: Option<String>) -> Self {
        Self { status, exit_status }
    }
}

/// Stop signal and status publisher handed to a running body.
#[derive(Clone)]
pub(crate) struct UnitControl {
    pub stop: StopToken,
    status: Arc<watch::Sender<BatchStatus>>,
}

impl UnitControl {
    pub fn publish(&self, status: BatchStatus) {
        self.status.send_if_modified(|current| {
            if current.is_terminal() || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

struct InFlight {
    stop: StopToken,
    status: Arc<watch::Sender<BatchStatus>>,
    task: Option<JoinHandle<()>>,
}

/// Caller's view of a submitted work unit.
#[derive(Debug, Clone)]
pub struct WorkHandle {
    id: WorkUnitId,
    stop: StopToken,
    status: watch::Receiver<BatchStatus>,
}

impl WorkHandle {
    pub fn id(&self) -> &WorkUnitId {
        &self.id
    }

    /// Latest status published by the unit.
    pub fn status(&self) -> BatchStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Wait until the unit reaches a terminal status.
    pub async fn wait(&self) -> Result<BatchStatus> {
        let mut rx = self.status.clone();
        let status = *rx.wait_for(|s| s.is_terminal()).await?;
        Ok(status)
    }

    /// Ask the unit to stop at its next boundary.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }
}

/// Runs work units on tokio tasks and tracks the ones in flight.
pub struct Dispatcher {
    repository: Arc<dyn ExecutionRepository>,
    steps: Arc<StepRegistry>,
    config: Arc<KernelConfig>,
    transport: Option<Arc<dyn PartitionTransport>>,
    in_flight: DashMap<WorkUnitId, InFlight>,
    job_permits: Arc<Semaphore>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        steps: Arc<StepRegistry>,
        config: Arc<KernelConfig>,
        transport: Option<Arc<dyn PartitionTransport>>,
    ) -> Self {
        Self {
            job_permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            repository,
            steps,
            config,
            transport,
            in_flight: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn transport(&self) -> Option<&Arc<dyn PartitionTransport>> {
        self.transport.as_ref()
    }

    /// Start a unit on its own task. A unit with the same id already in
    /// flight is refused.
    pub fn submit(self: &Arc<Self>, unit: WorkUnit) -> Result<WorkHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BatchError::SystemShutdown);
        }
        let id = unit.id();
        let stop = StopToken::new();
        let (status_tx, status_rx) = watch::channel(BatchStatus::Starting);
        let status_tx = Arc::new(status_tx);

        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BatchError::WorkUnitAlreadyRunning { id: id.to_string() });
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    stop: stop.clone(),
                    status: status_tx.clone(),
                    task: None,
                });
            }
        }
        debug!(unit = %id, in_flight = self.in_flight.len(), "Work unit submitted");

        let control = UnitControl {
            stop: stop.clone(),
            status: status_tx,
        };
        let this = Arc::clone(self);
        let task_id = id.clone();
        let task = tokio::spawn(async move { this.run(task_id, unit, control).await });
        if let Some(mut entry) = self.in_flight.get_mut(&id) {
            entry.task = Some(task);
        }

        Ok(WorkHandle {
            id,
            stop,
            status: status_rx,
        })
    }

    async fn run(self: Arc<Self>, id: WorkUnitId, unit: WorkUnit, control: UnitControl) {
        let _permit = if unit.is_job() {
            // a stop while queued still runs the body, which records STOPPED
            tokio::select! {
                permit = self.job_permits.clone().acquire_owned() => permit.ok(),
                _ = control.stop.stopped() => None,
            }
        } else {
            None
        };

        let outcome = AssertUnwindSafe(self.execute(&unit, &control)).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(unit = %id, error = %err, "Work unit failed");
                self.settle_failure(&unit, err.to_string()).await
            }
            Err(panic) => {
                let message = format!("panicked: {}", panic_message(panic.as_ref()));
                error!(unit = %id, error = %message, "Work unit panicked");
                self.settle_failure(&unit, message).await
            }
        };
        self.on_completed(id, unit, &control, result).await;
    }

    async fn execute(self: &Arc<Self>, unit: &WorkUnit, control: &UnitControl) -> Result<UnitResult> {
        match unit {
            WorkUnit::Job(job) => runner::run_job(Arc::clone(self), job.clone(), control.clone()).await,
            WorkUnit::Partition(partition) => {
                runner::run_partition(Arc::clone(self), partition.clone(), control.clone()).await
            }
            WorkUnit::SplitFlow(flow) => {
                runner::run_split_flow(Arc::clone(self), flow.clone(), control.clone()).await
            }
        }
    }

    /// Record FAILED unless the record already reached a terminal status,
    /// and report whichever terminal status stands.
    async fn settle_failure(&self, unit: &WorkUnit, exit_status: String) -> UnitResult {
        let settled = match unit {
            WorkUnit::Job(job) => self.settle_job(job.job.execution_id, exit_status.clone()).await,
            WorkUnit::Partition(partition) => {
                let settled = self
                    .settle_step(partition.step_execution_id, exit_status.clone())
                    .await;
                if partition.remote {
                    let key = RemotablePartitionKey {
                        job_execution_id: partition.job.execution_id,
                        step_name: partition.step.name.clone(),
                        partition: partition.partition,
                    };
                    if let Err(err) = self
                        .repository
                        .update_remotable_partition(&key, RemoteWorkState::Completed, None)
                        .await
                    {
                        warn!(error = %err, "Could not complete remotable partition record");
                    }
                }
                settled
            }
            WorkUnit::SplitFlow(flow) => {
                let key = SplitFlowKey {
                    job_execution_id: flow.job.execution_id,
                    flow_name: flow.flow.name.clone(),
                };
                self.repository
                    .update_remotable_split_flow(
                        &key,
                        RemoteWorkState::Completed,
                        BatchStatus::Failed,
                        Some(exit_status.clone()),
                    )
                    .await
                    .map(|record| UnitResult::new(record.status, record.exit_status))
            }
        };
        settled.unwrap_or_else(|err| {
            error!(error = %err, "Could not record work unit failure");
            UnitResult::new(BatchStatus::Failed, Some(exit_status))
        })
    }

    async fn settle_job(&self, execution_id: ExecutionId, exit_status: String) -> Result<UnitResult> {
        let execution = self.repository.get_job_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(UnitResult::new(execution.status, execution.exit_status));
        }
        let execution = self
            .repository
            .update_execution_status(execution_id, BatchStatus::Failed, Some(exit_status))
            .await?;
        Ok(UnitResult::new(execution.status, execution.exit_status))
    }

    async fn settle_step(&self, step_execution_id: u64, exit_status: String) -> Result<UnitResult> {
        let step = self.repository.get_step_execution(step_execution_id).await?;
        if step.status.is_terminal() {
            return Ok(UnitResult::new(step.status, step.exit_status));
        }
        let step = self
            .repository
            .update_step_execution(
                step_execution_id,
                StepExecutionUpdate {
                    status: Some(BatchStatus::Failed),
                    exit_status: Some(exit_status),
                    metrics: None,
                },
            )
            .await?;
        Ok(UnitResult::new(step.status, step.exit_status))
    }

    /// Runs exactly once per submitted unit: leave the registry, publish the
    /// terminal status, then notify whichever coordinator is waiting.
    async fn on_completed(&self, id: WorkUnitId, unit: WorkUnit, control: &UnitControl, result: UnitResult) {
        self.in_flight.remove(&id);
        control.status.send_replace(result.status);
        debug!(unit = %id, status = %result.status, "Work unit completed");

        match unit {
            WorkUnit::Job(_) => {}
            WorkUnit::Partition(partition) => {
                let reply = PartitionReply {
                    partition: partition.partition,
                    status: result.status,
                    exit_status: result.exit_status,
                };
                if partition.reply.send(reply).await.is_err() {
                    debug!(unit = %id, "Partition coordinator no longer waiting");
                }
            }
            WorkUnit::SplitFlow(flow) => {
                let completion = FlowCompletion {
                    flow_name: flow.flow.name.clone(),
                    status: result.status,
                    exit_status: result.exit_status,
                };
                if flow.completion.send(completion).await.is_err() {
                    debug!(unit = %id, "Split coordinator no longer waiting");
                }
            }
        }
    }

    /// Status of an in-flight unit, without touching the repository.
    pub fn in_flight_status(&self, id: &WorkUnitId) -> Option<BatchStatus> {
        self.in_flight.get(id).map(|entry| *entry.status.borrow())
    }

    pub fn is_in_flight(&self, id: &WorkUnitId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Cooperative stop. Returns false if the unit is not in flight here.
    pub fn request_stop(&self, id: &WorkUnitId) -> bool {
        match self.in_flight.get(id) {
            Some(entry) => {
                entry.stop.request_stop();
                entry.status.send_if_modified(|status| {
                    if status.is_terminal() || *status == BatchStatus::Stopping {
                        return false;
                    }
                    *status = BatchStatus::Stopping;
                    true
                });
                info!(unit = %id, "Stop requested");
                true
            }
            None => false,
        }
    }

    /// Refuse new work, ask everything in flight to stop, and wait up to
    /// `shutdown_timeout`. Returns the number of units still running.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let tasks: Vec<JoinHandle<()>> = self
            .in_flight
            .iter_mut()
            .filter_map(|mut entry| {
                entry.stop.request_stop();
                entry.value_mut().task.take()
            })
            .collect();
        info!(units = tasks.len(), "Dispatcher shutting down");

        if tokio::time::timeout(self.config.shutdown_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                remaining = self.in_flight.len(),
                timeout = ?self.config.shutdown_timeout,
                "Shutdown timed out with work still in flight"
            );
        }
        self.in_flight.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobParameters, NewJobInstance};
    use crate::plan::{ExecutionPlan, StepDef};
    use crate::repository::InMemoryRepository;
    use crate::step::{FnStep, StepContext, StepOutcome};
    use crate::work_unit::{JobContext, JobWorkUnit};
    use std::time::Duration;

    async fn dispatcher_with(steps: StepRegistry) -> (Arc<Dispatcher>, Arc<dyn ExecutionRepository>) {
        let repo: Arc<dyn ExecutionRepository> = Arc::new(InMemoryRepository::new());
        let config = KernelConfig::builder()
            .server_id("test-node")
            .stop_grace_period(Duration::from_millis(200))
            .shutdown_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(repo.clone(), Arc::new(steps), Arc::new(config), None));
        (dispatcher, repo)
    }

    async fn job_unit(repo: &Arc<dyn ExecutionRepository>, plan: ExecutionPlan) -> JobWorkUnit {
        let instance = repo
            .create_job_instance(NewJobInstance {
                job_name: plan.job_name.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        let execution = repo
            .create_job_execution(instance.id, JobParameters::new(), None)
            .await
            .unwrap();
        JobWorkUnit {
            job: JobContext {
                instance_id: instance.id,
                execution_id: execution.id,
                parameters: Arc::new(JobParameters::new()),
            },
            plan: Arc::new(plan),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_is_recorded_as_failure() {
        let steps = StepRegistry::new();
        steps
            .register(
                "boom",
                Arc::new(FnStep::new(|_ctx: Arc<StepContext>| async move {
                    if true {
                        panic!("step exploded");
                    }
                    Ok(StepOutcome::completed())
                })),
            )
            .unwrap();
        let (dispatcher, repo) = dispatcher_with(steps).await;
        let unit = job_unit(&repo, ExecutionPlan::new("j").step(StepDef::new("boom"))).await;
        let execution_id = unit.job.execution_id;

        let handle = dispatcher.submit(WorkUnit::Job(unit)).unwrap();
        assert_eq!(handle.wait().await.unwrap(), BatchStatus::Failed);
        assert!(!dispatcher.is_in_flight(&WorkUnitId::Job(execution_id)));

        let execution = repo.get_job_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, BatchStatus::Failed);

        // the dispatcher keeps working after a panic
        let unit = job_unit(&repo, ExecutionPlan::new("j2")).await;
        let handle = dispatcher.submit(WorkUnit::Job(unit)).unwrap();
        assert_eq!(handle.wait().await.unwrap(), BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_submission_refused() {
        let steps = StepRegistry::new();
        steps
            .register(
                "wait",
                Arc::new(FnStep::new(|ctx: Arc<StepContext>| async move {
                    ctx.stopped().await;
                    Ok(StepOutcome::stopped())
                })),
            )
            .unwrap();
        let (dispatcher, repo) = dispatcher_with(steps).await;
        let unit = job_unit(&repo, ExecutionPlan::new("j").step(StepDef::new("wait"))).await;

        let handle = dispatcher.submit(WorkUnit::Job(unit.clone())).unwrap();
        let err = dispatcher.submit(WorkUnit::Job(unit)).unwrap_err();
        assert!(matches!(err, BatchError::WorkUnitAlreadyRunning { .. }));

        assert!(dispatcher.request_stop(handle.id()));
        assert_eq!(handle.wait().await.unwrap(), BatchStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_stops_in_flight_work() {
        let steps = StepRegistry::new();
        steps
            .register(
                "wait",
                Arc::new(FnStep::new(|ctx: Arc<StepContext>| async move {
                    ctx.stopped().await;
                    Ok(StepOutcome::stopped())
                })),
            )
            .unwrap();
        let (dispatcher, repo) = dispatcher_with(steps).await;
        let mut handles = Vec::new();
        for _ in 0..3 {
            let unit = job_unit(&repo, ExecutionPlan::new("j").step(StepDef::new("wait"))).await;
            handles.push(dispatcher.submit(WorkUnit::Job(unit)).unwrap());
        }

        assert_eq!(dispatcher.shutdown().await, 0);
        for handle in handles {
            assert_eq!(handle.status(), BatchStatus::Stopped);
        }
        let unit = job_unit(&repo, ExecutionPlan::new("late")).await;
        assert!(matches!(
            dispatcher.submit(WorkUnit::Job(unit)),
            Err(BatchError::SystemShutdown)
        ));
    }
}
