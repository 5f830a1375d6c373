//! Fan a step out into partitions and fold their results back in.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, UnitResult};
use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, RemotablePartitionKey, RemoteWorkState, RestartMode, StepExecutionUpdate,
    StepThreadExecution, StepThreadKey,
};
use crate::plan::{PartitionPlan, StepDef};
use crate::runner::mark_step;
use crate::work_unit::{JobContext, PartitionReply, PartitionWorkUnit, StopToken, WorkUnit, WorkUnitId};

/// Hands partitions to another process. The receiving side runs them with
/// `BatchKernel::run_partition` and replies through the unit's channel.
#[async_trait]
pub trait PartitionTransport: Send + Sync {
    async fn dispatch(&self, unit: PartitionWorkUnit) -> Result<()>;

    /// Forward a stop request for a dispatched partition.
    async fn request_stop(&self, _id: &WorkUnitId) -> Result<()> {
        Ok(())
    }
}

/// Step status from partition statuses: any FAILED wins, then any STOPPED,
/// otherwise COMPLETED. Arrival order does not matter.
pub fn aggregate_status(statuses: &[BatchStatus]) -> BatchStatus {
    if statuses.iter().any(|s| *s == BatchStatus::Failed) {
        BatchStatus::Failed
    } else if statuses.iter().any(|s| *s == BatchStatus::Stopped) {
        BatchStatus::Stopped
    } else {
        BatchStatus::Completed
    }
}

pub(crate) struct PartitionCoordinator {
    dispatcher: Arc<Dispatcher>,
    job: JobContext,
    step: StepDef,
    top_level: StepThreadExecution,
}

impl PartitionCoordinator {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        job: JobContext,
        step: StepDef,
        top_level: StepThreadExecution,
    ) -> Self {
        Self {
            dispatcher,
            job,
            step,
            top_level,
        }
    }

    fn plan(&self) -> Result<&PartitionPlan> {
        self.step
            .partition
            .as_ref()
            .ok_or_else(|| BatchError::internal(format!("step {} is not partitioned", self.step.name)))
    }

    /// Create this execution's partition records. Under RESUME the persisted
    /// plan size wins and partitions that already completed are left out.
    async fn prepare(&self) -> Result<VecDeque<StepThreadExecution>> {
        let repo = self.dispatcher.repository();
        let plan = self.plan()?;
        let top_key = StepThreadKey::top_level(self.job.instance_id, self.step.name.clone());
        let mode = self.top_level.restart_mode;

        let count = match mode {
            Some(RestartMode::Resume) => repo
                .get_step_thread_instance(&top_key)
                .await?
                .and_then(|t| t.partition_plan_size)
                .unwrap_or(plan.partitions),
            _ => plan.partitions,
        };

        let last = i32::try_from(count).map_err(|_| {
            BatchError::JobDocument(format!("step {} has too many partitions ({})", self.step.name, count))
        })?;
        let mut executions = VecDeque::with_capacity(count as usize);
        for partition in 0..last {
            let key = StepThreadKey::partition(self.job.instance_id, self.step.name.clone(), partition);
            let execution = match repo.get_step_thread_instance(&key).await? {
                None => repo.create_step_thread(key, self.job.execution_id, None).await?,
                Some(thread) => {
                    let mode = mode.unwrap_or(RestartMode::Resume);
                    if mode == RestartMode::Resume {
                        let last = repo.get_step_execution(thread.last_execution_id).await?;
                        if last.status == BatchStatus::Completed {
                            debug!(step = %self.step.name, partition, "Partition already complete");
                            continue;
                        }
                    }
                    repo.create_step_thread_restart(key, self.job.execution_id, mode, None)
                        .await?
                }
            };
            executions.push_back(execution);
        }
        Ok(executions)
    }

    async fn launch(
        &self,
        execution: &StepThreadExecution,
        reply: &mpsc::Sender<PartitionReply>,
    ) -> Result<()> {
        let plan = self.plan()?;
        let partition = execution.key.partition;
        let unit = PartitionWorkUnit {
            job: self.job.clone(),
            step: self.step.clone(),
            partition,
            step_execution_id: execution.id,
            properties: plan.properties_for(partition as u32),
            remote: plan.remote,
            reply: reply.clone(),
        };

        if !plan.remote {
            self.dispatcher.submit(WorkUnit::Partition(unit))?;
            return Ok(());
        }

        let repo = self.dispatcher.repository();
        let key = RemotablePartitionKey {
            job_execution_id: self.job.execution_id,
            step_name: self.step.name.clone(),
            partition,
        };
        repo.create_remotable_partition(key.clone(), execution.id).await?;
        repo.update_remotable_partition(&key, RemoteWorkState::Dispatched, None)
            .await?;
        match self.dispatcher.transport() {
            Some(transport) => transport.dispatch(unit).await,
            None => self.dispatcher.submit(WorkUnit::Partition(unit)).map(|_| ()),
        }
    }

    async fn stop_partition(&self, partition: i32) {
        let id = WorkUnitId::Partition {
            job_execution_id: self.job.execution_id,
            step_name: self.step.name.clone(),
            partition,
        };
        if self.dispatcher.request_stop(&id) {
            return;
        }
        if let Some(transport) = self.dispatcher.transport() {
            if let Err(err) = transport.request_stop(&id).await {
                warn!(unit = %id, error = %err, "Could not forward stop to remote partition");
            }
        }
    }

    /// Run every partition and record the aggregate on the top-level
    /// execution. Completions are consumed in arrival order. A stop or a
    /// failed partition asks the rest to stop and waits at most
    /// `stop_grace_period`; silence longer than `partition_reply_timeout`
    /// yields `PartitionUnreachable`.
    pub(crate) async fn run(&self, stop: &StopToken) -> Result<UnitResult> {
        let config = self.dispatcher.config();
        let plan = self.plan()?;
        let mut pending = self.prepare().await?;
        let total = pending.len();
        let concurrency = plan.concurrency();
        let capacity = config.partition_reply_capacity.unwrap_or(total.max(1));
        let (reply_tx, mut reply_rx) = mpsc::channel(capacity);

        info!(
            execution_id = %self.job.execution_id,
            step = %self.step.name,
            partitions = total,
            threads = concurrency,
            remote = plan.remote,
            "Partitioned step starting"
        );

        let mut running: BTreeSet<i32> = BTreeSet::new();
        let mut statuses: Vec<BatchStatus> = Vec::with_capacity(total);
        let mut exit_status: Option<String> = None;
        let mut short_circuit = false;
        let mut deadline = Instant::now() + config.partition_reply_timeout;

        loop {
            if !short_circuit && stop.is_stop_requested() {
                short_circuit = true;
                deadline = Instant::now() + config.stop_grace_period;
                for partition in running.clone() {
                    self.stop_partition(partition).await;
                }
            }
            while !short_circuit && running.len() < concurrency {
                let Some(execution) = pending.pop_front() else { break };
                match self.launch(&execution, &reply_tx).await {
                    Ok(()) => {
                        running.insert(execution.key.partition);
                    }
                    Err(BatchError::SystemShutdown) => {
                        pending.push_front(execution);
                        short_circuit = true;
                    }
                    Err(err) => return Err(err),
                }
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if !running.remove(&reply.partition) {
                        warn!(step = %self.step.name, partition = reply.partition, "Reply from unknown partition ignored");
                        continue;
                    }
                    debug!(step = %self.step.name, partition = reply.partition, status = %reply.status, "Partition replied");
                    if reply.status == BatchStatus::Failed && exit_status.is_none() {
                        exit_status = reply.exit_status.clone();
                    }
                    statuses.push(reply.status);
                    if !short_circuit {
                        deadline = Instant::now() + config.partition_reply_timeout;
                        if reply.status == BatchStatus::Failed {
                            short_circuit = true;
                            deadline = Instant::now() + config.stop_grace_period;
                            for partition in running.clone() {
                                self.stop_partition(partition).await;
                            }
                        }
                    }
                }
                _ = stop.stopped(), if !short_circuit => {
                    info!(step = %self.step.name, outstanding = running.len(), "Stopping partitions");
                    short_circuit = true;
                    deadline = Instant::now() + config.stop_grace_period;
                    for partition in running.clone() {
                        self.stop_partition(partition).await;
                    }
                }
                _ = sleep_until(deadline) => {
                    let outstanding: Vec<i32> = running.iter().copied().collect();
                    if short_circuit {
                        warn!(
                            step = %self.step.name,
                            partitions = ?outstanding,
                            grace = ?config.stop_grace_period,
                            "Partitions did not acknowledge stop in time"
                        );
                        statuses.extend(outstanding.iter().map(|_| BatchStatus::Stopped));
                        break;
                    }
                    for partition in &outstanding {
                        self.stop_partition(*partition).await;
                    }
                    self.stop_unlaunched(&mut pending).await?;
                    return Err(BatchError::PartitionUnreachable {
                        step_name: self.step.name.clone(),
                        partitions: outstanding,
                        waited: config.partition_reply_timeout,
                    });
                }
            }
        }

        statuses.extend(self.stop_unlaunched(&mut pending).await?);
        self.finish(&statuses, exit_status).await
    }

    /// Partitions never launched because of a stop or failure end STOPPED.
    async fn stop_unlaunched(&self, pending: &mut VecDeque<StepThreadExecution>) -> Result<Vec<BatchStatus>> {
        let mut statuses = Vec::with_capacity(pending.len());
        while let Some(execution) = pending.pop_front() {
            let result = mark_step(&self.dispatcher, execution.id, BatchStatus::Stopped, None).await?;
            statuses.push(result.status);
        }
        Ok(statuses)
    }

    async fn finish(&self, statuses: &[BatchStatus], exit_status: Option<String>) -> Result<UnitResult> {
        let repo = self.dispatcher.repository();
        let status = aggregate_status(statuses);
        let aggregate = repo
            .aggregate_step_execution(self.job.execution_id, &self.step.name)
            .await?;
        let updated = repo
            .update_step_execution(
                self.top_level.id,
                StepExecutionUpdate {
                    status: Some(status),
                    exit_status,
                    metrics: Some(aggregate.metrics),
                },
            )
            .await?;
        info!(
            execution_id = %self.job.execution_id,
            step = %self.step.name,
            status = %status,
            partitions = aggregate.partitions.len(),
            read_count = aggregate.metrics.read_count,
            write_count = aggregate.metrics.write_count,
            "Partitioned step finished"
        );
        Ok(UnitResult::new(updated.status, updated.exit_status))
    }
}
