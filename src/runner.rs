//! Bodies of the three work unit kinds.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dispatcher::{panic_message, Dispatcher, UnitControl, UnitResult};
use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, RemoteWorkState, RemotablePartitionKey, SplitFlowKey,
    StepExecutionId, StepExecutionUpdate, StepThreadExecution, StepThreadKey, TOP_LEVEL_PARTITION,
};
use crate::partition::{aggregate_status, PartitionCoordinator};
use crate::plan::{PlanElement, Properties, StepDef};
use crate::split_flow::SplitFlowCoordinator;
use crate::step::{StepContext, StepContextInit};
use crate::work_unit::{JobContext, JobWorkUnit, PartitionWorkUnit, SplitFlowWorkUnit, StopToken};

pub(crate) async fn run_job(dispatcher: Arc<Dispatcher>, unit: JobWorkUnit, control: UnitControl) -> Result<UnitResult> {
    let repo = dispatcher.repository().clone();
    let execution_id = unit.job.execution_id;

    if control.stop.is_stop_requested() {
        return finish_unstarted_job(&dispatcher, execution_id).await;
    }
    match repo
        .update_execution_started(execution_id, &dispatcher.config().server_id)
        .await
    {
        Ok(_) => {}
        Err(BatchError::IllegalBatchStatusTransition { .. }) => {
            // a stop reached the record before this server did
            return finish_unstarted_job(&dispatcher, execution_id).await;
        }
        Err(err) => return Err(err),
    }
    control.publish(BatchStatus::Started);
    info!(
        execution_id = %execution_id,
        instance_id = %unit.job.instance_id,
        job = %unit.plan.job_name,
        server_id = %dispatcher.config().server_id,
        "Job execution started"
    );

    let mut result = UnitResult::new(BatchStatus::Completed, None);
    for element in &unit.plan.elements {
        if control.stop.is_stop_requested() {
            result = UnitResult::new(BatchStatus::Stopped, None);
            break;
        }
        let element_result = match element {
            PlanElement::Step(step) => run_top_level_step(&dispatcher, &unit.job, step, &control.stop).await?,
            PlanElement::Split(split) => {
                SplitFlowCoordinator::new(dispatcher.clone(), unit.job.clone())
                    .run(split, &control.stop)
                    .await?
            }
        };
        if element_result.status != BatchStatus::Completed {
            result = element_result;
            break;
        }
    }

    let execution = repo
        .update_execution_status(execution_id, result.status, result.exit_status.clone())
        .await?;
    info!(
        execution_id = %execution_id,
        status = %execution.status,
        exit_status = ?execution.exit_status,
        "Job execution finished"
    );
    Ok(UnitResult::new(execution.status, execution.exit_status))
}

/// Settle a job that was stopped before it ran any step.
async fn finish_unstarted_job(dispatcher: &Dispatcher, execution_id: u64) -> Result<UnitResult> {
    let repo = dispatcher.repository();
    let execution = repo.get_job_execution(execution_id).await?;
    if execution.status.is_terminal() {
        info!(execution_id = %execution_id, status = %execution.status, "Job execution ended before dispatch");
        return Ok(UnitResult::new(execution.status, execution.exit_status));
    }
    let execution = repo
        .update_execution_status(execution_id, BatchStatus::Stopped, None)
        .await?;
    info!(execution_id = %execution_id, "Job execution stopped before start");
    Ok(UnitResult::new(execution.status, execution.exit_status))
}

/// Run one step of a job or flow. Steps that completed in an earlier
/// execution and were not re-created by the restart are skipped.
pub(crate) async fn run_top_level_step(
    dispatcher: &Arc<Dispatcher>,
    job: &JobContext,
    step: &StepDef,
    stop: &StopToken,
) -> Result<UnitResult> {
    let repo = dispatcher.repository();
    let key = StepThreadKey::top_level(job.instance_id, step.name.clone());

    let execution = match repo
        .find_step_execution(job.execution_id, &step.name, TOP_LEVEL_PARTITION)
        .await?
    {
        Some(execution) => execution,
        None => {
            if repo.get_step_thread_instance(&key).await?.is_some() {
                debug!(execution_id = %job.execution_id, step = %step.name, "Step already complete, skipping");
                return Ok(UnitResult::new(BatchStatus::Completed, None));
            }
            repo.create_step_thread(
                key.clone(),
                job.execution_id,
                step.partition.as_ref().map(|p| p.partitions),
            )
            .await?
        }
    };

    if execution.status.is_terminal() {
        return Ok(UnitResult::new(execution.status, execution.exit_status));
    }
    if stop.is_stop_requested() {
        return mark_step(dispatcher, execution.id, BatchStatus::Stopped, None).await;
    }
    mark_step(dispatcher, execution.id, BatchStatus::Started, None).await?;

    if step.partition.is_some() {
        let coordinator = PartitionCoordinator::new(dispatcher.clone(), job.clone(), step.clone(), execution.clone());
        return match coordinator.run(stop).await {
            Ok(result) => Ok(result),
            Err(err @ BatchError::PartitionUnreachable { .. }) => {
                warn!(execution_id = %job.execution_id, step = %step.name, error = %err, "Partitioned step failed");
                mark_step(dispatcher, execution.id, BatchStatus::Failed, Some(err.to_string())).await
            }
            Err(err) => Err(err),
        };
    }

    run_step_body(dispatcher, job, step, &execution, step.properties.clone(), stop).await
}

pub(crate) async fn run_partition(
    dispatcher: Arc<Dispatcher>,
    unit: PartitionWorkUnit,
    control: UnitControl,
) -> Result<UnitResult> {
    let repo = dispatcher.repository().clone();
    let remote_key = RemotablePartitionKey {
        job_execution_id: unit.job.execution_id,
        step_name: unit.step.name.clone(),
        partition: unit.partition,
    };
    if unit.remote {
        repo.update_remotable_partition(&remote_key, RemoteWorkState::Consumed, None)
            .await?;
    }

    let execution = repo.get_step_execution(unit.step_execution_id).await?;
    let result = if execution.status.is_terminal() {
        UnitResult::new(execution.status, execution.exit_status.clone())
    } else if control.stop.is_stop_requested() {
        mark_step(&dispatcher, execution.id, BatchStatus::Stopped, None).await?
    } else {
        mark_step(&dispatcher, execution.id, BatchStatus::Started, None).await?;
        control.publish(BatchStatus::Started);
        run_step_body(
            &dispatcher,
            &unit.job,
            &unit.step,
            &execution,
            merge_properties(&unit.step.properties, &unit.properties),
            &control.stop,
        )
        .await?
    };

    if unit.remote {
        repo.update_remotable_partition(&remote_key, RemoteWorkState::Completed, None)
            .await?;
    }
    Ok(result)
}

pub(crate) async fn run_split_flow(
    dispatcher: Arc<Dispatcher>,
    unit: SplitFlowWorkUnit,
    control: UnitControl,
) -> Result<UnitResult> {
    let repo = dispatcher.repository().clone();
    let key = SplitFlowKey {
        job_execution_id: unit.job.execution_id,
        flow_name: unit.flow.name.clone(),
    };
    repo.update_remotable_split_flow(&key, RemoteWorkState::Consumed, BatchStatus::Started, None)
        .await?;
    control.publish(BatchStatus::Started);
    debug!(execution_id = %unit.job.execution_id, flow = %unit.flow.name, "Flow started");

    let mut statuses = Vec::with_capacity(unit.flow.steps.len());
    let mut exit_status = None;
    for step in &unit.flow.steps {
        if control.stop.is_stop_requested() {
            statuses.push(BatchStatus::Stopped);
            break;
        }
        let result = run_top_level_step(&dispatcher, &unit.job, step, &control.stop).await?;
        statuses.push(result.status);
        if result.status != BatchStatus::Completed {
            exit_status = result.exit_status;
            break;
        }
    }
    let status = aggregate_status(&statuses);
    let record = repo
        .update_remotable_split_flow(&key, RemoteWorkState::Completed, status, exit_status)
        .await?;
    debug!(execution_id = %unit.job.execution_id, flow = %unit.flow.name, status = %status, "Flow finished");
    Ok(UnitResult::new(record.status, record.exit_status))
}

/// Invoke the step's handler against a STARTED execution and record the outcome.
async fn run_step_body(
    dispatcher: &Arc<Dispatcher>,
    job: &JobContext,
    step: &StepDef,
    execution: &StepThreadExecution,
    properties: Properties,
    stop: &StopToken,
) -> Result<UnitResult> {
    let repo = dispatcher.repository();
    let handler = match dispatcher.steps().get(step.handler_name()) {
        Ok(handler) => handler,
        Err(err) => {
            warn!(step = %step.name, error = %err, "No handler for step");
            return mark_step(dispatcher, execution.id, BatchStatus::Failed, Some(err.to_string())).await;
        }
    };

    let thread = repo.get_step_thread_instance(&execution.key).await?;
    let (checkpoint, user_data) = thread
        .map(|t| (t.checkpoint, t.user_data))
        .unwrap_or((None, None));
    let ctx = Arc::new(StepContext::new(StepContextInit {
        instance_id: job.instance_id,
        job_execution_id: job.execution_id,
        step_execution_id: execution.id,
        key: execution.key.clone(),
        parameters: job.parameters.clone(),
        properties,
        restart_mode: execution.restart_mode,
        checkpoint,
        user_data,
        stop: stop.clone(),
        repository: repo.clone(),
    }));

    debug!(
        execution_id = %job.execution_id,
        step = %step.name,
        partition = execution.key.partition,
        restart_mode = ?execution.restart_mode,
        "Step body starting"
    );
    let outcome = AssertUnwindSafe(handler.execute(ctx.clone())).catch_unwind().await;
    let (status, exit_status) = match outcome {
        Ok(Ok(outcome)) if outcome.status.is_terminal() && outcome.status != BatchStatus::Abandoned => {
            (outcome.status, outcome.exit_status)
        }
        Ok(Ok(outcome)) => (
            BatchStatus::Failed,
            Some(format!("step returned non-terminal status {}", outcome.status)),
        ),
        Ok(Err(err)) => (BatchStatus::Failed, Some(err.to_string())),
        Err(panic) => (
            BatchStatus::Failed,
            Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        ),
    };

    let updated = repo
        .update_step_execution(
            execution.id,
            StepExecutionUpdate {
                status: Some(status),
                exit_status,
                metrics: Some(ctx.metrics()),
            },
        )
        .await?;
    if status == BatchStatus::Failed {
        warn!(
            execution_id = %job.execution_id,
            step = %step.name,
            partition = execution.key.partition,
            exit_status = ?updated.exit_status,
            "Step failed"
        );
    } else {
        info!(
            execution_id = %job.execution_id,
            step = %step.name,
            partition = execution.key.partition,
            status = %status,
            "Step finished"
        );
    }
    Ok(UnitResult::new(updated.status, updated.exit_status))
}

pub(crate) async fn mark_step(
    dispatcher: &Dispatcher,
    step_execution_id: StepExecutionId,
    status: BatchStatus,
    exit_status: Option<String>,
) -> Result<UnitResult> {
    let updated = dispatcher
        .repository()
        .update_step_execution(
            step_execution_id,
            StepExecutionUpdate {
                status: Some(status),
                exit_status,
                metrics: None,
            },
        )
        .await?;
    Ok(UnitResult::new(updated.status, updated.exit_status))
}

fn merge_properties(step: &Properties, partition: &Properties) -> Properties {
    let mut merged = step.clone();
    merged.extend(partition.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
