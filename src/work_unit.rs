//! Units of work the dispatcher runs: a job, a partition of a step, or a
//! flow of a split.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::model::{BatchStatus, ExecutionId, InstanceId, JobParameters, StepExecutionId};
use crate::plan::{ExecutionPlan, FlowDef, Properties, StepDef};

/// Registry key of an in-flight unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkUnitId {
    Job(ExecutionId),
    Partition {
        job_execution_id: ExecutionId,
        step_name: String,
        partition: i32,
    },
    SplitFlow {
        job_execution_id: ExecutionId,
        flow_name: String,
    },
}

impl WorkUnitId {
    pub fn job_execution_id(&self) -> ExecutionId {
        match self {
            WorkUnitId::Job(id) => *id,
            WorkUnitId::Partition { job_execution_id, .. } => *job_execution_id,
            WorkUnitId::SplitFlow { job_execution_id, .. } => *job_execution_id,
        }
    }
}

impl fmt::Display for WorkUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnitId::Job(id) => write!(f, "job:{}", id),
            WorkUnitId::Partition {
                job_execution_id,
                step_name,
                partition,
            } => write!(f, "partition:{}:{}:{}", job_execution_id, step_name, partition),
            WorkUnitId::SplitFlow {
                job_execution_id,
                flow_name,
            } => write!(f, "flow:{}:{}", job_execution_id, flow_name),
        }
    }
}

/// Cooperative stop signal shared by a unit and whoever may stop it.
#[derive(Debug, Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so wait_for only fails if it is dropped
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Identity shared by every unit of one job execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub instance_id: InstanceId,
    pub execution_id: ExecutionId,
    pub parameters: Arc<JobParameters>,
}

/// Top-level job execution.
#[derive(Debug, Clone)]
pub struct JobWorkUnit {
    pub job: JobContext,
    pub plan: Arc<ExecutionPlan>,
}

/// Where a partition sends its terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReply {
    pub partition: i32,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
}

/// One partition of a partitioned step.
#[derive(Debug, Clone)]
pub struct PartitionWorkUnit {
    pub job: JobContext,
    pub step: StepDef,
    pub partition: i32,
    pub step_execution_id: StepExecutionId,
    pub properties: Properties,
    pub remote: bool,
    pub reply: mpsc::Sender<PartitionReply>,
}

impl PartitionWorkUnit {
    pub fn id(&self) -> WorkUnitId {
        WorkUnitId::Partition {
            job_execution_id: self.job.execution_id,
            step_name: self.step.name.clone(),
            partition: self.partition,
        }
    }
}

/// Terminal status of one flow of a split.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowCompletion {
    pub flow_name: String,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SplitFlowWorkUnit {
    pub job: JobContext,
    pub split_name: String,
    pub flow: FlowDef,
    pub completion: mpsc::Sender<FlowCompletion>,
}

impl SplitFlowWorkUnit {
    pub fn id(&self) -> WorkUnitId {
        WorkUnitId::SplitFlow {
            job_execution_id: self.job.execution_id,
            flow_name: self.flow.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkUnit {
    Job(JobWorkUnit),
    Partition(PartitionWorkUnit),
    SplitFlow(SplitFlowWorkUnit),
}

impl WorkUnit {
    pub fn id(&self) -> WorkUnitId {
        match self {
            WorkUnit::Job(unit) => WorkUnitId::Job(unit.job.execution_id),
            WorkUnit::Partition(unit) => unit.id(),
            WorkUnit::SplitFlow(unit) => unit.id(),
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, WorkUnit::Job(_))
    }
}
