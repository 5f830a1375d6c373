use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;

use super::status::{BatchStatus, InstanceState, RemoteWorkState, RestartMode};

pub type InstanceId = u64;
pub type ExecutionId = u64;
pub type StepExecutionId = u64;

/// Partition number used for the top-level (non-partition) thread of a step.
pub const TOP_LEVEL_PARTITION: i32 = -1;

pub type JobParameters = BTreeMap<String, String>;

/// Durable identity of one logical job across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub app_name: Option<String>,
    pub job_name: String,
    pub submitter: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: InstanceState,
    pub batch_status: Option<BatchStatus>,
    pub group_names: Vec<String>,
    pub restart_on: Option<String>,
    /// Job document text, kept so restarts can rebuild the plan.
    pub job_document: Option<String>,
    pub execution_count: u32,
    pub last_execution_id: Option<ExecutionId>,
}

/// Fields supplied when a job instance is created.
#[derive(Debug, Clone, Default)]
pub struct NewJobInstance {
    pub app_name: Option<String>,
    pub job_name: String,
    pub submitter: String,
    pub correlation_id: Option<String>,
    pub group_names: Vec<String>,
    pub job_document: Option<String>,
}

/// One attempt (start or restart) of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub instance_id: InstanceId,
    /// 1 for the first run, incremented by every restart.
    pub sequence: u32,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub server_id: Option<String>,
    pub log_location: Option<String>,
}

/// Composite identity of a step thread: top level or one partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepThreadKey {
    pub instance_id: InstanceId,
    pub step_name: String,
    pub partition: i32,
}

impl StepThreadKey {
    pub fn top_level(instance_id: InstanceId, step_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            partition: TOP_LEVEL_PARTITION,
        }
    }

    pub fn partition(instance_id: InstanceId, step_name: impl Into<String>, partition: i32) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            partition,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.partition == TOP_LEVEL_PARTITION
    }
}

/// A step as it recurs across executions of one job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadInstance {
    pub key: StepThreadKey,
    pub checkpoint: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub start_count: u32,
    /// Only meaningful on the top-level thread of a partitioned step.
    pub partition_plan_size: Option<u32>,
    pub last_execution_id: StepExecutionId,
}

/// Counters reported by step bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
}

impl AddAssign for StepMetrics {
    fn add_assign(&mut self, other: Self) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.filter_count += other.filter_count;
    }
}

/// One attempt of a step thread inside one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadExecution {
    pub id: StepExecutionId,
    pub job_execution_id: ExecutionId,
    pub key: StepThreadKey,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: StepMetrics,
    /// Set when this execution was created by a restart.
    pub restart_mode: Option<RestartMode>,
}

impl StepThreadExecution {
    pub fn step_name(&self) -> &str {
        &self.key.step_name
    }

    pub fn partition(&self) -> i32 {
        self.key.partition
    }

    pub fn is_top_level(&self) -> bool {
        self.key.is_top_level()
    }
}

/// Status and metric change applied to a step thread execution.
#[derive(Debug, Clone, Default)]
pub struct StepExecutionUpdate {
    pub status: Option<BatchStatus>,
    pub exit_status: Option<String>,
    pub metrics: Option<StepMetrics>,
}

/// Top-level execution joined with the partition executions of the same job execution.
#[derive(Debug, Clone)]
pub struct StepAggregate {
    pub top_level: StepThreadExecution,
    pub partitions: Vec<StepThreadExecution>,
    pub metrics: StepMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemotablePartitionKey {
    pub job_execution_id: ExecutionId,
    pub step_name: String,
    pub partition: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotablePartition {
    pub key: RemotablePartitionKey,
    pub step_execution_id: StepExecutionId,
    pub state: RemoteWorkState,
    pub log_location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SplitFlowKey {
    pub job_execution_id: ExecutionId,
    pub flow_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotableSplitFlow {
    pub key: SplitFlowKey,
    pub split_name: String,
    pub state: RemoteWorkState,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
    pub log_location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Filter and paging for job instance listings. Results are ordered
/// most-recently-created first, instance id descending on ties.
#[derive(Debug, Clone)]
pub struct InstanceQuery {
    pub job_name: Option<String>,
    pub submitter: Option<String>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            job_name: None,
            submitter: None,
            page: 0,
            page_size: 50,
        }
    }
}

impl InstanceQuery {
    pub fn by_job_name(name: impl Into<String>) -> Self {
        Self {
            job_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_submitter(submitter: impl Into<String>) -> Self {
        Self {
            submitter: Some(submitter.into()),
            ..Default::default()
        }
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn matches(&self, instance: &JobInstance) -> bool {
        self.job_name.as_deref().map_or(true, |n| n == instance.job_name)
            && self
                .submitter
                .as_deref()
                .map_or(true, |s| s == instance.submitter)
    }
}
