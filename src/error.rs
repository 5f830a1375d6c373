use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::{BatchStatus, ExecutionId, InstanceId, InstanceState, StepExecutionId};

/// Kernel errors. Every public operation fails with one of these, never a bare flag.
#[derive(Error, Debug)]
pub enum BatchError {
    // Not found
    #[error("No such job instance: {instance_id}")]
    NoSuchJobInstance { instance_id: InstanceId },

    #[error("No such job execution: {execution_id}")]
    NoSuchJobExecution { execution_id: ExecutionId },

    #[error("No such execution #{sequence} for job instance {instance_id}")]
    NoSuchExecutionSequence { instance_id: InstanceId, sequence: u32 },

    #[error("No such step execution: {step_execution_id}")]
    NoSuchStepExecution { step_execution_id: StepExecutionId },

    #[error("Job instance {instance_id} has no executions")]
    NoJobExecutions { instance_id: InstanceId },

    #[error("No remotable work record: {key}")]
    NoSuchRemotableWork { key: String },

    #[error("No step thread instance for step {step_name} (instance {instance_id}, partition {partition})")]
    NoSuchStepThreadInstance {
        instance_id: InstanceId,
        step_name: String,
        partition: i32,
    },

    // State machine guards
    #[error("Illegal job instance transition for {instance_id}: {from} -> {to}")]
    IllegalJobStatusTransition {
        instance_id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Illegal batch status transition for {record} {id}: {from} -> {to}")]
    IllegalBatchStatusTransition {
        record: &'static str,
        id: u64,
        from: BatchStatus,
        to: BatchStatus,
    },

    // Lifecycle validation
    #[error("Job start failed: {reason}")]
    JobStart { reason: String },

    #[error("Job restart failed for instance {instance_id}: {reason}")]
    JobRestart { instance_id: InstanceId, reason: String },

    #[error("Job execution {execution_id} already completed")]
    JobExecutionAlreadyComplete { execution_id: ExecutionId },

    #[error("Job execution {execution_id} is not the most recent execution ({most_recent}) of instance {instance_id}")]
    JobExecutionNotMostRecent {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        most_recent: ExecutionId,
    },

    #[error("Job execution {execution_id} is not running (status {status})")]
    JobExecutionNotRunning {
        execution_id: ExecutionId,
        status: BatchStatus,
    },

    #[error("Step {step_name} reached its start limit of {limit}")]
    StartLimitExceeded { step_name: String, limit: u32 },

    #[error("Job instance {instance_id} cannot be purged: {reason}")]
    InstanceNotPurgeable { instance_id: InstanceId, reason: String },

    // Races
    #[error("Job execution {execution_id} was already assigned to server {server_id}")]
    ExecutionAssignedToServer {
        execution_id: ExecutionId,
        server_id: String,
    },

    #[error("Concurrent update lost for job instance {instance_id}: {reason}")]
    ExecutionConflict { instance_id: InstanceId, reason: String },

    #[error("Work unit already running: {id}")]
    WorkUnitAlreadyRunning { id: String },

    // Partial distributed failure
    #[error("Partitions {partitions:?} of step {step_name} did not report within {waited:?}")]
    PartitionUnreachable {
        step_name: String,
        partitions: Vec<i32>,
        waited: Duration,
    },

    // Step handlers
    #[error("No step handler registered as {name}")]
    StepHandlerNotFound { name: String },

    #[error("Step handler already registered: {name}")]
    StepHandlerAlreadyRegistered { name: String },

    // Documents and configuration
    #[error("Job document error: {0}")]
    JobDocument(String),

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    // System
    #[error("Channel closed")]
    ChannelClosed,

    #[error("System shutdown in progress")]
    SystemShutdown,

    // Infrastructure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request is invalid for the current state. Never retried.
    Validation,
    NotFound,
    /// Another caller won a concurrent start/restart/stop.
    RaceLost,
    /// Job, step or partition logic failed.
    ExecutionFailure,
    /// Remote work did not report back in time.
    PartialFailure,
    Infrastructure,
}

impl BatchError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn job_start(reason: impl Into<String>) -> Self {
        Self::JobStart {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchJobInstance { .. }
            | Self::NoSuchJobExecution { .. }
            | Self::NoSuchExecutionSequence { .. }
            | Self::NoSuchStepExecution { .. }
            | Self::NoSuchStepThreadInstance { .. }
            | Self::NoJobExecutions { .. }
            | Self::NoSuchRemotableWork { .. }
            | Self::StepHandlerNotFound { .. } => ErrorKind::NotFound,

            Self::IllegalJobStatusTransition { .. }
            | Self::IllegalBatchStatusTransition { .. }
            | Self::JobStart { .. }
            | Self::JobRestart { .. }
            | Self::JobExecutionAlreadyComplete { .. }
            | Self::JobExecutionNotMostRecent { .. }
            | Self::JobExecutionNotRunning { .. }
            | Self::StartLimitExceeded { .. }
            | Self::InstanceNotPurgeable { .. }
            | Self::StepHandlerAlreadyRegistered { .. }
            | Self::JobDocument(_)
            | Self::InvalidConfiguration(_) => ErrorKind::Validation,

            Self::ExecutionAssignedToServer { .. }
            | Self::ExecutionConflict { .. }
            | Self::WorkUnitAlreadyRunning { .. } => ErrorKind::RaceLost,

            Self::PartitionUnreachable { .. } => ErrorKind::PartialFailure,

            Self::Other(_) => ErrorKind::ExecutionFailure,

            Self::ChannelClosed
            | Self::SystemShutdown
            | Self::Storage(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Yaml(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Only infrastructure hiccups are worth retrying; state-machine refusals never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SystemShutdown => false,
            _ => self.kind() == ErrorKind::Infrastructure,
        }
    }
}

/// Result type alias for BatchError
pub type Result<T> = std::result::Result<T, BatchError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BatchError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BatchError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BatchError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        BatchError::ChannelClosed
    }
}

impl From<tokio::sync::watch::error::RecvError> for BatchError {
    fn from(_: tokio::sync::watch::error::RecvError) -> Self {
        BatchError::ChannelClosed
    }
}
