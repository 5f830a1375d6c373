//! Execution repository: the durable source of truth for instances,
//! executions, step threads and remotable work.

mod memory;
mod sled_store;
mod store;

pub use memory::{InMemoryRepository, NullSink};
pub use sled_store::{SledRepository, SledSink};
pub use store::{Change, RecordStore};

use async_trait::async_trait;
use std::sync::RwLock;
use tracing::warn;

use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, ExecutionId, InstanceId, InstanceQuery, InstanceState, JobExecution, JobInstance,
    JobParameters, NewJobInstance, RemotablePartition, RemotablePartitionKey, RemotableSplitFlow,
    RemoteWorkState, RestartMode, SplitFlowKey, StepAggregate, StepExecutionId,
    StepExecutionUpdate, StepThreadExecution, StepThreadInstance, StepThreadKey,
};

/// Repository contract used by the kernel. Every mutating call is atomic:
/// it either applies completely or fails without side effects.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Create a job instance in SUBMITTED state
    async fn create_job_instance(&self, new: NewJobInstance) -> Result<JobInstance>;

    async fn get_job_instance(&self, id: InstanceId) -> Result<JobInstance>;

    /// Instances matching the query, most recently created first
    async fn list_job_instances(&self, query: &InstanceQuery) -> Result<Vec<JobInstance>>;

    /// Guarded instance state change
    async fn update_instance_state(
        &self,
        id: InstanceId,
        state: InstanceState,
        batch_status: Option<BatchStatus>,
    ) -> Result<JobInstance>;

    async fn update_instance_restart_on(&self, id: InstanceId, restart_on: Option<String>) -> Result<JobInstance>;

    /// Create the next execution; fails with a conflict if `expected_last`
    /// is not the current most recent execution
    async fn create_job_execution(
        &self,
        instance_id: InstanceId,
        parameters: JobParameters,
        expected_last: Option<ExecutionId>,
    ) -> Result<JobExecution>;

    async fn get_job_execution(&self, id: ExecutionId) -> Result<JobExecution>;

    /// Highest-sequence execution of an instance
    async fn get_most_recent_execution(&self, instance_id: InstanceId) -> Result<JobExecution>;

    async fn get_execution_by_sequence(&self, instance_id: InstanceId, sequence: u32) -> Result<JobExecution>;

    /// All executions, most recent first
    async fn list_job_executions(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>>;

    /// Mark an execution started on `server_id`
    async fn update_execution_started(&self, id: ExecutionId, server_id: &str) -> Result<JobExecution>;

    /// Guarded status change mirrored onto the owning instance
    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<JobExecution>;

    /// Stop an execution that no server has picked up yet
    async fn stop_execution_before_assigned(&self, id: ExecutionId) -> Result<JobExecution>;

    async fn update_execution_log_location(&self, id: ExecutionId, location: String) -> Result<JobExecution>;

    /// First execution of a step thread
    async fn create_step_thread(
        &self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution>;

    /// Next execution of an existing step thread
    async fn create_step_thread_restart(
        &self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        mode: RestartMode,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution>;

    async fn get_step_thread_instance(&self, key: &StepThreadKey) -> Result<Option<StepThreadInstance>>;

    /// Top-level step threads of an instance
    async fn list_step_thread_instances(&self, instance_id: InstanceId) -> Result<Vec<StepThreadInstance>>;

    async fn update_step_checkpoint(&self, key: &StepThreadKey, checkpoint: Option<Vec<u8>>) -> Result<()>;

    async fn update_step_user_data(&self, key: &StepThreadKey, user_data: Option<Vec<u8>>) -> Result<()>;

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<StepThreadExecution>;

    async fn find_step_execution(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
        partition: i32,
    ) -> Result<Option<StepThreadExecution>>;

    async fn update_step_execution(
        &self,
        id: StepExecutionId,
        update: StepExecutionUpdate,
    ) -> Result<StepThreadExecution>;

    /// Top-level step executions, ordered by start time
    async fn list_step_executions(&self, job_execution_id: ExecutionId) -> Result<Vec<StepThreadExecution>>;

    async fn list_partition_executions(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
    ) -> Result<Vec<StepThreadExecution>>;

    /// Top-level execution joined with its partitions, metrics summed
    async fn aggregate_step_execution(&self, job_execution_id: ExecutionId, step_name: &str) -> Result<StepAggregate>;

    async fn create_remotable_partition(
        &self,
        key: RemotablePartitionKey,
        step_execution_id: StepExecutionId,
    ) -> Result<RemotablePartition>;

    async fn update_remotable_partition(
        &self,
        key: &RemotablePartitionKey,
        state: RemoteWorkState,
        log_location: Option<String>,
    ) -> Result<RemotablePartition>;

    /// Partitions still owed a completion report, by partition number
    async fn list_recovery_partitions(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
    ) -> Result<Vec<RemotablePartition>>;

    async fn create_remotable_split_flow(&self, key: SplitFlowKey, split_name: &str) -> Result<RemotableSplitFlow>;

    async fn update_remotable_split_flow(
        &self,
        key: &SplitFlowKey,
        state: RemoteWorkState,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<RemotableSplitFlow>;

    async fn list_split_flows(&self, job_execution_id: ExecutionId) -> Result<Vec<RemotableSplitFlow>>;

    /// Remove an instance and everything it owns
    async fn purge_job_instance(&self, instance_id: InstanceId) -> Result<()>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()>;
}

/// Where a [`StoreRepository`] writes the records a mutation touched.
pub trait RecordSink: Send + Sync {
    fn persist(&self, store: &RecordStore, changes: &[Change]) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Repository backed by a [`RecordStore`] under one lock. The sink sees
/// each mutation's changes while the write lock is still held, so the
/// durable order matches the in-memory order.
pub struct StoreRepository<S: RecordSink> {
    store: RwLock<RecordStore>,
    sink: S,
}

impl<S: RecordSink> StoreRepository<S> {
    pub fn with_sink(store: RecordStore, sink: S) -> Self {
        Self {
            store: RwLock::new(store),
            sink,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&RecordStore) -> Result<T>) -> Result<T> {
        let store = self
            .store
            .read()
            .map_err(|_| BatchError::storage("record store lock poisoned"))?;
        f(&store)
    }

    fn write<T>(&self, f: impl FnOnce(&mut RecordStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .store
            .write()
            .map_err(|_| BatchError::storage("record store lock poisoned"))?;
        let result = f(&mut store);
        let changes = store.take_changes();
        if result.is_err() {
            store.rollback();
            return result;
        }
        if !changes.is_empty() {
            if let Err(err) = self.sink.persist(&store, &changes) {
                warn!(changes = changes.len(), error = %err, "Persist failed, rolling back record changes");
                store.rollback();
                return Err(err);
            }
        }
        store.commit();
        result
    }
}

#[async_trait]
impl<S: RecordSink> ExecutionRepository for StoreRepository<S> {
    async fn create_job_instance(&self, new: NewJobInstance) -> Result<JobInstance> {
        self.write(|s| s.create_job_instance(new))
    }

    async fn get_job_instance(&self, id: InstanceId) -> Result<JobInstance> {
        self.read(|s| s.job_instance(id).cloned())
    }

    async fn list_job_instances(&self, query: &InstanceQuery) -> Result<Vec<JobInstance>> {
        self.read(|s| Ok(s.list_job_instances(query)))
    }

    async fn update_instance_state(
        &self,
        id: InstanceId,
        state: InstanceState,
        batch_status: Option<BatchStatus>,
    ) -> Result<JobInstance> {
        self.write(|s| s.update_instance_state(id, state, batch_status))
    }

    async fn update_instance_restart_on(&self, id: InstanceId, restart_on: Option<String>) -> Result<JobInstance> {
        self.write(|s| s.set_restart_on(id, restart_on))
    }

    async fn create_job_execution(
        &self,
        instance_id: InstanceId,
        parameters: JobParameters,
        expected_last: Option<ExecutionId>,
    ) -> Result<JobExecution> {
        self.write(|s| s.create_job_execution(instance_id, parameters, expected_last))
    }

    async fn get_job_execution(&self, id: ExecutionId) -> Result<JobExecution> {
        self.read(|s| s.job_execution(id).cloned())
    }

    async fn get_most_recent_execution(&self, instance_id: InstanceId) -> Result<JobExecution> {
        self.read(|s| {
            s.job_instance(instance_id)?;
            s.most_recent_execution(instance_id)
                .cloned()
                .ok_or(BatchError::NoJobExecutions { instance_id })
        })
    }

    async fn get_execution_by_sequence(&self, instance_id: InstanceId, sequence: u32) -> Result<JobExecution> {
        self.read(|s| s.execution_by_sequence(instance_id, sequence).cloned())
    }

    async fn list_job_executions(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>> {
        self.read(|s| s.list_job_executions(instance_id))
    }

    async fn update_execution_started(&self, id: ExecutionId, server_id: &str) -> Result<JobExecution> {
        self.write(|s| s.update_execution_started(id, server_id))
    }

    async fn update_execution_status(
        &self,
        id: ExecutionId,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<JobExecution> {
        self.write(|s| s.update_execution_status(id, status, exit_status))
    }

    async fn stop_execution_before_assigned(&self, id: ExecutionId) -> Result<JobExecution> {
        self.write(|s| s.stop_execution_before_assigned(id))
    }

    async fn update_execution_log_location(&self, id: ExecutionId, location: String) -> Result<JobExecution> {
        self.write(|s| s.update_execution_log_location(id, location))
    }

    async fn create_step_thread(
        &self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution> {
        self.write(|s| s.create_step_thread(key, job_execution_id, partition_plan_size))
    }

    async fn create_step_thread_restart(
        &self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        mode: RestartMode,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution> {
        self.write(|s| s.create_step_thread_restart(key, job_execution_id, mode, partition_plan_size))
    }

    async fn get_step_thread_instance(&self, key: &StepThreadKey) -> Result<Option<StepThreadInstance>> {
        self.read(|s| Ok(s.step_thread_instance(key).cloned()))
    }

    async fn list_step_thread_instances(&self, instance_id: InstanceId) -> Result<Vec<StepThreadInstance>> {
        self.read(|s| Ok(s.list_step_thread_instances(instance_id)))
    }

    async fn update_step_checkpoint(&self, key: &StepThreadKey, checkpoint: Option<Vec<u8>>) -> Result<()> {
        self.write(|s| s.update_step_checkpoint(key, checkpoint))
    }

    async fn update_step_user_data(&self, key: &StepThreadKey, user_data: Option<Vec<u8>>) -> Result<()> {
        self.write(|s| s.update_step_user_data(key, user_data))
    }

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<StepThreadExecution> {
        self.read(|s| s.step_execution(id).cloned())
    }

    async fn find_step_execution(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
        partition: i32,
    ) -> Result<Option<StepThreadExecution>> {
        self.read(|s| Ok(s.find_step_execution(job_execution_id, step_name, partition).cloned()))
    }

    async fn update_step_execution(
        &self,
        id: StepExecutionId,
        update: StepExecutionUpdate,
    ) -> Result<StepThreadExecution> {
        self.write(|s| s.update_step_execution(id, update))
    }

    async fn list_step_executions(&self, job_execution_id: ExecutionId) -> Result<Vec<StepThreadExecution>> {
        self.read(|s| Ok(s.list_step_executions(job_execution_id)))
    }

    async fn list_partition_executions(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
    ) -> Result<Vec<StepThreadExecution>> {
        self.read(|s| Ok(s.list_partition_executions(job_execution_id, step_name)))
    }

    async fn aggregate_step_execution(&self, job_execution_id: ExecutionId, step_name: &str) -> Result<StepAggregate> {
        self.read(|s| s.aggregate_step_execution(job_execution_id, step_name))
    }

    async fn create_remotable_partition(
        &self,
        key: RemotablePartitionKey,
        step_execution_id: StepExecutionId,
    ) -> Result<RemotablePartition> {
        self.write(|s| s.create_remotable_partition(key, step_execution_id))
    }

    async fn update_remotable_partition(
        &self,
        key: &RemotablePartitionKey,
        state: RemoteWorkState,
        log_location: Option<String>,
    ) -> Result<RemotablePartition> {
        self.write(|s| s.update_remotable_partition(key, state, log_location))
    }

    async fn list_recovery_partitions(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
    ) -> Result<Vec<RemotablePartition>> {
        self.read(|s| Ok(s.list_recovery_partitions(job_execution_id, step_name)))
    }

    async fn create_remotable_split_flow(&self, key: SplitFlowKey, split_name: &str) -> Result<RemotableSplitFlow> {
        self.write(|s| s.create_remotable_split_flow(key, split_name))
    }

    async fn update_remotable_split_flow(
        &self,
        key: &SplitFlowKey,
        state: RemoteWorkState,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<RemotableSplitFlow> {
        self.write(|s| s.update_remotable_split_flow(key, state, status, exit_status))
    }

    async fn list_split_flows(&self, job_execution_id: ExecutionId) -> Result<Vec<RemotableSplitFlow>> {
        self.read(|s| Ok(s.list_split_flows(job_execution_id)))
    }

    async fn purge_job_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.write(|s| s.purge_job_instance(instance_id))
    }

    async fn flush(&self) -> Result<()> {
        self.sink.flush()
    }
}
