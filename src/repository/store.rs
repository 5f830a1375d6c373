//! Record store shared by every repository backend.
//!
//! All guards live here so the in-memory and sled repositories enforce the
//! same state machines. Each mutating method validates completely before it
//! touches a record, so a rejected request leaves the store unchanged, and
//! records the keys it modified in `changes` for the backend to persist.
//! Prior values are journaled so a write the backend fails to persist can
//! be rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, ExecutionId, InstanceId, InstanceQuery, InstanceState, JobExecution, JobInstance,
    JobParameters, NewJobInstance, RemotablePartition, RemotablePartitionKey, RemotableSplitFlow,
    RemoteWorkState, RestartMode, SplitFlowKey, StepAggregate, StepExecutionId,
    StepExecutionUpdate, StepMetrics, StepThreadExecution, StepThreadInstance, StepThreadKey,
};

/// Key of a record touched by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Instance(InstanceId),
    Execution(ExecutionId),
    StepInstance(StepThreadKey),
    StepExecution(StepExecutionId),
    Partition(RemotablePartitionKey),
    SplitFlow(SplitFlowKey),
    Counters,
}

/// Prior value of a touched record; `None` means it did not exist.
#[derive(Debug)]
enum Undo {
    Instance(InstanceId, Option<JobInstance>),
    Execution(ExecutionId, Option<JobExecution>),
    StepInstance(StepThreadKey, Option<StepThreadInstance>),
    StepExecution(StepExecutionId, Option<StepThreadExecution>),
    Partition(RemotablePartitionKey, Option<RemotablePartition>),
    SplitFlow(SplitFlowKey, Option<RemotableSplitFlow>),
    Counters(Counters),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: Option<V>) {
    match value {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub last_instance_id: InstanceId,
    pub last_execution_id: ExecutionId,
    pub last_step_execution_id: StepExecutionId,
}

#[derive(Debug, Default)]
pub struct RecordStore {
    pub(crate) instances: BTreeMap<InstanceId, JobInstance>,
    pub(crate) executions: BTreeMap<ExecutionId, JobExecution>,
    pub(crate) step_instances: BTreeMap<StepThreadKey, StepThreadInstance>,
    pub(crate) step_executions: BTreeMap<StepExecutionId, StepThreadExecution>,
    pub(crate) partitions: BTreeMap<RemotablePartitionKey, RemotablePartition>,
    pub(crate) split_flows: BTreeMap<SplitFlowKey, RemotableSplitFlow>,
    pub(crate) counters: Counters,
    pub(crate) changes: Vec<Change>,
    journal: Vec<Undo>,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take_changes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.changes)
    }

    /// Save the current value of a record about to be modified.
    fn remember(&mut self, change: Change) {
        let undo = match change {
            Change::Instance(id) => Undo::Instance(id, self.instances.get(&id).cloned()),
            Change::Execution(id) => Undo::Execution(id, self.executions.get(&id).cloned()),
            Change::StepInstance(key) => {
                let prior = self.step_instances.get(&key).cloned();
                Undo::StepInstance(key, prior)
            }
            Change::StepExecution(id) => Undo::StepExecution(id, self.step_executions.get(&id).cloned()),
            Change::Partition(key) => {
                let prior = self.partitions.get(&key).cloned();
                Undo::Partition(key, prior)
            }
            Change::SplitFlow(key) => {
                let prior = self.split_flows.get(&key).cloned();
                Undo::SplitFlow(key, prior)
            }
            Change::Counters => Undo::Counters(self.counters),
        };
        self.journal.push(undo);
    }

    /// Keep everything modified since the last commit or rollback.
    pub(crate) fn commit(&mut self) {
        self.journal.clear();
    }

    /// Put back every record modified since the last commit, newest first.
    pub(crate) fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Instance(id, prior) => restore(&mut self.instances, id, prior),
                Undo::Execution(id, prior) => restore(&mut self.executions, id, prior),
                Undo::StepInstance(key, prior) => restore(&mut self.step_instances, key, prior),
                Undo::StepExecution(id, prior) => restore(&mut self.step_executions, id, prior),
                Undo::Partition(key, prior) => restore(&mut self.partitions, key, prior),
                Undo::SplitFlow(key, prior) => restore(&mut self.split_flows, key, prior),
                Undo::Counters(prior) => self.counters = prior,
            }
        }
        self.changes.clear();
    }

    // ---------------------------------------------------------------- instances

    pub fn create_job_instance(&mut self, new: NewJobInstance) -> Result<JobInstance> {
        if new.job_name.trim().is_empty() {
            return Err(BatchError::job_start("job name is empty"));
        }
        self.remember(Change::Counters);
        self.counters.last_instance_id += 1;
        let at = now();
        let instance = JobInstance {
            id: self.counters.last_instance_id,
            app_name: new.app_name,
            job_name: new.job_name,
            submitter: new.submitter,
            correlation_id: new.correlation_id,
            created_at: at,
            updated_at: at,
            state: InstanceState::Submitted,
            batch_status: None,
            group_names: new.group_names,
            restart_on: None,
            job_document: new.job_document,
            execution_count: 0,
            last_execution_id: None,
        };
        self.remember(Change::Instance(instance.id));
        self.instances.insert(instance.id, instance.clone());
        self.changes.push(Change::Counters);
        self.changes.push(Change::Instance(instance.id));
        Ok(instance)
    }

    pub fn job_instance(&self, id: InstanceId) -> Result<&JobInstance> {
        self.instances
            .get(&id)
            .ok_or(BatchError::NoSuchJobInstance { instance_id: id })
    }

    pub fn list_job_instances(&self, query: &InstanceQuery) -> Vec<JobInstance> {
        let mut matching: Vec<&JobInstance> = self
            .instances
            .values()
            .filter(|i| query.matches(i))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching
            .into_iter()
            .skip(query.page.saturating_mul(query.page_size))
            .take(query.page_size)
            .cloned()
            .collect()
    }

    pub fn update_instance_state(
        &mut self,
        id: InstanceId,
        state: InstanceState,
        batch_status: Option<BatchStatus>,
    ) -> Result<JobInstance> {
        let current = self.job_instance(id)?.state;
        if !current.can_transition_to(state) {
            return Err(BatchError::IllegalJobStatusTransition {
                instance_id: id,
                from: current,
                to: state,
            });
        }
        let instance = self.instance_mut(id)?;
        instance.state = state;
        if batch_status.is_some() {
            instance.batch_status = batch_status;
        }
        instance.updated_at = now();
        let instance = instance.clone();
        self.changes.push(Change::Instance(id));
        Ok(instance)
    }

    pub fn set_restart_on(&mut self, id: InstanceId, restart_on: Option<String>) -> Result<JobInstance> {
        let instance = self.instance_mut(id)?;
        instance.restart_on = restart_on;
        instance.updated_at = now();
        let instance = instance.clone();
        self.changes.push(Change::Instance(id));
        Ok(instance)
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut JobInstance> {
        self.remember(Change::Instance(id));
        self.instances
            .get_mut(&id)
            .ok_or(BatchError::NoSuchJobInstance { instance_id: id })
    }

    // --------------------------------------------------------------- executions

    /// Create the next execution of an instance. `expected_last` is the
    /// caller's view of the most recent execution; a mismatch means another
    /// start or restart got there first.
    pub fn create_job_execution(
        &mut self,
        instance_id: InstanceId,
        parameters: JobParameters,
        expected_last: Option<ExecutionId>,
    ) -> Result<JobExecution> {
        let (current_state, execution_count) = {
            let instance = self.job_instance(instance_id)?;
            (instance.state, instance.execution_count)
        };
        let most_recent = self.most_recent_execution(instance_id).map(|e| (e.id, e.status));

        if most_recent.map(|(id, _)| id) != expected_last {
            return Err(BatchError::ExecutionConflict {
                instance_id,
                reason: format!(
                    "most recent execution is {:?}, caller expected {:?}",
                    most_recent.map(|(id, _)| id),
                    expected_last
                ),
            });
        }

        let next_state = match most_recent {
            None => {
                if current_state.is_terminal() {
                    return Err(BatchError::IllegalJobStatusTransition {
                        instance_id,
                        from: current_state,
                        to: InstanceState::Submitted,
                    });
                }
                None
            }
            Some((id, status)) => {
                if !status.is_terminal() {
                    return Err(BatchError::ExecutionConflict {
                        instance_id,
                        reason: format!("execution {} is still {}", id, status),
                    });
                }
                if !current_state.can_transition_to(InstanceState::Submitted) {
                    return Err(BatchError::IllegalJobStatusTransition {
                        instance_id,
                        from: current_state,
                        to: InstanceState::Submitted,
                    });
                }
                Some(InstanceState::Submitted)
            }
        };

        self.remember(Change::Counters);
        self.counters.last_execution_id += 1;
        let at = now();
        let execution = JobExecution {
            id: self.counters.last_execution_id,
            instance_id,
            sequence: execution_count + 1,
            parameters,
            status: BatchStatus::Starting,
            exit_status: None,
            created_at: at,
            started_at: None,
            updated_at: at,
            ended_at: None,
            server_id: None,
            log_location: None,
        };

        let instance = self.instance_mut(instance_id)?;
        instance.execution_count = execution.sequence;
        instance.last_execution_id = Some(execution.id);
        instance.batch_status = Some(BatchStatus::Starting);
        if let Some(state) = next_state {
            instance.state = state;
        }
        instance.updated_at = at;

        self.remember(Change::Execution(execution.id));
        self.executions.insert(execution.id, execution.clone());
        self.changes.push(Change::Counters);
        self.changes.push(Change::Instance(instance_id));
        self.changes.push(Change::Execution(execution.id));
        Ok(execution)
    }

    pub fn job_execution(&self, id: ExecutionId) -> Result<&JobExecution> {
        self.executions
            .get(&id)
            .ok_or(BatchError::NoSuchJobExecution { execution_id: id })
    }

    /// Most recent execution by sequence number, never by timestamp.
    pub fn most_recent_execution(&self, instance_id: InstanceId) -> Option<&JobExecution> {
        self.executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .max_by_key(|e| e.sequence)
    }

    pub fn execution_by_sequence(&self, instance_id: InstanceId, sequence: u32) -> Result<&JobExecution> {
        self.job_instance(instance_id)?;
        self.executions
            .values()
            .find(|e| e.instance_id == instance_id && e.sequence == sequence)
            .ok_or(BatchError::NoSuchExecutionSequence {
                instance_id,
                sequence,
            })
    }

    pub fn list_job_executions(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>> {
        self.job_instance(instance_id)?;
        let mut executions: Vec<JobExecution> = self
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(executions)
    }

    /// STARTING -> STARTED, record the server, and walk the instance to RUNNING.
    pub fn update_execution_started(&mut self, id: ExecutionId, server_id: &str) -> Result<JobExecution> {
        let execution = self.job_execution(id)?;
        if execution.status != BatchStatus::Starting {
            return Err(BatchError::IllegalBatchStatusTransition {
                record: "job execution",
                id,
                from: execution.status,
                to: BatchStatus::Started,
            });
        }
        let instance_id = execution.instance_id;
        let path = self.instance_path_to_running(instance_id)?;

        let at = now();
        let execution = self.execution_mut(id)?;
        execution.status = BatchStatus::Started;
        execution.server_id = Some(server_id.to_string());
        execution.started_at = Some(at);
        execution.updated_at = at;
        let execution = execution.clone();

        let instance = self.instance_mut(instance_id)?;
        if let Some(last) = path.last() {
            instance.state = *last;
        }
        instance.batch_status = Some(BatchStatus::Started);
        instance.updated_at = at;

        self.changes.push(Change::Execution(id));
        self.changes.push(Change::Instance(instance_id));
        Ok(execution)
    }

    fn instance_path_to_running(&self, instance_id: InstanceId) -> Result<Vec<InstanceState>> {
        let mut state = self.job_instance(instance_id)?.state;
        let mut path = Vec::new();
        while state != InstanceState::Running {
            let next = match state {
                InstanceState::Submitted | InstanceState::JmsConsumed => InstanceState::Dispatched,
                InstanceState::JmsQueued => InstanceState::JmsConsumed,
                InstanceState::Dispatched => InstanceState::Running,
                other => {
                    return Err(BatchError::IllegalJobStatusTransition {
                        instance_id,
                        from: other,
                        to: InstanceState::Running,
                    })
                }
            };
            debug_assert!(state.can_transition_to(next));
            path.push(next);
            state = next;
        }
        Ok(path)
    }

    /// Guarded status change. The owning instance follows when this is its latest execution.
    pub fn update_execution_status(
        &mut self,
        id: ExecutionId,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<JobExecution> {
        let execution = self.job_execution(id)?;
        if !execution.status.can_transition_to(status) {
            return Err(BatchError::IllegalBatchStatusTransition {
                record: "job execution",
                id,
                from: execution.status,
                to: status,
            });
        }
        let instance_id = execution.instance_id;
        let instance = self.job_instance(instance_id)?;
        let follow = instance.last_execution_id == Some(id);
        let instance_state = InstanceState::for_batch_status(status)
            .filter(|s| follow && *s != instance.state);
        if let Some(next) = instance_state {
            if !instance.state.can_transition_to(next) {
                return Err(BatchError::IllegalJobStatusTransition {
                    instance_id,
                    from: instance.state,
                    to: next,
                });
            }
        }

        let at = now();
        let execution = self.execution_mut(id)?;
        execution.status = status;
        if exit_status.is_some() {
            execution.exit_status = exit_status;
        }
        if status.is_terminal() {
            execution.ended_at = Some(at);
            if execution.exit_status.is_none() {
                execution.exit_status = Some(status.as_str().to_string());
            }
        }
        execution.updated_at = at;
        let execution = execution.clone();
        self.changes.push(Change::Execution(id));

        if follow {
            let instance = self.instance_mut(instance_id)?;
            if let Some(next) = instance_state {
                instance.state = next;
            }
            instance.batch_status = Some(status);
            instance.updated_at = at;
            self.changes.push(Change::Instance(instance_id));
        }
        Ok(execution)
    }

    /// Stop an execution no server has picked up yet. Fails distinctly once a
    /// server is recorded, because the dispatch won the race.
    pub fn stop_execution_before_assigned(&mut self, id: ExecutionId) -> Result<JobExecution> {
        let execution = self.job_execution(id)?;
        if let Some(server_id) = &execution.server_id {
            return Err(BatchError::ExecutionAssignedToServer {
                execution_id: id,
                server_id: server_id.clone(),
            });
        }
        if execution.status != BatchStatus::Starting {
            return Err(BatchError::JobExecutionNotRunning {
                execution_id: id,
                status: execution.status,
            });
        }
        self.update_execution_status(id, BatchStatus::Stopped, None)
    }

    /// Log location may change even after the execution ended.
    pub fn update_execution_log_location(&mut self, id: ExecutionId, location: String) -> Result<JobExecution> {
        let execution = self.execution_mut(id)?;
        execution.log_location = Some(location);
        execution.updated_at = now();
        let execution = execution.clone();
        self.changes.push(Change::Execution(id));
        Ok(execution)
    }

    fn execution_mut(&mut self, id: ExecutionId) -> Result<&mut JobExecution> {
        self.remember(Change::Execution(id));
        self.executions
            .get_mut(&id)
            .ok_or(BatchError::NoSuchJobExecution { execution_id: id })
    }

    // ------------------------------------------------------------- step threads

    fn check_step_thread_target(&self, key: &StepThreadKey, job_execution_id: ExecutionId) -> Result<()> {
        let execution = self.job_execution(job_execution_id)?;
        if execution.instance_id != key.instance_id {
            return Err(BatchError::internal(format!(
                "step {} belongs to instance {}, execution {} to instance {}",
                key.step_name, key.instance_id, job_execution_id, execution.instance_id
            )));
        }
        if self.find_step_execution(job_execution_id, &key.step_name, key.partition).is_some() {
            return Err(BatchError::ExecutionConflict {
                instance_id: key.instance_id,
                reason: format!(
                    "step {} partition {} already has an execution in job execution {}",
                    key.step_name, key.partition, job_execution_id
                ),
            });
        }
        Ok(())
    }

    fn new_step_execution(
        &mut self,
        key: &StepThreadKey,
        job_execution_id: ExecutionId,
        restart_mode: Option<RestartMode>,
    ) -> StepThreadExecution {
        self.remember(Change::Counters);
        self.counters.last_step_execution_id += 1;
        let at = now();
        let execution = StepThreadExecution {
            id: self.counters.last_step_execution_id,
            job_execution_id,
            key: key.clone(),
            status: BatchStatus::Starting,
            exit_status: None,
            created_at: at,
            started_at: None,
            updated_at: at,
            ended_at: None,
            metrics: StepMetrics::default(),
            restart_mode,
        };
        self.remember(Change::StepExecution(execution.id));
        self.step_executions.insert(execution.id, execution.clone());
        self.changes.push(Change::Counters);
        self.changes.push(Change::StepExecution(execution.id));
        execution
    }

    /// First run of a step thread within this job instance.
    pub fn create_step_thread(
        &mut self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution> {
        self.check_step_thread_target(&key, job_execution_id)?;
        if self.step_instances.contains_key(&key) {
            return Err(BatchError::ExecutionConflict {
                instance_id: key.instance_id,
                reason: format!(
                    "step thread {} partition {} already exists",
                    key.step_name, key.partition
                ),
            });
        }
        let execution = self.new_step_execution(&key, job_execution_id, None);
        self.remember(Change::StepInstance(key.clone()));
        self.step_instances.insert(
            key.clone(),
            StepThreadInstance {
                key: key.clone(),
                checkpoint: None,
                user_data: None,
                start_count: 1,
                partition_plan_size: if key.is_top_level() { partition_plan_size } else { None },
                last_execution_id: execution.id,
            },
        );
        self.changes.push(Change::StepInstance(key));
        Ok(execution)
    }

    /// Next run of an existing step thread. RESUME keeps checkpoint and user
    /// data; CLEAN discards them and adopts the new partition plan size.
    pub fn create_step_thread_restart(
        &mut self,
        key: StepThreadKey,
        job_execution_id: ExecutionId,
        mode: RestartMode,
        partition_plan_size: Option<u32>,
    ) -> Result<StepThreadExecution> {
        if !self.step_instances.contains_key(&key) {
            return Err(BatchError::NoSuchStepThreadInstance {
                instance_id: key.instance_id,
                step_name: key.step_name.clone(),
                partition: key.partition,
            });
        }
        self.check_step_thread_target(&key, job_execution_id)?;

        let execution = self.new_step_execution(&key, job_execution_id, Some(mode));
        let top_level = key.is_top_level();
        self.remember(Change::StepInstance(key.clone()));
        let thread = self
            .step_instances
            .get_mut(&key)
            .ok_or_else(|| BatchError::internal("step thread vanished during restart"))?;
        thread.start_count += 1;
        thread.last_execution_id = execution.id;
        match mode {
            RestartMode::Resume => {
                if top_level && thread.partition_plan_size.is_none() {
                    thread.partition_plan_size = partition_plan_size;
                }
            }
            RestartMode::Clean => {
                thread.checkpoint = None;
                thread.user_data = None;
                if top_level {
                    thread.partition_plan_size = partition_plan_size;
                }
            }
        }
        self.changes.push(Change::StepInstance(key));
        Ok(execution)
    }

    pub fn step_thread_instance(&self, key: &StepThreadKey) -> Option<&StepThreadInstance> {
        self.step_instances.get(key)
    }

    /// Top-level step threads of an instance, in step-name order.
    pub fn list_step_thread_instances(&self, instance_id: InstanceId) -> Vec<StepThreadInstance> {
        self.step_instances
            .values()
            .filter(|t| t.key.instance_id == instance_id && t.key.is_top_level())
            .cloned()
            .collect()
    }

    fn step_instance_mut(&mut self, key: &StepThreadKey) -> Result<&mut StepThreadInstance> {
        self.remember(Change::StepInstance(key.clone()));
        self.step_instances
            .get_mut(key)
            .ok_or_else(|| BatchError::NoSuchStepThreadInstance {
                instance_id: key.instance_id,
                step_name: key.step_name.clone(),
                partition: key.partition,
            })
    }

    pub fn update_step_checkpoint(&mut self, key: &StepThreadKey, checkpoint: Option<Vec<u8>>) -> Result<()> {
        self.step_instance_mut(key)?.checkpoint = checkpoint;
        self.changes.push(Change::StepInstance(key.clone()));
        Ok(())
    }

    pub fn update_step_user_data(&mut self, key: &StepThreadKey, user_data: Option<Vec<u8>>) -> Result<()> {
        self.step_instance_mut(key)?.user_data = user_data;
        self.changes.push(Change::StepInstance(key.clone()));
        Ok(())
    }

    pub fn step_execution(&self, id: StepExecutionId) -> Result<&StepThreadExecution> {
        self.step_executions
            .get(&id)
            .ok_or(BatchError::NoSuchStepExecution { step_execution_id: id })
    }

    pub fn find_step_execution(
        &self,
        job_execution_id: ExecutionId,
        step_name: &str,
        partition: i32,
    ) -> Option<&StepThreadExecution> {
        self.step_executions.values().find(|s| {
            s.job_execution_id == job_execution_id
                && s.key.partition == partition
                && s.key.step_name == step_name
        })
    }

    /// Terminal step executions are immutable.
    pub fn update_step_execution(
        &mut self,
        id: StepExecutionId,
        update: StepExecutionUpdate,
    ) -> Result<StepThreadExecution> {
        let current = self.step_execution(id)?.status;
        let target = update.status.unwrap_or(current);
        let legal = if update.status.is_some() {
            current.can_transition_to(target)
        } else {
            !current.is_terminal()
        };
        if !legal {
            return Err(BatchError::IllegalBatchStatusTransition {
                record: "step execution",
                id,
                from: current,
                to: target,
            });
        }

        let at = now();
        self.remember(Change::StepExecution(id));
        let execution = self
            .step_executions
            .get_mut(&id)
            .ok_or(BatchError::NoSuchStepExecution { step_execution_id: id })?;
        if let Some(status) = update.status {
            execution.status = status;
            if status == BatchStatus::Started {
                execution.started_at = Some(at);
            }
            if status.is_terminal() {
                execution.ended_at = Some(at);
                if execution.exit_status.is_none() && update.exit_status.is_none() {
                    execution.exit_status = Some(status.as_str().to_string());
                }
            }
        }
        if update.exit_status.is_some() {
            execution.exit_status = update.exit_status;
        }
        if let Some(metrics) = update.metrics {
            execution.metrics = metrics;
        }
        execution.updated_at = at;
        let execution = execution.clone();
        self.changes.push(Change::StepExecution(id));
        Ok(execution)
    }

    /// Top-level step executions of a job execution, ordered by start time.
    pub fn list_step_executions(&self, job_execution_id: ExecutionId) -> Vec<StepThreadExecution> {
        let mut steps: Vec<StepThreadExecution> = self
            .step_executions
            .values()
            .filter(|s| s.job_execution_id == job_execution_id && s.is_top_level())
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.started_at
                .unwrap_or(a.created_at)
                .cmp(&b.started_at.unwrap_or(b.created_at))
                .then(a.id.cmp(&b.id))
        });
        steps
    }

    pub fn list_partition_executions(&self, job_execution_id: ExecutionId, step_name: &str) -> Vec<StepThreadExecution> {
        let mut partitions: Vec<StepThreadExecution> = self
            .step_executions
            .values()
            .filter(|s| {
                s.job_execution_id == job_execution_id
                    && !s.is_top_level()
                    && s.key.step_name == step_name
            })
            .cloned()
            .collect();
        partitions.sort_by_key(|s| s.key.partition);
        partitions
    }

    pub fn aggregate_step_execution(&self, job_execution_id: ExecutionId, step_name: &str) -> Result<StepAggregate> {
        let execution = self.job_execution(job_execution_id)?;
        let top_level = self
            .find_step_execution(job_execution_id, step_name, crate::model::TOP_LEVEL_PARTITION)
            .cloned()
            .ok_or_else(|| BatchError::NoSuchStepThreadInstance {
                instance_id: execution.instance_id,
                step_name: step_name.to_string(),
                partition: crate::model::TOP_LEVEL_PARTITION,
            })?;
        let partitions = self.list_partition_executions(job_execution_id, step_name);
        let metrics = if partitions.is_empty() {
            top_level.metrics
        } else {
            let mut sum = StepMetrics::default();
            for partition in &partitions {
                sum += partition.metrics;
            }
            sum
        };
        Ok(StepAggregate {
            top_level,
            partitions,
            metrics,
        })
    }

    // ------------------------------------------------------------ remote work

    pub fn create_remotable_partition(
        &mut self,
        key: RemotablePartitionKey,
        step_execution_id: StepExecutionId,
    ) -> Result<RemotablePartition> {
        let execution = self.job_execution(key.job_execution_id)?;
        if self.partitions.contains_key(&key) {
            return Err(BatchError::ExecutionConflict {
                instance_id: execution.instance_id,
                reason: format!("partition {} of {} already queued", key.partition, key.step_name),
            });
        }
        let record = RemotablePartition {
            key: key.clone(),
            step_execution_id,
            state: RemoteWorkState::Queued,
            log_location: None,
            updated_at: now(),
        };
        self.remember(Change::Partition(key.clone()));
        self.partitions.insert(key.clone(), record.clone());
        self.changes.push(Change::Partition(key));
        Ok(record)
    }

    /// Records that already completed or were recovered do not move again;
    /// late reports return the record unchanged.
    pub fn update_remotable_partition(
        &mut self,
        key: &RemotablePartitionKey,
        state: RemoteWorkState,
        log_location: Option<String>,
    ) -> Result<RemotablePartition> {
        self.remember(Change::Partition(key.clone()));
        let record = self
            .partitions
            .get_mut(key)
            .ok_or_else(|| BatchError::NoSuchRemotableWork {
                key: format!("{}:{}:{}", key.job_execution_id, key.step_name, key.partition),
            })?;
        if !record.state.is_outstanding() {
            return Ok(record.clone());
        }
        record.state = state;
        if log_location.is_some() {
            record.log_location = log_location;
        }
        record.updated_at = now();
        let record = record.clone();
        self.changes.push(Change::Partition(key.clone()));
        Ok(record)
    }

    /// Partitions of a step still owed a report, by partition number.
    pub fn list_recovery_partitions(&self, job_execution_id: ExecutionId, step_name: &str) -> Vec<RemotablePartition> {
        // BTreeMap order on (execution, step, partition) gives ascending partitions
        self.partitions
            .values()
            .filter(|p| {
                p.key.job_execution_id == job_execution_id
                    && p.key.step_name == step_name
                    && p.state.is_outstanding()
            })
            .cloned()
            .collect()
    }

    pub fn create_remotable_split_flow(&mut self, key: SplitFlowKey, split_name: &str) -> Result<RemotableSplitFlow> {
        let execution = self.job_execution(key.job_execution_id)?;
        if self.split_flows.contains_key(&key) {
            return Err(BatchError::ExecutionConflict {
                instance_id: execution.instance_id,
                reason: format!("flow {} already queued", key.flow_name),
            });
        }
        let record = RemotableSplitFlow {
            key: key.clone(),
            split_name: split_name.to_string(),
            state: RemoteWorkState::Queued,
            status: BatchStatus::Starting,
            exit_status: None,
            log_location: None,
            updated_at: now(),
        };
        self.remember(Change::SplitFlow(key.clone()));
        self.split_flows.insert(key.clone(), record.clone());
        self.changes.push(Change::SplitFlow(key));
        Ok(record)
    }

    pub fn update_remotable_split_flow(
        &mut self,
        key: &SplitFlowKey,
        state: RemoteWorkState,
        status: BatchStatus,
        exit_status: Option<String>,
    ) -> Result<RemotableSplitFlow> {
        self.remember(Change::SplitFlow(key.clone()));
        let record = self
            .split_flows
            .get_mut(key)
            .ok_or_else(|| BatchError::NoSuchRemotableWork {
                key: format!("{}:{}", key.job_execution_id, key.flow_name),
            })?;
        if !record.state.is_outstanding() {
            return Ok(record.clone());
        }
        record.state = state;
        record.status = status;
        if exit_status.is_some() {
            record.exit_status = exit_status;
        }
        record.updated_at = now();
        let record = record.clone();
        self.changes.push(Change::SplitFlow(key.clone()));
        Ok(record)
    }

    pub fn list_split_flows(&self, job_execution_id: ExecutionId) -> Vec<RemotableSplitFlow> {
        self.split_flows
            .values()
            .filter(|f| f.key.job_execution_id == job_execution_id)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------- purge

    /// Delete every record of an instance. Refused while anything is still running
    /// or a remote partition/flow has not reported.
    pub fn purge_job_instance(&mut self, instance_id: InstanceId) -> Result<()> {
        let instance = self.job_instance(instance_id)?;
        let refuse = |reason: String| BatchError::InstanceNotPurgeable {
            instance_id,
            reason,
        };
        if !instance.state.is_terminal() {
            return Err(refuse(format!("instance is {}", instance.state)));
        }
        let execution_ids: BTreeSet<ExecutionId> = self
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.id)
            .collect();
        if let Some(running) = execution_ids
            .iter()
            .filter_map(|id| self.executions.get(id))
            .find(|e| !e.status.is_terminal())
        {
            return Err(refuse(format!("execution {} is {}", running.id, running.status)));
        }
        if let Some(p) = self
            .partitions
            .values()
            .find(|p| execution_ids.contains(&p.key.job_execution_id) && p.state.is_outstanding())
        {
            return Err(refuse(format!(
                "partition {} of step {} is still {:?}",
                p.key.partition, p.key.step_name, p.state
            )));
        }
        if let Some(f) = self
            .split_flows
            .values()
            .find(|f| execution_ids.contains(&f.key.job_execution_id) && f.state.is_outstanding())
        {
            return Err(refuse(format!("flow {} is still {:?}", f.key.flow_name, f.state)));
        }

        let step_execution_ids: Vec<StepExecutionId> = self
            .step_executions
            .values()
            .filter(|s| execution_ids.contains(&s.job_execution_id))
            .map(|s| s.id)
            .collect();
        let step_keys: Vec<StepThreadKey> = self
            .step_instances
            .keys()
            .filter(|k| k.instance_id == instance_id)
            .cloned()
            .collect();
        let partition_keys: Vec<RemotablePartitionKey> = self
            .partitions
            .keys()
            .filter(|k| execution_ids.contains(&k.job_execution_id))
            .cloned()
            .collect();
        let flow_keys: Vec<SplitFlowKey> = self
            .split_flows
            .keys()
            .filter(|k| execution_ids.contains(&k.job_execution_id))
            .cloned()
            .collect();

        for id in step_execution_ids {
            self.remember(Change::StepExecution(id));
            self.step_executions.remove(&id);
            self.changes.push(Change::StepExecution(id));
        }
        for key in step_keys {
            self.remember(Change::StepInstance(key.clone()));
            self.step_instances.remove(&key);
            self.changes.push(Change::StepInstance(key));
        }
        for key in partition_keys {
            self.remember(Change::Partition(key.clone()));
            self.partitions.remove(&key);
            self.changes.push(Change::Partition(key));
        }
        for key in flow_keys {
            self.remember(Change::SplitFlow(key.clone()));
            self.split_flows.remove(&key);
            self.changes.push(Change::SplitFlow(key));
        }
        for id in execution_ids {
            self.remember(Change::Execution(id));
            self.executions.remove(&id);
            self.changes.push(Change::Execution(id));
        }
        self.remember(Change::Instance(instance_id));
        self.instances.remove(&instance_id);
        self.changes.push(Change::Instance(instance_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TOP_LEVEL_PARTITION;

    fn store_with_instance() -> (RecordStore, InstanceId) {
        let mut store = RecordStore::new();
        let instance = store
            .create_job_instance(NewJobInstance {
                job_name: "nightlyLoad".into(),
                submitter: "ops".into(),
                ..Default::default()
            })
            .unwrap();
        (store, instance.id)
    }

    #[test]
    fn test_rejected_transition_leaves_state_unchanged() {
        let (mut store, id) = store_with_instance();
        let err = store
            .update_instance_state(id, InstanceState::Completed, None)
            .unwrap_err();
        assert!(matches!(err, BatchError::IllegalJobStatusTransition { .. }));
        assert_eq!(store.job_instance(id).unwrap().state, InstanceState::Submitted);
        assert!(store.take_changes().iter().all(|c| !matches!(c, Change::Execution(_))));
    }

    #[test]
    fn test_execution_sequence_and_conflict() {
        let (mut store, id) = store_with_instance();
        let first = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        assert_eq!(first.sequence, 1);

        // a second start while the first is still STARTING loses
        let err = store
            .create_job_execution(id, JobParameters::new(), None)
            .unwrap_err();
        assert!(matches!(err, BatchError::ExecutionConflict { .. }));

        store.update_execution_started(first.id, "node-a").unwrap();
        store
            .update_execution_status(first.id, BatchStatus::Failed, None)
            .unwrap();
        assert_eq!(store.job_instance(id).unwrap().state, InstanceState::Failed);

        let second = store
            .create_job_execution(id, JobParameters::new(), Some(first.id))
            .unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(store.job_instance(id).unwrap().state, InstanceState::Submitted);
        assert_eq!(store.most_recent_execution(id).unwrap().id, second.id);
    }

    #[test]
    fn test_stop_before_assigned_race() {
        let (mut store, id) = store_with_instance();
        let execution = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        store.update_execution_started(execution.id, "node-a").unwrap();
        let err = store.stop_execution_before_assigned(execution.id).unwrap_err();
        assert!(matches!(err, BatchError::ExecutionAssignedToServer { .. }));

        let (mut store, id) = store_with_instance();
        let execution = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        let stopped = store.stop_execution_before_assigned(execution.id).unwrap();
        assert_eq!(stopped.status, BatchStatus::Stopped);
        assert_eq!(store.job_instance(id).unwrap().state, InstanceState::Stopped);
        assert!(store.update_execution_started(execution.id, "node-a").is_err());
    }

    #[test]
    fn test_step_restart_modes() {
        let (mut store, id) = store_with_instance();
        let first = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        let key = StepThreadKey::top_level(id, "load");
        store.create_step_thread(key.clone(), first.id, Some(3)).unwrap();
        store.update_step_checkpoint(&key, Some(vec![1, 2, 3])).unwrap();
        store.update_step_user_data(&key, Some(vec![9])).unwrap();
        store.update_execution_started(first.id, "n").unwrap();
        store.update_execution_status(first.id, BatchStatus::Failed, None).unwrap();

        let second = store
            .create_job_execution(id, JobParameters::new(), Some(first.id))
            .unwrap();
        let resumed = store
            .create_step_thread_restart(key.clone(), second.id, RestartMode::Resume, Some(5))
            .unwrap();
        assert_eq!(resumed.restart_mode, Some(RestartMode::Resume));
        let thread = store.step_thread_instance(&key).unwrap();
        assert_eq!(thread.checkpoint, Some(vec![1, 2, 3]));
        assert_eq!(thread.start_count, 2);
        assert_eq!(thread.partition_plan_size, Some(3));

        // exactly one execution per step per job execution
        assert!(store
            .create_step_thread_restart(key.clone(), second.id, RestartMode::Resume, None)
            .is_err());

        store.update_execution_started(second.id, "n").unwrap();
        store.update_execution_status(second.id, BatchStatus::Stopped, None).unwrap();
        let third = store
            .create_job_execution(id, JobParameters::new(), Some(second.id))
            .unwrap();
        store
            .create_step_thread_restart(key.clone(), third.id, RestartMode::Clean, Some(5))
            .unwrap();
        let thread = store.step_thread_instance(&key).unwrap();
        assert_eq!(thread.checkpoint, None);
        assert_eq!(thread.user_data, None);
        assert_eq!(thread.start_count, 3);
        assert_eq!(thread.partition_plan_size, Some(5));
    }

    #[test]
    fn test_aggregate_sums_partition_metrics() {
        let (mut store, id) = store_with_instance();
        let execution = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        store
            .create_step_thread(StepThreadKey::top_level(id, "load"), execution.id, Some(2))
            .unwrap();
        for partition in 0..2 {
            let step = store
                .create_step_thread(StepThreadKey::partition(id, "load", partition), execution.id, None)
                .unwrap();
            store
                .update_step_execution(
                    step.id,
                    StepExecutionUpdate {
                        status: Some(BatchStatus::Started),
                        metrics: Some(StepMetrics {
                            read_count: 10,
                            commit_count: 2,
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let aggregate = store.aggregate_step_execution(execution.id, "load").unwrap();
        assert_eq!(aggregate.partitions.len(), 2);
        assert_eq!(aggregate.metrics.read_count, 20);
        assert_eq!(aggregate.metrics.commit_count, 4);
        assert_eq!(aggregate.top_level.partition(), TOP_LEVEL_PARTITION);
    }

    #[test]
    fn test_terminal_step_execution_is_immutable() {
        let (mut store, id) = store_with_instance();
        let execution = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        let step = store
            .create_step_thread(StepThreadKey::top_level(id, "s"), execution.id, None)
            .unwrap();
        store
            .update_step_execution(
                step.id,
                StepExecutionUpdate {
                    status: Some(BatchStatus::Failed),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = store
            .update_step_execution(
                step.id,
                StepExecutionUpdate {
                    metrics: Some(StepMetrics::default()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::IllegalBatchStatusTransition { .. }));
    }

    #[test]
    fn test_purge_refused_with_outstanding_partition() {
        let (mut store, id) = store_with_instance();
        let execution = store.create_job_execution(id, JobParameters::new(), None).unwrap();
        let key = RemotablePartitionKey {
            job_execution_id: execution.id,
            step_name: "load".into(),
            partition: 0,
        };
        store.create_remotable_partition(key.clone(), 1).unwrap();
        store.update_execution_started(execution.id, "n").unwrap();
        store.update_execution_status(execution.id, BatchStatus::Failed, None).unwrap();

        let err = store.purge_job_instance(id).unwrap_err();
        assert!(matches!(err, BatchError::InstanceNotPurgeable { .. }));

        store
            .update_remotable_partition(&key, RemoteWorkState::Recovered, None)
            .unwrap();
        store.purge_job_instance(id).unwrap();
        assert!(store.job_instance(id).is_err());
        assert!(store.partitions.is_empty());
        assert!(store.executions.is_empty());
    }
}
