//! Lifecycle facade: the operations callers use to create, start, restart,
//! stop and inspect jobs.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::dispatcher::{Dispatcher, WorkHandle};
use crate::error::{BatchError, Result};
use crate::logging;
use crate::model::{
    BatchStatus, ExecutionId, InstanceId, InstanceQuery, JobExecution, JobInstance, JobParameters,
    NewJobInstance, RemotablePartitionKey, RemoteWorkState, RestartMode, SplitFlowKey,
    StepThreadExecution, StepThreadKey,
};
use crate::partition::PartitionTransport;
use crate::plan::{ExecutionPlan, FlowDef, JobDocSource, Properties, StepDef};
use crate::repository::{ExecutionRepository, InMemoryRepository, SledRepository};
use crate::restart::RestartResolver;
use crate::step::{StepHandler, StepRegistry};
use crate::work_unit::{
    FlowCompletion, JobContext, JobWorkUnit, PartitionReply, PartitionWorkUnit, SplitFlowWorkUnit,
    WorkUnit, WorkUnitId,
};

/// Identity of a partition a caller wants to build a work unit for.
#[derive(Debug, Clone)]
pub struct PartitionPlanConfig {
    pub job_execution_id: ExecutionId,
    pub partition: i32,
    pub properties: Properties,
}

/// Identity of a split flow a caller wants to build a work unit for.
#[derive(Debug, Clone)]
pub struct SplitFlowConfig {
    pub job_execution_id: ExecutionId,
    pub split_name: String,
}

pub struct BatchKernel {
    config: Arc<KernelConfig>,
    repository: Arc<dyn ExecutionRepository>,
    steps: Arc<StepRegistry>,
    dispatcher: Arc<Dispatcher>,
    restart: RestartResolver,
}

impl BatchKernel {
    pub fn builder() -> BatchKernelBuilder {
        BatchKernelBuilder::new()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn register_step(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Result<()> {
        self.steps.register(name, handler)
    }

    /// Create an instance for `job_def_name`. The document is read once and
    /// kept on the instance for later restarts.
    pub async fn create_job_instance(
        &self,
        app_name: Option<String>,
        job_def_name: &str,
        submitter: &str,
        doc: &dyn JobDocSource,
        correlation_id: Option<String>,
    ) -> Result<JobInstance> {
        let text = doc.read_text()?;
        let plan = ExecutionPlan::from_yaml(&text)?;
        if plan.job_name != job_def_name {
            return Err(BatchError::JobDocument(format!(
                "document defines job {}, expected {}",
                plan.job_name, job_def_name
            )));
        }
        let instance = self
            .repository
            .create_job_instance(NewJobInstance {
                app_name,
                job_name: job_def_name.to_string(),
                submitter: submitter.to_string(),
                correlation_id,
                group_names: Vec::new(),
                job_document: Some(text),
            })
            .await?;
        info!(instance_id = %instance.id, job = %instance.job_name, submitter = %submitter, "Job instance created");
        Ok(instance)
    }

    fn plan_for(&self, instance: &JobInstance, doc: Option<&dyn JobDocSource>) -> Result<Option<ExecutionPlan>> {
        match doc {
            Some(doc) => doc.plan().map(Some),
            None => instance
                .job_document
                .as_deref()
                .map(ExecutionPlan::from_yaml)
                .transpose(),
        }
    }

    /// Start the first execution of an instance, or run `execution_id` if
    /// it was created ahead of time and has not been picked up.
    pub async fn start_job(
        &self,
        instance_id: InstanceId,
        doc: Option<&dyn JobDocSource>,
        parameters: JobParameters,
        execution_id: Option<ExecutionId>,
    ) -> Result<(ExecutionId, WorkHandle)> {
        let instance = self.repository.get_job_instance(instance_id).await?;
        let plan = self
            .plan_for(&instance, doc)?
            .ok_or_else(|| BatchError::job_start(format!("instance {} has no job document", instance_id)))?;

        let execution = match execution_id {
            Some(id) => {
                let execution = self.repository.get_job_execution(id).await?;
                if execution.instance_id != instance_id {
                    return Err(BatchError::job_start(format!(
                        "execution {} belongs to instance {}",
                        id, execution.instance_id
                    )));
                }
                if execution.status != BatchStatus::Starting || execution.server_id.is_some() {
                    return Err(BatchError::job_start(format!(
                        "execution {} is {} and cannot be dispatched",
                        id, execution.status
                    )));
                }
                execution
            }
            None => {
                if instance.execution_count > 0 {
                    return Err(BatchError::job_start(format!(
                        "instance {} was already started; restart it instead",
                        instance_id
                    )));
                }
                self.repository
                    .create_job_execution(instance_id, parameters, None)
                    .await?
            }
        };
        let handle = self.dispatch_job(&instance, execution.clone(), plan).await?;
        info!(instance_id = %instance_id, execution_id = %execution.id, "Job started");
        Ok((execution.id, handle))
    }

    /// Restart the instance that owns `execution_id`, which must be its most
    /// recent execution. The stored job document is reused.
    pub async fn restart_job(
        &self,
        execution_id: ExecutionId,
        overrides: JobParameters,
    ) -> Result<(ExecutionId, WorkHandle)> {
        let execution = self.repository.get_job_execution(execution_id).await?;
        self.restart_job_instance(execution.instance_id, None, overrides, Some(execution_id))
            .await
    }

    pub async fn restart_job_instance(
        &self,
        instance_id: InstanceId,
        doc: Option<&dyn JobDocSource>,
        overrides: JobParameters,
        last_execution_id: Option<ExecutionId>,
    ) -> Result<(ExecutionId, WorkHandle)> {
        let instance = self.repository.get_job_instance(instance_id).await?;
        let plan = self.plan_for(&instance, doc)?.ok_or_else(|| BatchError::JobRestart {
            instance_id,
            reason: "no job document to restart from".to_string(),
        })?;
        let resolved = self
            .restart
            .resolve(instance_id, &plan, overrides, last_execution_id)
            .await?;
        let handle = self.dispatch_job(&instance, resolved.execution.clone(), plan).await?;
        info!(
            instance_id = %instance_id,
            previous_execution_id = %resolved.previous.id,
            execution_id = %resolved.execution.id,
            "Job restarted"
        );
        Ok((resolved.execution.id, handle))
    }

    async fn dispatch_job(&self, instance: &JobInstance, execution: JobExecution, plan: ExecutionPlan) -> Result<WorkHandle> {
        let unit = JobWorkUnit {
            job: JobContext {
                instance_id: instance.id,
                execution_id: execution.id,
                parameters: Arc::new(execution.parameters.clone()),
            },
            plan: Arc::new(plan),
        };
        match self.dispatcher.submit(WorkUnit::Job(unit)) {
            Ok(handle) => Ok(handle),
            // another caller already dispatched this execution; it owns the record
            Err(BatchError::WorkUnitAlreadyRunning { .. }) => Err(BatchError::job_start(format!(
                "execution {} is already running",
                execution.id
            ))),
            Err(err) => {
                // never leave an execution nobody will run in STARTING
                if let Err(stop_err) = self.repository.stop_execution_before_assigned(execution.id).await {
                    warn!(execution_id = %execution.id, error = %stop_err, "Could not stop undispatched execution");
                }
                Err(err)
            }
        }
    }

    /// Build a partition work unit for a running job execution, creating the
    /// partition's step execution if this execution has none yet.
    pub async fn create_partition_work_unit(
        &self,
        config: PartitionPlanConfig,
        step: &StepDef,
        reply: mpsc::Sender<PartitionReply>,
        remote: bool,
    ) -> Result<PartitionWorkUnit> {
        let execution = self.repository.get_job_execution(config.job_execution_id).await?;
        let step_execution = self
            .partition_execution(&execution, &step.name, config.partition)
            .await?;
        if remote {
            let key = RemotablePartitionKey {
                job_execution_id: execution.id,
                step_name: step.name.clone(),
                partition: config.partition,
            };
            match self.repository.create_remotable_partition(key, step_execution.id).await {
                Ok(_) | Err(BatchError::ExecutionConflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(PartitionWorkUnit {
            job: JobContext {
                instance_id: execution.instance_id,
                execution_id: execution.id,
                parameters: Arc::new(execution.parameters.clone()),
            },
            step: step.clone(),
            partition: config.partition,
            step_execution_id: step_execution.id,
            properties: config.properties,
            remote,
            reply,
        })
    }

    async fn partition_execution(
        &self,
        execution: &JobExecution,
        step_name: &str,
        partition: i32,
    ) -> Result<StepThreadExecution> {
        if let Some(existing) = self
            .repository
            .find_step_execution(execution.id, step_name, partition)
            .await?
        {
            return Ok(existing);
        }
        let key = StepThreadKey::partition(execution.instance_id, step_name, partition);
        match self.repository.get_step_thread_instance(&key).await? {
            None => self.repository.create_step_thread(key, execution.id, None).await,
            Some(_) => {
                self.repository
                    .create_step_thread_restart(key, execution.id, RestartMode::Resume, None)
                    .await
            }
        }
    }

    /// Run a partition on this kernel, typically one received from a transport.
    pub fn run_partition(&self, unit: PartitionWorkUnit) -> Result<WorkHandle> {
        debug!(unit = %unit.id(), "Running partition");
        self.dispatcher.submit(WorkUnit::Partition(unit))
    }

    pub async fn create_split_flow_work_unit(
        &self,
        config: SplitFlowConfig,
        flow: FlowDef,
        completion: mpsc::Sender<FlowCompletion>,
    ) -> Result<SplitFlowWorkUnit> {
        let execution = self.repository.get_job_execution(config.job_execution_id).await?;
        let key = SplitFlowKey {
            job_execution_id: execution.id,
            flow_name: flow.name.clone(),
        };
        match self
            .repository
            .create_remotable_split_flow(key, &config.split_name)
            .await
        {
            Ok(_) | Err(BatchError::ExecutionConflict { .. }) => {}
            Err(err) => return Err(err),
        }
        Ok(SplitFlowWorkUnit {
            job: JobContext {
                instance_id: execution.instance_id,
                execution_id: execution.id,
                parameters: Arc::new(execution.parameters.clone()),
            },
            split_name: config.split_name,
            flow,
            completion,
        })
    }

    pub fn run_split_flow(&self, unit: SplitFlowWorkUnit) -> Result<WorkHandle> {
        debug!(unit = %unit.id(), "Running split flow");
        self.dispatcher.submit(WorkUnit::SplitFlow(unit))
    }

    /// Ask a job execution to stop. Stopping a terminal execution is an error,
    /// even while its work unit is still winding down.
    pub async fn stop_job(&self, execution_id: ExecutionId) -> Result<()> {
        let execution = self.repository.get_job_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(BatchError::JobExecutionNotRunning {
                execution_id,
                status: execution.status,
            });
        }
        let unit = WorkUnitId::Job(execution_id);

        if self.dispatcher.request_stop(&unit) {
            return self.mark_stopping(execution_id).await;
        }
        match self.repository.stop_execution_before_assigned(execution_id).await {
            Ok(_) => {
                info!(execution_id = %execution_id, "Job stopped before dispatch");
                Ok(())
            }
            Err(BatchError::ExecutionAssignedToServer { server_id, .. }) => {
                debug!(execution_id = %execution_id, server_id = %server_id, "Stop raced with dispatch");
                self.dispatcher.request_stop(&unit);
                self.mark_stopping(execution_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Record STOPPING after a stop was delivered. STOPPED means the stop
    /// already took effect; any other terminal status means the job ended
    /// before the stop reached it.
    async fn mark_stopping(&self, execution_id: ExecutionId) -> Result<()> {
        let mut status = self.repository.get_job_execution(execution_id).await?.status;
        if matches!(status, BatchStatus::Starting | BatchStatus::Started) {
            match self
                .repository
                .update_execution_status(execution_id, BatchStatus::Stopping, None)
                .await
            {
                Ok(execution) => status = execution.status,
                Err(BatchError::IllegalBatchStatusTransition { .. }) => {
                    status = self.repository.get_job_execution(execution_id).await?.status;
                }
                Err(err) => return Err(err),
            }
        }
        match status {
            BatchStatus::Stopping | BatchStatus::Stopped => {
                info!(execution_id = %execution_id, status = %status, "Job stop requested");
                Ok(())
            }
            status if status.is_terminal() => {
                debug!(execution_id = %execution_id, status = %status, "Stop arrived after the job ended");
                Err(BatchError::JobExecutionNotRunning { execution_id, status })
            }
            status => Err(BatchError::internal(format!(
                "execution {} still {} after a stop request",
                execution_id, status
            ))),
        }
    }

    /// In-flight status from the dispatcher, else the repository's record.
    pub async fn get_batch_status(&self, execution_id: ExecutionId) -> Result<BatchStatus> {
        if let Some(status) = self.dispatcher.in_flight_status(&WorkUnitId::Job(execution_id)) {
            return Ok(status);
        }
        Ok(self.repository.get_job_execution(execution_id).await?.status)
    }

    pub async fn get_job_instance(&self, instance_id: InstanceId) -> Result<JobInstance> {
        self.repository.get_job_instance(instance_id).await
    }

    pub async fn get_job_execution(&self, execution_id: ExecutionId) -> Result<JobExecution> {
        self.repository.get_job_execution(execution_id).await
    }

    pub async fn list_job_instances(&self, query: &InstanceQuery) -> Result<Vec<JobInstance>> {
        self.repository.list_job_instances(query).await
    }

    pub async fn list_job_executions(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>> {
        self.repository.list_job_executions(instance_id).await
    }

    pub async fn list_step_executions(&self, execution_id: ExecutionId) -> Result<Vec<StepThreadExecution>> {
        self.repository.list_step_executions(execution_id).await
    }

    /// Delete an instance and its history. Refused while any of its
    /// executions runs here.
    pub async fn purge_job_instance(&self, instance_id: InstanceId) -> Result<()> {
        for execution in self.repository.list_job_executions(instance_id).await? {
            if self.dispatcher.is_in_flight(&WorkUnitId::Job(execution.id)) {
                return Err(BatchError::InstanceNotPurgeable {
                    instance_id,
                    reason: format!("execution {} is running", execution.id),
                });
            }
        }
        self.repository.purge_job_instance(instance_id).await?;
        info!(instance_id = %instance_id, "Job instance purged");
        Ok(())
    }

    /// Force a stalled execution to ABANDONED. Executions running on this
    /// kernel must be stopped instead.
    pub async fn abandon_job_execution(&self, execution_id: ExecutionId) -> Result<JobExecution> {
        let execution = self.repository.get_job_execution(execution_id).await?;
        if self.dispatcher.is_in_flight(&WorkUnitId::Job(execution_id)) {
            return Err(BatchError::ExecutionConflict {
                instance_id: execution.instance_id,
                reason: format!("execution {} is running on this server", execution_id),
            });
        }
        let execution = self
            .repository
            .update_execution_status(execution_id, BatchStatus::Abandoned, None)
            .await?;
        warn!(execution_id = %execution_id, "Job execution abandoned");
        Ok(execution)
    }

    /// Mark remote partitions of `execution_id` that never reported as
    /// recovered. Restarts do this automatically.
    pub async fn recover_partitions(&self, execution_id: ExecutionId, step_name: &str) -> Result<usize> {
        let outstanding = self
            .repository
            .list_recovery_partitions(execution_id, step_name)
            .await?;
        for record in &outstanding {
            self.repository
                .update_remotable_partition(&record.key, RemoteWorkState::Recovered, None)
                .await?;
        }
        Ok(outstanding.len())
    }

    /// Stop everything in flight, wait up to `shutdown_timeout`, then flush
    /// the repository.
    pub async fn shutdown(&self) -> Result<()> {
        let remaining = self.dispatcher.shutdown().await;
        self.repository.flush().await?;
        if remaining > 0 {
            warn!(remaining, "Kernel shut down with work still running");
        } else {
            info!("Kernel shut down");
        }
        Ok(())
    }
}

/// Builder for BatchKernel
pub struct BatchKernelBuilder {
    config: Option<KernelConfig>,
    repository: Option<Arc<dyn ExecutionRepository>>,
    handlers: Vec<(String, Arc<dyn StepHandler>)>,
    transport: Option<Arc<dyn PartitionTransport>>,
    init_logging: bool,
}

impl BatchKernelBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            repository: None,
            handlers: Vec::new(),
            transport: None,
            init_logging: false,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this repository instead of one derived from `db_path`.
    pub fn repository(mut self, repository: Arc<dyn ExecutionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn step(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PartitionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Install the tracing subscriber at the configured level.
    pub fn with_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    pub fn build(self) -> Result<BatchKernel> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        if self.init_logging {
            logging::init_tracing(&config.log_level);
        }

        let repository: Arc<dyn ExecutionRepository> = match (self.repository, &config.db_path) {
            (Some(repository), _) => repository,
            (None, Some(path)) => Arc::new(SledRepository::open(path)?),
            (None, None) => Arc::new(InMemoryRepository::new()),
        };

        let steps = Arc::new(StepRegistry::new());
        for (name, handler) in self.handlers {
            steps.register(name, handler)?;
        }

        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(
            repository.clone(),
            steps.clone(),
            config.clone(),
            self.transport,
        ));
        info!(server_id = %config.server_id, max_concurrent_jobs = config.max_concurrent_jobs, "Batch kernel ready");
        Ok(BatchKernel {
            restart: RestartResolver::new(repository.clone()),
            config,
            repository,
            steps,
            dispatcher,
        })
    }
}

impl Default for BatchKernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
