//! Step bodies and the context they run with.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::{BatchError, Result};
use crate::model::{
    BatchStatus, ExecutionId, InstanceId, JobParameters, RestartMode, StepExecutionId,
    StepExecutionUpdate, StepMetrics, StepThreadKey,
};
use crate::plan::Properties;
use crate::repository::ExecutionRepository;
use crate::work_unit::StopToken;

/// Failure reported by a step body.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The step's own logic rejected its input.
    #[error("User error: {0}")]
    User(String),
    #[error("System error: {0}")]
    System(String),
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::System(err.to_string())
    }
}

impl From<BatchError> for StepError {
    fn from(err: BatchError) -> Self {
        StepError::System(err.to_string())
    }
}

/// What a step body reports when it returns normally.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: BatchStatus,
    pub exit_status: Option<String>,
}

impl StepOutcome {
    pub fn completed() -> Self {
        Self {
            status: BatchStatus::Completed,
            exit_status: None,
        }
    }

    /// The body noticed a stop request and returned early.
    pub fn stopped() -> Self {
        Self {
            status: BatchStatus::Stopped,
            exit_status: None,
        }
    }

    pub fn failed(exit_status: impl Into<String>) -> Self {
        Self {
            status: BatchStatus::Failed,
            exit_status: Some(exit_status.into()),
        }
    }

    pub fn with_exit_status(mut self, exit_status: impl Into<String>) -> Self {
        self.exit_status = Some(exit_status.into());
        self
    }
}

/// Body of a step or of one partition of a step.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: Arc<StepContext>) -> std::result::Result<StepOutcome, StepError>;
}

/// Adapter running an async closure as a step handler.
pub struct FnStep<F> {
    func: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(Arc<StepContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<StepOutcome, StepError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(Arc<StepContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<StepOutcome, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: Arc<StepContext>) -> std::result::Result<StepOutcome, StepError> {
        (self.func)(ctx).await
    }
}

/// Step handlers by name.
#[derive(Default)]
pub struct StepRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Result<()> {
        let name = name.into();
        match self.handlers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BatchError::StepHandlerAlreadyRegistered { name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| BatchError::StepHandlerNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything a step body may see or change while it runs.
pub struct StepContext {
    pub instance_id: InstanceId,
    pub job_execution_id: ExecutionId,
    pub step_execution_id: StepExecutionId,
    pub step_name: String,
    /// `TOP_LEVEL_PARTITION` for an unpartitioned step.
    pub partition: i32,
    pub parameters: Arc<JobParameters>,
    pub properties: Properties,
    /// Set when this execution was created by a restart.
    pub restart_mode: Option<RestartMode>,
    checkpoint: Mutex<Option<Vec<u8>>>,
    user_data: Mutex<Option<Vec<u8>>>,
    metrics: Mutex<StepMetrics>,
    stop: StopToken,
    repository: Arc<dyn ExecutionRepository>,
}

pub(crate) struct StepContextInit {
    pub instance_id: InstanceId,
    pub job_execution_id: ExecutionId,
    pub step_execution_id: StepExecutionId,
    pub key: StepThreadKey,
    pub parameters: Arc<JobParameters>,
    pub properties: Properties,
    pub restart_mode: Option<RestartMode>,
    pub checkpoint: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub stop: StopToken,
    pub repository: Arc<dyn ExecutionRepository>,
}

impl StepContext {
    pub(crate) fn new(init: StepContextInit) -> Self {
        Self {
            instance_id: init.instance_id,
            job_execution_id: init.job_execution_id,
            step_execution_id: init.step_execution_id,
            step_name: init.key.step_name,
            partition: init.key.partition,
            parameters: init.parameters,
            properties: init.properties,
            restart_mode: init.restart_mode,
            checkpoint: Mutex::new(init.checkpoint),
            user_data: Mutex::new(init.user_data),
            metrics: Mutex::new(StepMetrics::default()),
            stop: init.stop,
            repository: init.repository,
        }
    }

    pub fn key(&self) -> StepThreadKey {
        StepThreadKey::partition(self.instance_id, self.step_name.clone(), self.partition)
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Resolves once the step has been asked to stop.
    pub async fn stopped(&self) {
        self.stop.stopped().await
    }

    /// Last committed checkpoint; `None` on a first run or after a clean restart.
    pub fn checkpoint(&self) -> Option<Vec<u8>> {
        self.checkpoint.lock().ok().and_then(|c| c.clone())
    }

    pub fn checkpoint_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.checkpoint() {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist a checkpoint and count a commit. Metrics are written with it so
    /// a restart sees what was done up to the checkpoint.
    pub async fn commit_checkpoint(&self, checkpoint: Vec<u8>) -> Result<()> {
        self.repository
            .update_step_checkpoint(&self.key(), Some(checkpoint.clone()))
            .await?;
        if let Ok(mut slot) = self.checkpoint.lock() {
            *slot = Some(checkpoint);
        }
        let metrics = self.update_metrics(|m| m.commit_count += 1);
        self.repository
            .update_step_execution(
                self.step_execution_id,
                StepExecutionUpdate {
                    metrics: Some(metrics),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn commit_checkpoint_json<T: Serialize + Sync>(&self, checkpoint: &T) -> Result<()> {
        self.commit_checkpoint(serde_json::to_vec(checkpoint)?).await
    }

    pub fn user_data(&self) -> Option<Vec<u8>> {
        self.user_data.lock().ok().and_then(|d| d.clone())
    }

    pub async fn set_user_data(&self, data: Vec<u8>) -> Result<()> {
        self.repository
            .update_step_user_data(&self.key(), Some(data.clone()))
            .await?;
        if let Ok(mut slot) = self.user_data.lock() {
            *slot = Some(data);
        }
        Ok(())
    }

    /// Apply `f` to the running metrics and return the result.
    pub fn update_metrics(&self, f: impl FnOnce(&mut StepMetrics)) -> StepMetrics {
        match self.metrics.lock() {
            Ok(mut metrics) => {
                f(&mut metrics);
                *metrics
            }
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn metrics(&self) -> StepMetrics {
        self.update_metrics(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewJobInstance;
    use crate::repository::InMemoryRepository;

    struct Noop;

    #[async_trait]
    impl StepHandler for Noop {
        async fn execute(&self, _ctx: Arc<StepContext>) -> std::result::Result<StepOutcome, StepError> {
            Ok(StepOutcome::completed())
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = StepRegistry::new();
        registry.register("noop", Arc::new(Noop)).unwrap();
        let err = registry.register("noop", Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, BatchError::StepHandlerAlreadyRegistered { .. }));
        assert!(registry.get("missing").err().unwrap().is_not_found());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_commit_persists() {
        let repo: Arc<dyn ExecutionRepository> = Arc::new(InMemoryRepository::new());
        let instance = repo
            .create_job_instance(NewJobInstance {
                job_name: "j".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let execution = repo
            .create_job_execution(instance.id, Default::default(), None)
            .await
            .unwrap();
        let key = StepThreadKey::top_level(instance.id, "load");
        let step = repo.create_step_thread(key.clone(), execution.id, None).await.unwrap();

        let ctx = StepContext::new(StepContextInit {
            instance_id: instance.id,
            job_execution_id: execution.id,
            step_execution_id: step.id,
            key: key.clone(),
            parameters: Arc::new(Default::default()),
            properties: Default::default(),
            restart_mode: None,
            checkpoint: None,
            user_data: None,
            stop: StopToken::new(),
            repository: repo.clone(),
        });
        ctx.commit_checkpoint_json(&41u64).await.unwrap();
        ctx.commit_checkpoint_json(&42u64).await.unwrap();
        assert_eq!(ctx.checkpoint_as::<u64>().unwrap(), Some(42));

        let thread = repo.get_step_thread_instance(&key).await.unwrap().unwrap();
        assert_eq!(thread.checkpoint, Some(b"42".to_vec()));
        let step = repo.get_step_execution(step.id).await.unwrap();
        assert_eq!(step.metrics.commit_count, 2);
    }

    #[tokio::test]
    async fn test_fn_step() {
        let handler = FnStep::new(|ctx: Arc<StepContext>| async move {
            Ok(StepOutcome::completed().with_exit_status(ctx.step_name.clone()))
        });
        let registry = StepRegistry::new();
        registry.register("fn", Arc::new(handler)).unwrap();
        assert!(registry.contains("fn"));
    }
}
