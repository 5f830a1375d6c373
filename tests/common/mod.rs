//! Shared step handlers and kernel setup for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use batchkernel::{
    BatchKernel, ExecutionPlan, KernelConfig, StepContext, StepError, StepHandler, StepOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    batchkernel::init_tracing("debug");
}

pub fn test_config() -> KernelConfig {
    KernelConfig::builder()
        .server_id("test-server")
        .max_concurrent_jobs(8)
        .partition_reply_timeout(Duration::from_secs(5))
        .stop_grace_period(Duration::from_secs(2))
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

pub fn kernel(handlers: Vec<(&str, Arc<dyn StepHandler>)>) -> BatchKernel {
    kernel_with_config(test_config(), handlers)
}

pub fn kernel_with_config(config: KernelConfig, handlers: Vec<(&str, Arc<dyn StepHandler>)>) -> BatchKernel {
    init_logging();
    let mut builder = BatchKernel::builder().config(config);
    for (name, handler) in handlers {
        builder = builder.step(name, handler);
    }
    builder.build().unwrap()
}

/// Create an instance for `plan` with a fixed submitter.
pub async fn instance_for(kernel: &BatchKernel, plan: &ExecutionPlan) -> u64 {
    kernel
        .create_job_instance(None, &plan.job_name, "tester", plan, None)
        .await
        .unwrap()
        .id
}

/// Completes immediately and counts invocations.
#[derive(Default)]
pub struct CountingStep {
    pub calls: AtomicUsize,
}

impl CountingStep {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for CountingStep {
    async fn execute(&self, ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.update_metrics(|m| m.read_count += 1);
        Ok(StepOutcome::completed())
    }
}

/// Fails with a user error.
pub struct FailingStep(pub &'static str);

#[async_trait]
impl StepHandler for FailingStep {
    async fn execute(&self, _ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        Err(StepError::User(self.0.to_string()))
    }
}

pub struct PanickingStep;

#[async_trait]
impl StepHandler for PanickingStep {
    async fn execute(&self, _ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        panic!("reader exploded");
    }
}

/// Runs until asked to stop. `started` counts entries so tests can wait
/// for the body to be running.
#[derive(Default)]
pub struct UntilStoppedStep {
    pub started: AtomicUsize,
}

#[async_trait]
impl StepHandler for UntilStoppedStep {
    async fn execute(&self, ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.stopped().await;
        Ok(StepOutcome::stopped())
    }
}

/// Sleeps for the `delay_ms` property, then records its partition.
/// Fails when the `fail` property is set.
#[derive(Default)]
pub struct DelayStep {
    pub finished: Mutex<Vec<i32>>,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl DelayStep {
    pub fn finished(&self) -> Vec<i32> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for DelayStep {
    async fn execute(&self, ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let delay = ctx
            .property("delay_ms")
            .and_then(|d| d.parse::<u64>().ok())
            .unwrap_or(0);
        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                if let Some(reason) = ctx.property("fail") {
                    StepOutcome::failed(reason)
                } else {
                    ctx.update_metrics(|m| {
                        m.read_count += 10;
                        m.write_count += 10;
                    });
                    StepOutcome::completed()
                }
            }
            _ = ctx.stopped() => StepOutcome::stopped(),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().unwrap().push(ctx.partition);
        Ok(outcome)
    }
}

/// Processes items 0..`items`, committing a checkpoint after each one.
/// Fails once on the item named by the `fail_at` parameter; each item is
/// recorded so tests can see what was processed twice.
#[derive(Default)]
pub struct CheckpointStep {
    pub processed: Mutex<Vec<u64>>,
}

impl CheckpointStep {
    pub fn processed(&self) -> Vec<u64> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for CheckpointStep {
    async fn execute(&self, ctx: Arc<StepContext>) -> Result<StepOutcome, StepError> {
        let items: u64 = ctx.parameter("items").and_then(|v| v.parse().ok()).unwrap_or(5);
        let fail_at: Option<u64> = ctx.parameter("fail_at").and_then(|v| v.parse().ok());
        let start = ctx.checkpoint_as::<u64>()?.unwrap_or(0);

        for item in start..items {
            if Some(item) == fail_at {
                return Err(StepError::System(format!("item {} is corrupt", item)));
            }
            self.processed.lock().unwrap().push(item);
            ctx.update_metrics(|m| m.write_count += 1);
            ctx.commit_checkpoint_json(&(item + 1)).await?;
        }
        Ok(StepOutcome::completed())
    }
}

/// Poll until `f` holds or a second passes.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
