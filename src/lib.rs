//! Batch job execution kernel: job, step, partition and split-flow
//! lifecycles on top of a durable execution repository.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod model;
pub mod partition;
pub mod plan;
pub mod repository;
pub mod restart;
mod runner;
pub(crate) mod split_flow;
pub mod step;
pub mod work_unit;

pub use config::{KernelConfig, KernelConfigBuilder};
pub use dispatcher::{Dispatcher, WorkHandle};
pub use error::{BatchError, ErrorKind, Result};
pub use kernel::{BatchKernel, BatchKernelBuilder, PartitionPlanConfig, SplitFlowConfig};
pub use logging::init_tracing;
pub use model::*;
pub use partition::{aggregate_status, PartitionTransport};
pub use plan::{
    ExecutionPlan, FlowDef, JobDocSource, PartitionPlan, PlanElement, Properties, SplitDef, StepDef,
    StreamJobDoc, YamlJobDoc,
};
pub use repository::{ExecutionRepository, InMemoryRepository, SledRepository};
pub use restart::{RestartAction, RestartResolver, ResolvedRestart, StepRestartDecision};
pub use step::{FnStep, StepContext, StepError, StepHandler, StepOutcome, StepRegistry};
pub use work_unit::{
    FlowCompletion, JobContext, JobWorkUnit, PartitionReply, PartitionWorkUnit, SplitFlowWorkUnit, StopToken,
    WorkUnit, WorkUnitId,
};
