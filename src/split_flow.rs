use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, UnitResult};
use crate::error::{BatchError, Result};
use crate::model::{BatchStatus, RemoteWorkState, SplitFlowKey};
use crate::partition::aggregate_status;
use crate::plan::SplitDef;
use crate::work_unit::{JobContext, SplitFlowWorkUnit, StopToken, WorkUnit, WorkUnitId};

/// Runs the flows of a split side by side and joins them. A failed flow
/// does not cancel its siblings; the job sees the combined status.
pub(crate) struct SplitFlowCoordinator {
    dispatcher: Arc<Dispatcher>,
    job: JobContext,
}

impl SplitFlowCoordinator {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, job: JobContext) -> Self {
        Self { dispatcher, job }
    }

    fn flow_id(&self, flow_name: &str) -> WorkUnitId {
        WorkUnitId::SplitFlow {
            job_execution_id: self.job.execution_id,
            flow_name: flow_name.to_string(),
        }
    }

    pub(crate) async fn run(&self, split: &SplitDef, stop: &StopToken) -> Result<UnitResult> {
        let repo = self.dispatcher.repository();
        let config = self.dispatcher.config();
        let (completion_tx, mut completion_rx) = mpsc::channel(split.flows.len().max(1));

        info!(
            execution_id = %self.job.execution_id,
            split = %split.name,
            flows = split.flows.len(),
            "Split starting"
        );

        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut statuses = Vec::with_capacity(split.flows.len());
        for flow in &split.flows {
            if stop.is_stop_requested() {
                statuses.push(BatchStatus::Stopped);
                continue;
            }
            let key = SplitFlowKey {
                job_execution_id: self.job.execution_id,
                flow_name: flow.name.clone(),
            };
            repo.create_remotable_split_flow(key.clone(), &split.name).await?;
            repo.update_remotable_split_flow(&key, RemoteWorkState::Dispatched, BatchStatus::Starting, None)
                .await?;
            let unit = SplitFlowWorkUnit {
                job: self.job.clone(),
                split_name: split.name.clone(),
                flow: flow.clone(),
                completion: completion_tx.clone(),
            };
            match self.dispatcher.submit(WorkUnit::SplitFlow(unit)) {
                Ok(_) => {
                    running.insert(flow.name.clone());
                }
                Err(BatchError::SystemShutdown) => {
                    repo.update_remotable_split_flow(&key, RemoteWorkState::Completed, BatchStatus::Stopped, None)
                        .await?;
                    statuses.push(BatchStatus::Stopped);
                }
                Err(err) => return Err(err),
            }
        }

        let mut exit_status = None;
        let mut stopping = false;
        let mut grace_deadline = Instant::now();
        while !running.is_empty() {
            tokio::select! {
                completion = completion_rx.recv() => {
                    let Some(completion) = completion else { break };
                    running.remove(&completion.flow_name);
                    debug!(flow = %completion.flow_name, status = %completion.status, "Flow joined");
                    if completion.status == BatchStatus::Failed && exit_status.is_none() {
                        exit_status = completion.exit_status.clone();
                    }
                    statuses.push(completion.status);
                }
                _ = stop.stopped(), if !stopping => {
                    stopping = true;
                    grace_deadline = Instant::now() + config.stop_grace_period;
                    for flow in &running {
                        self.dispatcher.request_stop(&self.flow_id(flow));
                    }
                }
                _ = sleep_until(grace_deadline), if stopping => {
                    warn!(
                        split = %split.name,
                        flows = ?running,
                        grace = ?config.stop_grace_period,
                        "Flows did not acknowledge stop in time"
                    );
                    statuses.extend(running.iter().map(|_| BatchStatus::Stopped));
                    break;
                }
            }
        }

        let status = aggregate_status(&statuses);
        info!(execution_id = %self.job.execution_id, split = %split.name, status = %status, "Split finished");
        Ok(UnitResult::new(status, exit_status))
    }
}
