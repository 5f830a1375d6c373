use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job instance, coarser than [`BatchStatus`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Submitted = 0,
    JmsQueued = 1,
    JmsConsumed = 2,
    Dispatched = 3,
    Running = 4,
    Stopping = 5,
    Stopped = 6,
    Failed = 7,
    Completed = 8,
    Abandoned = 9,
}

impl InstanceState {
    pub const ALL: [InstanceState; 10] = [
        InstanceState::Submitted,
        InstanceState::JmsQueued,
        InstanceState::JmsConsumed,
        InstanceState::Dispatched,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Failed,
        InstanceState::Completed,
        InstanceState::Abandoned,
    ];

    /// Legal successors of this state.
    pub fn successors(self) -> &'static [InstanceState] {
        use InstanceState::*;
        match self {
            Submitted => &[JmsQueued, Dispatched, Stopping, Stopped, Failed, Abandoned],
            JmsQueued => &[JmsConsumed, Stopped, Failed, Abandoned],
            JmsConsumed => &[Dispatched, Stopped, Failed, Abandoned],
            Dispatched => &[Running, Stopping, Stopped, Failed, Abandoned],
            Running => &[Stopping, Stopped, Failed, Completed, Abandoned],
            Stopping => &[Stopped, Failed, Completed, Abandoned],
            // restart puts a stopped or failed instance back in line
            Stopped => &[Submitted, Abandoned],
            Failed => &[Submitted, Abandoned],
            Completed => &[],
            Abandoned => &[],
        }
    }

    pub fn can_transition_to(self, next: InstanceState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Stopped
                | InstanceState::Failed
                | InstanceState::Completed
                | InstanceState::Abandoned
        )
    }

    /// The instance may be restarted from this state.
    pub fn is_restartable(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Instance state that mirrors an execution reaching `status`, if any.
    pub fn for_batch_status(status: BatchStatus) -> Option<InstanceState> {
        match status {
            BatchStatus::Starting => None,
            BatchStatus::Started => Some(InstanceState::Running),
            BatchStatus::Stopping => Some(InstanceState::Stopping),
            BatchStatus::Stopped => Some(InstanceState::Stopped),
            BatchStatus::Failed => Some(InstanceState::Failed),
            BatchStatus::Completed => Some(InstanceState::Completed),
            BatchStatus::Abandoned => Some(InstanceState::Abandoned),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Submitted => "SUBMITTED",
            InstanceState::JmsQueued => "JMS_QUEUED",
            InstanceState::JmsConsumed => "JMS_CONSUMED",
            InstanceState::Dispatched => "DISPATCHED",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Failed => "FAILED",
            InstanceState::Completed => "COMPLETED",
            InstanceState::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one execution attempt (job, step or partition).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Starting = 0,
    Started = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
    Completed = 5,
    Abandoned = 6,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 7] = [
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Completed,
        BatchStatus::Abandoned,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    pub fn is_running(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        if self.is_terminal() {
            return false;
        }
        // operators may abandon anything still in flight
        if next == Abandoned {
            return true;
        }
        match self {
            Starting => matches!(next, Started | Stopping | Stopped | Failed),
            Started => matches!(next, Stopping | Stopped | Failed | Completed),
            Stopping => matches!(next, Stopped | Failed | Completed),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a previously executed step is brought back on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartMode {
    /// Carry checkpoint and user data forward.
    Resume,
    /// Discard checkpoint and user data, start the step over.
    Clean,
}

/// State of a partition or split flow that may run in another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteWorkState {
    Queued,
    Dispatched,
    Consumed,
    Completed,
    /// Superseded by a restart before it reported back.
    Recovered,
}

impl RemoteWorkState {
    /// Still owed a completion report.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            RemoteWorkState::Queued | RemoteWorkState::Dispatched | RemoteWorkState::Consumed
        )
    }
}
