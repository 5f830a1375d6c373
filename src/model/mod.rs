//! Records and status machines shared by the repository, dispatcher and coordinators.

pub mod records;
pub mod status;

pub use records::*;
pub use status::{BatchStatus, InstanceState, RemoteWorkState, RestartMode};
