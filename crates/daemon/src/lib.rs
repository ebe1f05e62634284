// Core daemon library modules

pub mod clock;
pub mod config;
pub mod daemon_loop;
pub mod error;
pub mod force;
pub mod git;
pub mod interval;
pub mod mail;
pub mod orchestrator;
pub mod peers;
pub mod publish;
pub mod signature;
pub mod stamp;
pub mod startup;
pub mod status;
pub mod worktree;

// Re-export commonly used types
pub use config::DaemonConfig;
pub use daemon_loop::{run_daemon_loop, SchedulerLoop};
pub use interval::Schedule;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use status::{CycleKind, CycleReport};
