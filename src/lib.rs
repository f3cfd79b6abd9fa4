pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;
pub mod planner;

pub use crate::agent_engine::engine::ControlLoop;
pub use crate::agent_engine::loop_control::CancelFlag;
pub use crate::agent_engine::state::{RunReport, RunStatus, Task};
pub use crate::errors::{DeskPilotError, DeskPilotResult};

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
