pub mod config;
pub mod error;
pub mod plan_graph;
pub mod types;

pub use config::{ConductorConfig, ConfigLoader};
pub use error::{AppError, AppErrorSummary};
pub use types::*;
