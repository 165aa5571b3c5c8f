use crate::cli::Command;
use std::env;

/// Execution contexts that influence how logging is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Commands driven interactively from a developer shell.
    LocalDev,
    /// Runs supervised by a remote host that scrapes the log file.
    RemoteAgent,
}

impl ExecutionContext {
    /// Returns `true` when console sinks should be disabled by default.
    pub fn disables_console(self) -> bool {
        matches!(self, ExecutionContext::RemoteAgent)
    }
}

/// Derive the active execution context from a parsed CLI command plus overrides.
pub fn detect_context(command: &Command) -> ExecutionContext {
    if remote_override_enabled() {
        return ExecutionContext::RemoteAgent;
    }

    match command {
        Command::Run(_) | Command::DryRun(_) | Command::Approvals(_) => ExecutionContext::LocalDev,
    }
}

fn remote_override_enabled() -> bool {
    env::var("CONDUCTOR_REMOTE_AGENT")
        .map(|value| matches!(value.trim(), "1" | "true"))
        .unwrap_or(false)
}
