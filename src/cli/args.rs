use clap::{ArgGroup, Args, Subcommand};
use std::path::PathBuf;

#[derive(Args)]
pub struct RunArgs {
    /// Plan document (.json, .yaml or .yml)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// Workspace holding conductor.toml and the .conductor directory (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Path to custom config file (default: {workspace}/conductor.toml)
    #[arg(long, value_name = "FILE", help_heading = "Configuration")]
    pub config: Option<PathBuf>,

    /// Seed shared state; VALUE is parsed as JSON and falls back to a plain string
    #[arg(long = "state", value_name = "KEY=VALUE", help_heading = "Shared State")]
    pub state: Vec<String>,

    /// Continue from the plan's last checkpoint instead of the entry node
    #[arg(long, help_heading = "Checkpoints")]
    pub resume: bool,
}

#[derive(Args)]
pub struct DryRunArgs {
    /// Plan document (.json, .yaml or .yml)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// Workspace holding conductor.toml (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Path to custom config file (default: {workspace}/conductor.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report warnings as if no approval controller were configured
    #[arg(long)]
    pub without_approvals: bool,
}

#[derive(Args)]
pub struct ApprovalsArgs {
    #[command(subcommand)]
    pub command: ApprovalsCommand,
}

#[derive(Subcommand)]
pub enum ApprovalsCommand {
    #[command(about = "List approvals that are still waiting for a decision")]
    List(ApprovalsListArgs),
    #[command(
        about = "Approve or reject a pending approval",
        after_help = "Example:\n    conductor approvals decide 7f3c... --reject --comment \"not during freeze\""
    )]
    Decide(DecideArgs),
}

#[derive(Args)]
pub struct ApprovalsListArgs {
    /// Workspace holding the approval store (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
#[command(group(ArgGroup::new("decision").required(true).args(["approve", "reject"])))]
pub struct DecideArgs {
    /// Identifier of the pending approval
    #[arg(value_name = "ID")]
    pub id: String,

    #[arg(long)]
    pub approve: bool,

    #[arg(long)]
    pub reject: bool,

    /// Free-form note stored with the decision
    #[arg(long, value_name = "TEXT")]
    pub comment: Option<String>,

    /// Identity recorded as decidedBy (default: approvals.decided_by)
    #[arg(long, value_name = "NAME")]
    pub by: Option<String>,

    /// Workspace holding the approval store (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
