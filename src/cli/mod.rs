pub mod args;
pub mod commands;

pub use args::{
    ApprovalsArgs, ApprovalsCommand, ApprovalsListArgs, DecideArgs, DryRunArgs, RunArgs,
};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version = crate::VERSION)]
#[command(about = "Hierarchical plan execution with human approval gates")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: dry-run a plan, run it, and decide pending approvals from a second shell."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Execute a plan",
        long_about = "Run walks the plan graph from its entry node, pausing at approval gates until a decision is recorded, and prints the execution result as JSON.",
        after_help = "Example:\n    conductor run deploy.yaml --state env='\"staging\"'"
    )]
    Run(RunArgs),
    #[command(
        about = "Validate a plan without executing it",
        long_about = "Dry-run loads the plan, asks every leaf adapter for warnings, and prints the summary as JSON.",
        after_help = "Example:\n    conductor dry-run deploy.yaml"
    )]
    DryRun(DryRunArgs),
    #[command(
        about = "Inspect and decide approval gates",
        after_help = "Examples:\n    conductor approvals list\n    conductor approvals decide <ID> --approve"
    )]
    Approvals(ApprovalsArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args).await,
        Command::DryRun(dry_run_args) => commands::dry_run(dry_run_args).await,
        Command::Approvals(approvals_args) => match approvals_args.command {
            ApprovalsCommand::List(list_args) => commands::list_approvals(list_args).await,
            ApprovalsCommand::Decide(decide_args) => commands::decide_approval(decide_args).await,
        },
    }
}
