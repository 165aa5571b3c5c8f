use clap::Parser;
use conductor::{cli, logging};

#[tokio::main]
async fn main() -> conductor::Result<()> {
    let args = cli::Args::parse();
    let _logging = logging::init(&args.command)?;
    cli::run(args).await
}
