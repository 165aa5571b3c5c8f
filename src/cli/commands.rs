use crate::{
    cli::args::{ApprovalsListArgs, DecideArgs, DryRunArgs, RunArgs},
    core::{
        config::ConductorConfig,
        plan_graph::{
            adapters::register_builtins, dry_run as plan_dry_run, load_plan_file,
            AdapterRegistry, ApprovalController, ApprovalStatus, CheckpointStore,
            EngineSettings, ExecutionContext, ExecutionStatus, FileCheckpointStore, SharedState,
        },
        ConfigLoader,
    },
    runtime::{LocalBridge, PlanRuntime},
    Result,
};
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::Value;
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

fn resolve_workspace(workspace: Option<&PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path.clone()),
        None => env::current_dir().context("failed to resolve current directory"),
    }
}

fn load_config(workspace: &Path, config: Option<&PathBuf>) -> Result<ConductorConfig> {
    Ok(ConfigLoader::load(workspace, config.map(PathBuf::as_path))?)
}

fn builtin_adapters() -> AdapterRegistry {
    let mut builder = AdapterRegistry::builder();
    register_builtins(&mut builder);
    builder.build()
}

/// Parse `--state key=value` pairs; values that are not JSON are kept as strings.
fn parse_state_overrides(pairs: &[String]) -> Result<SharedState> {
    let mut state = SharedState::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --state '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid --state '{}': key is empty", pair));
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        state.set(key, value);
    }
    Ok(state)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{}", rendered);
    Ok(())
}

pub async fn run(args: RunArgs) -> Result<()> {
    let workspace = resolve_workspace(args.workspace.as_ref())?;
    let config = load_config(&workspace, args.config.as_ref())?;
    let plan = load_plan_file(&args.plan)?;

    let approvals = Arc::new(ApprovalController::from_settings(
        &config.approvals,
        &workspace,
    )?);
    let checkpoints = Arc::new(
        FileCheckpointStore::new(workspace.join(&config.engine.state_dir))
            .with_history(config.engine.checkpoint_keep_history),
    );
    let checkpoint = if args.resume {
        let found = checkpoints.load(plan.id())?;
        Some(found.ok_or_else(|| anyhow!("no checkpoint found for plan {}", plan.id()))?)
    } else {
        None
    };

    let mut ctx = ExecutionContext::new(builtin_adapters())
        .with_shared_state(parse_state_overrides(&args.state)?)
        .with_checkpoint_store(checkpoints)
        .with_approvals(Arc::clone(&approvals))
        .with_settings(EngineSettings::from(&config));

    let runtime = Arc::new(PlanRuntime::new(
        Arc::new(LocalBridge::connected()),
        Some(approvals),
    ));

    let interrupt = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after the current node");
                runtime.stop().await;
            }
        })
    };

    let outcome = match checkpoint {
        Some(checkpoint) => runtime.resume(&plan, &mut ctx, checkpoint).await,
        None => runtime.start(&plan, &mut ctx).await,
    };
    interrupt.abort();

    let result = outcome?;
    print_json(&result.report())?;

    match result.status {
        ExecutionStatus::Success => Ok(()),
        status => Err(anyhow!("plan {} finished with status {}", result.plan_id, status)),
    }
}

pub async fn dry_run(args: DryRunArgs) -> Result<()> {
    let workspace = resolve_workspace(args.workspace.as_ref())?;
    let config = load_config(&workspace, args.config.as_ref())?;
    let plan = load_plan_file(&args.plan)?;

    let mut ctx =
        ExecutionContext::new(builtin_adapters()).with_settings(EngineSettings::from(&config));
    if !args.without_approvals {
        ctx = ctx.with_approvals(Arc::new(ApprovalController::from_settings(
            &config.approvals,
            &workspace,
        )?));
    }

    let summary = plan_dry_run(&plan, &ctx);
    for warning in &summary.warnings {
        tracing::warn!(plan_id = %summary.plan_id, "{}", warning);
    }
    print_json(&summary)
}

pub async fn list_approvals(args: ApprovalsListArgs) -> Result<()> {
    let workspace = resolve_workspace(args.workspace.as_ref())?;
    let config = load_config(&workspace, args.config.as_ref())?;
    let controller = ApprovalController::from_settings(&config.approvals, &workspace)?;
    print_json(&controller.list_pending()?)
}

pub async fn decide_approval(args: DecideArgs) -> Result<()> {
    let workspace = resolve_workspace(args.workspace.as_ref())?;
    let config = load_config(&workspace, args.config.as_ref())?;
    let controller = ApprovalController::from_settings(&config.approvals, &workspace)?;

    let status = if args.approve {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Rejected
    };
    let decided_by = args
        .by
        .clone()
        .unwrap_or_else(|| config.approvals.decided_by.clone());
    let entry = controller.record_decision_as(&args.id, status, args.comment.clone(), decided_by)?;
    print_json(&entry)
}
