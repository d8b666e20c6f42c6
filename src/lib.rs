pub mod cache;
pub mod cli;
pub mod config;
pub mod connector;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod host;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod pipelines;
pub mod privilege;
pub mod result;
pub mod step;
pub mod steps;
pub mod task;

pub use error::KubeforgeError;

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::connector::LocalConnectorFactory;
use crate::context::{PipelineContext, RunContext};
use crate::engine::Engine;
use crate::host::Inventory;
use crate::pipeline::Pipeline;
use crate::result::GraphExecutionResult;

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Asks the user for confirmation on stdin. Any answer other than `y`/`yes`
/// declines.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Loads and validates the spec, builds the inventory and engine, wires
/// ctrl-c to the cancellation token, and gathers host facts.
async fn prepare_run(opts: &cli::RunArgs) -> Result<Arc<RunContext>> {
    let mut spec = config::load_spec(opts.common.spec.as_path())
        .with_context(|| format!("failed to load cluster spec from {}", opts.common.spec))?;
    spec.offline |= opts.offline;
    spec.skip_preflight |= opts.skip_preflight;
    spec.validate().context("cluster spec validation failed")?;

    let inventory = Inventory::from_spec(&spec, &LocalConnectorFactory)
        .context("failed to build the host inventory")?;

    let engine = match opts.concurrency {
        Some(n) => Engine::new(n),
        None => Engine::with_defaults(inventory.all_hosts().len()),
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let run = RunContext::with_cancellation(Arc::new(spec), inventory, engine, cancel);

    if !opts.dry_run {
        connector::facts::gather_all(run.inventory()).await;
    }

    Ok(run)
}

/// Plans and executes one pipeline, printing the result summary.
async fn run_pipeline(
    pipeline: Pipeline,
    opts: &cli::RunArgs,
    action: &str,
) -> Result<GraphExecutionResult> {
    if opts.dry_run {
        warn!("DRY-RUN MODE: no host will be touched");
    }

    let run = prepare_run(opts).await?;

    if !opts.assume_yes && !opts.dry_run {
        let prompt = format!(
            "About to {} cluster '{}' across {} host(s). Continue?",
            action,
            run.spec().name,
            run.inventory().all_hosts().len()
        );
        if !confirm(&prompt)? {
            info!("aborted by user");
            return Err(KubeforgeError::Cancelled.into());
        }
    }

    let ctx = PipelineContext::new(run);
    let result = pipeline.run(&ctx, None, opts.dry_run).await?;
    print!("{}", result.render_summary());
    Ok(result)
}

pub async fn run_create(opts: &cli::RunArgs) -> Result<GraphExecutionResult> {
    run_pipeline(pipelines::create_pipeline(), opts, "create").await
}

pub async fn run_delete(opts: &cli::RunArgs) -> Result<GraphExecutionResult> {
    run_pipeline(pipelines::delete_pipeline(), opts, "delete").await
}

pub async fn run_upgrade(opts: &cli::RunArgs) -> Result<GraphExecutionResult> {
    run_pipeline(pipelines::upgrade_pipeline(), opts, "upgrade").await
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let spec = config::load_spec(opts.common.spec.as_path())
        .with_context(|| format!("failed to load cluster spec from {}", opts.common.spec))?;
    spec.validate().context("cluster spec validation failed")?;
    info!("validation successful:\n{:#?}", spec);
    Ok(())
}

/// Stable exit code for a finished run: 0 success, 3 execution failure,
/// 4 cancelled.
pub fn exit_code_for_result(result: &GraphExecutionResult) -> i32 {
    if result.success() {
        0
    } else if result.cancelled {
        4
    } else {
        3
    }
}

/// Stable exit code for an error: 2 spec/planning failure, 4 cancelled,
/// 1 anything else.
pub fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        match cause.downcast_ref::<KubeforgeError>() {
            Some(KubeforgeError::Spec(_) | KubeforgeError::Plan(_)) => return 2,
            Some(KubeforgeError::Cancelled) => return 4,
            Some(_) => return 1,
            None => {}
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_for_error_categories() {
        let spec_err: anyhow::Error = KubeforgeError::Spec("bad".to_string()).into();
        assert_eq!(exit_code_for_error(&spec_err), 2);

        let plan_err: anyhow::Error =
            KubeforgeError::Plan(graph::GraphError::UnknownNode("x".into())).into();
        assert_eq!(exit_code_for_error(&plan_err.context("planning create-cluster")), 2);

        let cancelled: anyhow::Error = KubeforgeError::Cancelled.into();
        assert_eq!(exit_code_for_error(&cancelled), 4);

        let other = anyhow::anyhow!("some other failure");
        assert_eq!(exit_code_for_error(&other), 1);
    }

    #[test]
    fn exit_codes_for_results() {
        let ok = GraphExecutionResult::empty_success("create-cluster");
        assert_eq!(exit_code_for_result(&ok), 0);

        let mut failed = GraphExecutionResult::empty_success("create-cluster");
        failed.status = result::RunStatus::Failed;
        assert_eq!(exit_code_for_result(&failed), 3);

        failed.cancelled = true;
        assert_eq!(exit_code_for_result(&failed), 4);
    }
}
