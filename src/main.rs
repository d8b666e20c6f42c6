use std::io;
use std::process;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::generate;
use tracing::error;

use kubeforge::{cli, exit_code_for_error, exit_code_for_result};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    // Handle completions subcommand before setting up logging
    // (completion output should be clean without any logging)
    if let cli::Commands::Completions(opts) = &args.command {
        let mut cmd = cli::Cli::command();
        generate(opts.shell, &mut cmd, "kubeforge", &mut io::stdout());
        return Ok(());
    }

    let log_level = match &args.command {
        cli::Commands::Create(opts) | cli::Commands::Delete(opts) | cli::Commands::Upgrade(opts) => {
            opts.common.log_level
        }
        cli::Commands::Validate(opts) => opts.common.log_level,
        cli::Commands::Completions(_) => unreachable!("completions handled above"),
    };
    kubeforge::init_logging(log_level)?;

    let code = match &args.command {
        cli::Commands::Create(opts) => run(kubeforge::run_create(opts).await),
        cli::Commands::Delete(opts) => run(kubeforge::run_delete(opts).await),
        cli::Commands::Upgrade(opts) => run(kubeforge::run_upgrade(opts).await),
        cli::Commands::Validate(opts) => match kubeforge::run_validate(opts) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:#}", e);
                2
            }
        },
        cli::Commands::Completions(_) => unreachable!("completions handled earlier"),
    };

    process::exit(code);
}

fn run(outcome: Result<kubeforge::result::GraphExecutionResult>) -> i32 {
    match outcome {
        Ok(result) => exit_code_for_result(&result),
        Err(e) => {
            error!("{:#}", e);
            exit_code_for_error(&e)
        }
    }
}
