//! Command-line interface definitions for kubeforge.
//!
//! This module defines the CLI structure using the `clap` crate, including
//! all available commands, subcommands, and their respective arguments.
//! It provides a type-safe representation of the user's command-line input
//! that the application can use to determine what actions to take.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::Shell;

/// Top-level CLI structure that serves as the entry point for parsing
/// command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    /// The subcommand to execute, defining the primary operation.
    #[command(subcommand)]
    pub command: Commands,
}

/// The available subcommands in the application.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a cluster from the given spec.
    ///
    /// Plans the full creation graph (preflight, infrastructure, etcd,
    /// load balancer, control plane, network, addons) and executes it.
    /// Re-running against a converged cluster is a no-op thanks to
    /// per-step prechecks.
    Create(RunArgs),

    /// Tear down the cluster described by the given spec.
    ///
    /// Resets every node and removes the cluster's PKI and rendered
    /// manifests from the working directory.
    Delete(RunArgs),

    /// Upgrade the cluster to the versions in the given spec.
    ///
    /// Rolls the control plane one master at a time, then upgrades the
    /// workers.
    Upgrade(RunArgs),

    /// Validate the given cluster spec.
    ///
    /// Performs syntax and semantic validation on the YAML spec without
    /// touching any host. Useful for checking a spec before applying it.
    Validate(ValidateArgs),

    /// Generate shell completion scripts.
    ///
    /// The generated script should be sourced in your shell's
    /// configuration file or saved to your shell's completion directory.
    ///
    /// # Examples
    ///
    /// For bash (add to ~/.bashrc):
    /// ```sh
    /// eval "$(kubeforge completions bash)"
    /// ```
    ///
    /// For zsh (save to completion directory):
    /// ```sh
    /// kubeforge completions zsh > ~/.zsh/completion/_kubeforge
    /// ```
    Completions(CompletionsArgs),
}

/// Common arguments shared across multiple commands.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the YAML file defining the cluster spec.
    #[arg(short = 'f', long = "spec", default_value = "cluster.yaml", value_hint = ValueHint::FilePath)]
    pub spec: Utf8PathBuf,

    /// Set the log level for controlling verbosity of output.
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

/// Arguments for the cluster-mutating commands (`create`, `delete`,
/// `upgrade`).
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Plan and walk the full graph without touching any host.
    ///
    /// Every per-host invocation is recorded as successful with a dry-run
    /// marker; dependency evaluation still runs, so planning errors
    /// surface.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the interactive confirmation prompt.
    #[arg(short = 'y', long)]
    pub assume_yes: bool,

    /// Engine worker-pool size. Defaults to a value derived from host
    /// count and CPU count.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Skip artifact downloads; all artifacts must already be present.
    #[arg(long)]
    pub offline: bool,

    /// Disable the preflight module for this run.
    #[arg(long)]
    pub skip_preflight: bool,
}

/// Arguments for the `Validate` command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for the `Completions` command.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// The shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// Maps directly to the log levels used by the `tracing` crate. For
/// example, `--log-level debug` enables debug-level output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Parses command-line arguments into a structured `Cli` instance.
pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
