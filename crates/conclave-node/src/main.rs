//! conclave node binary.
//!
//! ```bash
//! # VM node with options from a file, dispatcher on another host
//! RUST_LOG=info conclave-node --options vm.xml --dispatcher 10.0.0.2:10012 vm
//!
//! # SVM node in developer mode (commences without a dispatcher command)
//! RUST_LOG=conclave_pipeline=debug conclave-node --mode developer svm
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use conclave_node::NodeDriver;
use conclave_pipeline::{Node, SvmNode, VmNode};
use conclave_types::{Mode, NodeOptions};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "conclave-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "conclave cluster node: supervises VM or symbolic-execution workers"
)]
struct Cli {
    /// XML node options file. Missing fields keep their defaults.
    #[arg(long, global = true)]
    options: Option<PathBuf>,

    /// Dispatcher master address (`host:port`).
    #[arg(long, global = true)]
    dispatcher: Option<String>,

    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    /// Working directory root.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise instrumented VMs that turn test cases into traces.
    Vm,
    /// Supervise symbolic-execution workers that turn traces into test cases.
    Svm,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Distributed,
    Developer,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Distributed => Mode::Distributed,
            ModeArg::Developer   => Mode::Developer,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=conclave_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let options = load_options(&cli)?;

    let node: Arc<dyn Node> = match cli.command {
        Command::Vm  => Arc::new(VmNode::new(options.clone()).context("failed to create vm node")?),
        Command::Svm => Arc::new(SvmNode::new(options.clone()).context("failed to create svm node")?),
    };
    info!(kind = %node.kind(), dispatcher = %options.dispatcher, "starting node");

    NodeDriver::new(node, options).run().await
}

fn load_options(cli: &Cli) -> Result<NodeOptions> {
    let mut options = match &cli.options {
        Some(path) => NodeOptions::load(path)
            .with_context(|| format!("failed to read options from {}", path.display()))?,
        None => NodeOptions::default(),
    };
    if let Some(dispatcher) = &cli.dispatcher {
        options.dispatcher = dispatcher.clone();
    }
    if let Some(mode) = cli.mode {
        options.mode = mode.into();
    }
    if let Some(dir) = &cli.work_dir {
        options.work_dir = dir.clone();
    }
    Ok(options)
}
