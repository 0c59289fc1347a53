//! `sealward` CLI — bootstrap, unseal, and configure Vault running on
//! Kubernetes.
//!
//! Every command discovers the Vault pods through the ambient kubeconfig,
//! tunnels into them, and exits non-zero on the first error. Ctrl-C or
//! SIGTERM cancels the running command and closes its tunnels.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sealward_core::bootstrap::BootstrapParams;
use sealward_core::config::{LocalPort, ToolkitConfig};
use sealward_core::environment::Environment;
use sealward_core::pipeline::{Pipeline, ReconcileOptions, Selection};
use sealward_core::plans::APPLICATIONS;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::output::{BOLD, RED, RESET};

// ── CLI structure ────────────────────────────────────────────────────

/// sealward — bootstrap and reconcile Vault on Kubernetes.
#[derive(Parser)]
#[command(
    name = "sealward",
    version,
    about = "sealward CLI — initialize, unseal, and configure Vault running on Kubernetes",
    long_about = None,
    after_help = "Environment variables:\n  \
         SEALWARD_CACHE_DIR    Credential cache root\n  \
         SEALWARD_LABEL        Default pod label selector\n  \
         SEALWARD_LOCAL_PORT   Tunnel local port (0 = ephemeral)\n  \
         SEALWARD_LOG_LEVEL    Log filter when RUST_LOG is unset\n  \
         SEALWARD_LOG_FORMAT   `json` for JSON log lines\n\n\
         Examples:\n  \
         sealward initialize -e prod --shares 5 --threshold 3\n  \
         sealward mounts -e prod\n  \
         sealward prepare keycloak -e prod --overwrite"
)]
struct Cli {
    /// Deployment environment (dev, stage, prod). Keys the credential cache.
    #[arg(long, short, global = true, default_value = "dev")]
    environment: Environment,

    /// Label selector for the Vault pods.
    #[arg(long, short, global = true)]
    label: Option<String>,

    /// Namespace of the Vault pods. Searches every namespace when unset.
    #[arg(long, short, global = true)]
    namespace: Option<String>,

    /// Credential cache root.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Local tunnel port, 0 for an ephemeral one.
    #[arg(long, global = true)]
    local_port: Option<u16>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Vault and unseal every replica.
    #[command(visible_alias = "init")]
    Initialize {
        /// Number of key shares to generate.
        #[arg(long, default_value_t = 5)]
        shares: u8,
        /// Shares required to unseal.
        #[arg(long, default_value_t = 3)]
        threshold: u8,
        /// Request recovery shares for an HA / auto-unseal deployment.
        #[arg(long)]
        high_availability: bool,
        /// YAML secret-values file that receives `vault.token`.
        #[arg(long, value_name = "FILE")]
        secret_file: Option<PathBuf>,
    },
    /// Enable the auth methods and secrets engines.
    #[command(visible_alias = "methods")]
    Mounts(ReconcileArgs),
    /// Write ACL and password policies.
    #[command(visible_aliases = ["conf", "config"])]
    Configure(ReconcileArgs),
    /// Prepare Vault for an application (keycloak, gitlab, vso).
    Prepare {
        #[arg(value_parser = clap::builder::PossibleValuesParser::new(APPLICATIONS.iter().copied()))]
        application: String,
        #[command(flatten)]
        args: ReconcileArgs,
    },
    /// Show the seal status of every Vault pod.
    Status,
}

#[derive(Args)]
struct ReconcileArgs {
    /// Vault token. Defaults to the cached root token.
    #[arg(long, short)]
    token: Option<String>,
    /// Rewrite configuration that already exists.
    #[arg(long)]
    overwrite: bool,
}

impl Cli {
    fn selection(&self) -> Selection {
        Selection {
            namespace: self.namespace.clone().unwrap_or_default(),
            label: self.label.clone().unwrap_or_default(),
        }
    }

    fn bootstrap_params(&self) -> Option<BootstrapParams> {
        match &self.command {
            Commands::Initialize {
                shares,
                threshold,
                high_availability,
                ..
            } => Some(BootstrapParams {
                environment: self.environment,
                shares: *shares,
                threshold: *threshold,
                high_availability: *high_availability,
            }),
            _ => None,
        }
    }

    fn reconcile_options(&self, args: &ReconcileArgs) -> ReconcileOptions {
        ReconcileOptions {
            environment: self.environment,
            token: args.token.clone(),
            overwrite: args.overwrite,
        }
    }
}

// ── Setup ────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> ToolkitConfig {
    let mut config = ToolkitConfig::from_env();
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir.clone_from(dir);
    }
    if let Some(port) = cli.local_port {
        config.local_port = LocalPort::from_port(port);
    }
    if cli.verbose {
        "debug".clone_into(&mut config.log_level);
    }
    config
}

fn init_tracing(config: &ToolkitConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("SEALWARD_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    warn!("interrupt received, cancelling");
    cancel.cancel();
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli);
    init_tracing(&config);
    debug!(cache_dir = %config.cache_dir.display(), environment = %cli.environment, "configuration loaded");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match run(&cli, &config, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: &ToolkitConfig, cancel: &CancellationToken) -> Result<()> {
    // Parameter errors surface before any cluster access.
    let params = cli.bootstrap_params();
    if let Some(params) = &params {
        params.validate()?;
    }

    let pipeline = Pipeline::kubernetes(config)
        .await
        .context("could not connect to the Kubernetes API")?;
    let selection = cli.selection();

    match &cli.command {
        Commands::Initialize { secret_file, .. } => {
            let params = params.context("seal parameters missing")?;
            let outcome = match pipeline
                .initialize(cancel, &selection, &params, secret_file.as_deref())
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(credentials) = e.unsaved_credentials() {
                        output::print_unsaved_credentials(credentials);
                    }
                    return Err(anyhow::Error::new(e).context("initialize failed"));
                }
            };
            output::print_bootstrap(&outcome);
        }
        Commands::Mounts(args) => {
            let summary = pipeline
                .mounts(cancel, &selection, &cli.reconcile_options(args))
                .await
                .context("mounts failed")?;
            output::print_summary("Auth Methods & Secrets Engines", &summary);
        }
        Commands::Configure(args) => {
            let summary = pipeline
                .configure(cancel, &selection, &cli.reconcile_options(args))
                .await
                .context("configure failed")?;
            output::print_summary("Policies", &summary);
        }
        Commands::Prepare { application, args } => {
            let summary = pipeline
                .prepare(cancel, &selection, application, &cli.reconcile_options(args))
                .await
                .with_context(|| format!("prepare {application} failed"))?;
            output::print_summary(&format!("Prepare {application}"), &summary);
        }
        Commands::Status => {
            let statuses = pipeline
                .status(cancel, &selection)
                .await
                .context("status failed")?;
            output::print_status(&statuses);
        }
    }
    Ok(())
}
