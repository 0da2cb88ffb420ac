use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfgwatch_controller::Controller;
use cfgwatch_core::{ResourceRef, ResourceStore, Strategy, WatchConfig, WorkloadKind};
use cfgwatch_kubehub::KubeStore;
use cfgwatch_ops::{MarkerRestarter, Restarter};
use cfgwatch_store::IndexView;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cfgwatch", version, about = "Restart workloads when the configmaps they opt into change")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    watch: WatchArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StrategyArg { Push, Diff }

#[derive(Args, Debug)]
struct WatchArgs {
    /// Seconds between discovery passes
    #[arg(long = "gather-frequency", env = "CFGWATCH_GATHER_FREQUENCY", global = true, default_value_t = 20)]
    gather_frequency: u64,

    /// Discovery passes between stale-entry sweeps
    #[arg(long = "clean-frequency", env = "CFGWATCH_CLEAN_FREQUENCY", global = true, default_value_t = 100)]
    clean_frequency: u64,

    /// Space-separated namespaces allowed to register dependencies
    #[arg(long = "allowed-namespaces", env = "CFGWATCH_ALLOWED_NAMESPACES", global = true, default_value = "")]
    allowed_namespaces: String,

    /// Only honor workloads in --allowed-namespaces
    #[arg(long = "restrict-namespaces", env = "CFGWATCH_RESTRICT_NAMESPACES", global = true, action = ArgAction::SetTrue)]
    restrict_namespaces: bool,

    /// Change detection: one watch per configmap, or periodic compare
    #[arg(long = "strategy", env = "CFGWATCH_STRATEGY", global = true, value_enum, default_value_t = StrategyArg::Push)]
    strategy: StrategyArg,

    /// Seconds between diff passes (defaults to --gather-frequency)
    #[arg(long = "diff-frequency", env = "CFGWATCH_DIFF_FREQUENCY", global = true)]
    diff_frequency: Option<u64>,

    /// Label selector marking opted-in workloads
    #[arg(long = "selector", env = "CFGWATCH_SELECTOR", global = true, default_value = cfgwatch_core::DEFAULT_OPT_IN_SELECTOR)]
    selector: String,

    /// Annotation naming the configmap a workload depends on
    #[arg(long = "annotation", env = "CFGWATCH_ANNOTATION", global = true, default_value = cfgwatch_core::DEFAULT_ANNOTATION)]
    annotation: String,

    /// Label stamped on restarted workloads
    #[arg(long = "restart-label", env = "CFGWATCH_RESTART_LABEL", global = true, default_value = cfgwatch_core::DEFAULT_RESTART_LABEL)]
    restart_label: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch and restart until interrupted (default)
    Run,
    /// One discovery pass; print the dependency index without restarting anything
    Scan,
    /// Stamp the restart marker on one workload
    Restart {
        /// Workload as namespace/name (bare names use "default")
        target: String,
        /// deployment, daemonset or statefulset
        #[arg(long = "kind", default_value = "deployment")]
        kind: String,
    },
}

impl WatchArgs {
    fn to_config(&self) -> WatchConfig {
        let allowed: BTreeSet<String> = self.allowed_namespaces.split_whitespace().map(str::to_string).collect();
        if self.restrict_namespaces && allowed.is_empty() {
            warn!("--restrict-namespaces without --allowed-namespaces; no workload will be honored");
        }
        WatchConfig {
            gather_every: Duration::from_secs(self.gather_frequency.max(1)),
            clean_every: self.clean_frequency.max(1),
            allowed_namespaces: self.restrict_namespaces.then_some(allowed),
            strategy: match self.strategy {
                StrategyArg::Push => Strategy::Push,
                StrategyArg::Diff => Strategy::Diff,
            },
            diff_every: Duration::from_secs(self.diff_frequency.unwrap_or(self.gather_frequency).max(1)),
            opt_in_selector: self.selector.clone(),
            annotation_key: self.annotation.clone(),
            restart_label: self.restart_label.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("CFGWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CFGWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CFGWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let term = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut s) => { s.recv().await; }
                Err(e) => {
                    warn!(error = %e, "unable to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "unable to listen for Ctrl-C");
                    return;
                }
                info!("interrupt received; shutting down");
            }
            _ = term => info!("SIGTERM received; shutting down"),
        }
        token.cancel();
    });
}

fn print_index(view: &IndexView, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(view)?),
        Output::Human => {
            if view.configs.is_empty() {
                println!("no tracked configmaps");
            }
            for cm in &view.configs {
                println!("{} • {} • cycle {}", cm.id, cm.detection, cm.generation);
                for d in &cm.dependents {
                    println!("  {} {}", d.dependent.kind, d.dependent.workload);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.watch.to_config();
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::connect().await.context("connecting to the cluster")?);
    let restarter = Arc::new(MarkerRestarter::new(store.clone(), cfg.restart_label.clone()));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let shutdown = CancellationToken::new();
            cancel_on_signal(shutdown.clone());
            Controller::new(cfg, store, restarter, shutdown).run().await;
        }
        Commands::Scan => {
            // diff detection opens no watches and nothing polls it here
            let cfg = WatchConfig { strategy: Strategy::Diff, ..cfg };
            let mut ctl = Controller::new(cfg, store, restarter, CancellationToken::new());
            let report = ctl.run_cycle().await;
            info!(listed = report.scan.listed, created = report.scan.created, skipped = report.scan.skipped, "scan done");
            print_index(&ctl.index().view(), cli.output)?;
        }
        Commands::Restart { target, kind } => {
            let kind: WorkloadKind = kind.parse()?;
            let mut id = ResourceRef::from_annotation(&target).context("parsing workload reference")?;
            if id.namespace.is_empty() {
                id.namespace = "default".to_string();
            }
            restarter.restart(kind, &id).await.with_context(|| format!("restarting {} {}", kind, id))?;
            match cli.output {
                Output::Human => println!("restarted {} {}", kind, id),
                Output::Json => println!("{}", serde_json::json!({ "kind": kind.as_str(), "workload": id })),
            }
        }
    }
    Ok(())
}
