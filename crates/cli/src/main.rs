use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use ingressify_core::Config;
use ingressify_health::{spawn_health, spawn_health_server, DEFAULT_INBOX_CAP};
use ingressify_kubehub::{build_client, KubeIngressSource};
use ingressify_render::{default_funcs, TemplateRenderer};
use ingressify_sched::{Scheduler, SchedulerOptions};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CYCLE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CLIENT: u8 = 3;
const EXIT_TEMPLATE: u8 = 4;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "ingressify", version, about = "Render Kubernetes Ingress rules into a proxy config file")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long = "config")]
    config: PathBuf,

    /// Render once without running hooks, then exit
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Run a single cycle (hooks included), then exit
    #[arg(long = "run-once", action = ArgAction::SetTrue)]
    run_once: bool,

    /// Log the stdout of hook commands
    #[arg(long = "log-hook", action = ArgAction::SetTrue)]
    log_hook: bool,
}

/// `INGRESSIFY_LOG` holds an EnvFilter directive; a missing or unparsable one means `info`.
fn init_tracing() {
    let filter = std::env::var("INGRESSIFY_LOG")
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Installs the Prometheus scrape listener when `INGRESSIFY_METRICS_ADDR` is set.
/// Returns the bound address; metrics stay in-process otherwise.
fn init_metrics() -> Option<SocketAddr> {
    let addr = metrics_listen_addr(&std::env::var("INGRESSIFY_METRICS_ADDR").ok()?)?;
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(%addr, error = %e, "metrics exporter not installed");
        return None;
    }
    Some(addr)
}

fn metrics_listen_addr(raw: &str) -> Option<SocketAddr> {
    match raw.trim().parse::<SocketAddr>() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(addr = %raw, error = %e, "ignoring INGRESSIFY_METRICS_ADDR; expected host:port");
            None
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut term = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("listening for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await.context("listening for ctrl-c")?;
    Ok(())
}

impl Cli {
    fn scheduler_options(&self, cfg: &Config) -> SchedulerOptions {
        SchedulerOptions {
            dry_run: self.dry_run,
            run_once: self.run_once || self.dry_run,
            log_hook: self.log_hook,
            ..SchedulerOptions::from_config(cfg)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, config = %cli.config.display(), "failed to load config");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let opts = cli.scheduler_options(&cfg);
    info!(interval = ?cfg.interval, out = %cfg.out_file.display(), port = cfg.health_check_port, "config loaded");

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let (publisher, health) = spawn_health(cfg.staleness(), DEFAULT_INBOX_CAP);
    let server = spawn_health_server(cfg.health_check_port, health, stop_rx.clone());

    let client = match build_client(&cfg.kubeconfig).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build k8s client");
            return Ok(ExitCode::from(EXIT_CLIENT));
        }
    };
    let renderer = match TemplateRenderer::compile_file(&cfg.in_template, &default_funcs()) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to prepare template");
            return Ok(ExitCode::from(EXIT_TEMPLATE));
        }
    };

    tokio::spawn({
        let stop_tx = Arc::clone(&stop_tx);
        async move {
            match shutdown_signal().await {
                Ok(()) => info!("shutdown signal received; finishing in-flight cycle"),
                Err(e) => {
                    error!(error = ?e, "signal handling unavailable");
                    return;
                }
            }
            let _ = stop_tx.send(true);
        }
    });

    let source = Arc::new(KubeIngressSource::new(client, cfg.namespace()));
    let scheduler = Scheduler::new(source, renderer, &cfg, publisher, opts);
    let outcome = scheduler.run(stop_rx).await;

    let _ = stop_tx.send(true);
    if opts.run_once {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, server).await;
    } else {
        info!(grace = ?SHUTDOWN_GRACE, "gracefully shutting down; waiting for health server");
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "render cycle failed");
            Ok(ExitCode::from(EXIT_CYCLE))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let metrics_addr = init_metrics();
    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), metrics = ?metrics_addr, "starting ingressify");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "ingressify failed");
            ExitCode::FAILURE
        }
    }
}
