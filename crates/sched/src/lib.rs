//! Ingressify scheduler: one task that periodically collects ingresses,
//! renders the template, writes the output and runs the hooks.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ingressify_core::config::{Config, Hooks};
use ingressify_core::denormalize;
use ingressify_health::{HealthPublisher, RenderCycleResult};
use ingressify_kubehub::{CollectionError, IngressSource};
use ingressify_ops::{HookError, HookRunner};
use ingressify_render::{write_output, TemplateError, TemplateRenderer, WriteMode};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("pre-render hook: {0}")]
    PreHook(#[source] HookError),
    #[error("collecting ingresses: {0}")]
    Collection(#[from] CollectionError),
    #[error("render: {0}")]
    Render(#[from] TemplateError),
    #[error("post-render hook: {0}")]
    Hook(#[source] HookError),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub interval: Duration,
    /// Skip every hook.
    pub dry_run: bool,
    /// Run exactly one cycle and return its outcome.
    pub run_once: bool,
    /// Log hook stdout at info level.
    pub log_hook: bool,
    pub write_mode: WriteMode,
}

impl SchedulerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.interval,
            dry_run: false,
            run_once: false,
            log_hook: false,
            write_mode: WriteMode::from_atomic(cfg.atomic_write),
        }
    }
}

pub struct Scheduler {
    source: Arc<dyn IngressSource>,
    renderer: TemplateRenderer,
    out_file: PathBuf,
    hooks: Hooks,
    runner: HookRunner,
    health: HealthPublisher,
    opts: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn IngressSource>,
        renderer: TemplateRenderer,
        cfg: &Config,
        health: HealthPublisher,
        opts: SchedulerOptions,
    ) -> Self {
        Self {
            source,
            renderer,
            out_file: cfg.out_file.clone(),
            hooks: cfg.hooks.clone(),
            runner: HookRunner::with_timeout(cfg.hooks.timeout),
            health,
            opts,
        }
    }

    /// One full cycle; the outcome is published to the health actor either way.
    pub async fn run_cycle(&self) -> Result<(), CycleError> {
        let started = Instant::now();
        counter!("render_cycles", 1u64);
        let res = self.cycle().await;
        histogram!("render_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => {
                info!(out = %self.out_file.display(), elapsed_ms = started.elapsed().as_millis() as u64, "render cycle complete");
                self.health.publish(RenderCycleResult::ok());
            }
            Err(e) => {
                counter!("render_failures", 1u64);
                error!(error = %e, "render cycle failed");
                self.health.publish(RenderCycleResult::failed(e));
            }
        }
        res
    }

    async fn cycle(&self) -> Result<(), CycleError> {
        if !self.opts.dry_run {
            self.hook("pre_render", &self.hooks.pre_render).await.map_err(CycleError::PreHook)?;
        }
        let ingresses = self.source.list().await?;
        let rules = denormalize(&ingresses);
        let out = self.renderer.render(&rules)?;
        write_output(out.as_bytes(), &self.out_file, self.opts.write_mode)?;
        if !self.opts.dry_run {
            self.hook("post_render", &self.hooks.post_render).await.map_err(CycleError::Hook)?;
        }
        Ok(())
    }

    async fn hook(&self, stage: &str, cmd: &[String]) -> Result<(), HookError> {
        if cmd.is_empty() {
            debug!(stage, "no hook configured");
            return Ok(());
        }
        let stdout = self.runner.run(cmd).await?;
        if self.opts.log_hook {
            info!(stage, output = %stdout.trim_end(), "hook output");
        } else {
            debug!(stage, bytes = stdout.len(), "hook finished");
        }
        Ok(())
    }

    /// Continuous mode ticks until `shutdown` flips to true (or its sender is
    /// dropped). Shutdown is only observed between cycles, never inside one.
    /// In run-once mode the single cycle's outcome is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CycleError> {
        if self.opts.run_once {
            info!(dry_run = self.opts.dry_run, "running a single render cycle");
            return self.run_cycle().await;
        }
        info!(interval = ?self.opts.interval, dry_run = self.opts.dry_run, "scheduler started");
        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are published and logged; the next tick retries
                    let _ = self.run_cycle().await;
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
