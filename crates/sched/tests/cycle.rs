#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingressify_core::Config;
use ingressify_health::{spawn_health, HealthHandle, RenderCycleResult, DEFAULT_INBOX_CAP};
use ingressify_kubehub::{CollectionError, IngressSource, StaticIngressSource};
use ingressify_render::{default_funcs, TemplateRenderer};
use ingressify_sched::{CycleError, Scheduler, SchedulerOptions};
use k8s_openapi::api::networking::v1::Ingress;
use tokio::sync::Notify;

const TEMPLATE: &str = "{% for r in order_by_path_len(rules, true) %}{{ r.host }}{{ r.path }} -> {{ r.service_name }}\n{% endfor %}";

fn ingress(mut v: serde_json::Value) -> Ingress {
    v["apiVersion"] = "networking.k8s.io/v1".into();
    v["kind"] = "Ingress".into();
    serde_json::from_value(v).expect("valid ingress json")
}

fn items() -> Vec<Ingress> {
    vec![ingress(serde_json::json!({
        "metadata": { "name": "web", "namespace": "default" },
        "spec": { "rules": [ { "host": "h1", "http": { "paths": [
            { "path": "/api", "pathType": "Prefix", "backend": { "service": { "name": "api", "port": { "number": 80 } } } },
            { "path": "/", "pathType": "Prefix", "backend": { "service": { "name": "web", "port": { "number": 80 } } } }
        ] } } ] }
    }))]
}

struct FailingSource;

#[async_trait]
impl IngressSource for FailingSource {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError> {
        Err(CollectionError::Unavailable("api server unreachable".to_string()))
    }
}

struct CountingSource(Arc<AtomicUsize>);

#[async_trait]
impl IngressSource for CountingSource {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Blocks inside `list` until released, so a cycle can be caught in flight.
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IngressSource for GatedSource {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(items())
    }
}

fn config(dir: &Path, post_render: &str, pre_render: &str) -> Config {
    let yaml = format!(
        "interval: 1s\nin_template: unused.tmpl\nout_file: '{}'\nhooks:\n  pre_render: {}\n  post_render: {}\n",
        dir.join("out.conf").display(),
        pre_render,
        post_render,
    );
    Config::from_yaml(&yaml).expect("config")
}

fn touch(marker: &Path) -> String {
    format!("['sh', '-c', 'touch {}']", marker.display())
}

fn scheduler(source: Arc<dyn IngressSource>, template: &str, cfg: &Config, dry_run: bool) -> (Scheduler, HealthHandle) {
    let renderer = TemplateRenderer::compile(template, &default_funcs()).expect("compile");
    let (publisher, handle) = spawn_health(Duration::from_secs(60), DEFAULT_INBOX_CAP);
    let opts = SchedulerOptions { run_once: true, dry_run, ..SchedulerOptions::from_config(cfg) };
    (Scheduler::new(source, renderer, cfg, publisher, opts), handle)
}

#[tokio::test]
async fn single_cycle_writes_output_and_runs_hook() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("reloaded");
    let cfg = config(dir.path(), &touch(&marker), "[]");
    let (sched, health) = scheduler(Arc::new(StaticIngressSource::new(items())), TEMPLATE, &cfg, false);

    sched.run_cycle().await.expect("cycle");

    let out = std::fs::read_to_string(dir.path().join("out.conf")).expect("output");
    assert_eq!(out, "h1/ -> web\nh1/api -> api\n");
    assert!(marker.exists());
    assert!(health.report().await.healthy);
}

#[tokio::test]
async fn dry_run_skips_hooks_but_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pre = dir.path().join("pre");
    let post = dir.path().join("post");
    let cfg = config(dir.path(), &touch(&post), &touch(&pre));
    let (sched, _health) = scheduler(Arc::new(StaticIngressSource::new(items())), TEMPLATE, &cfg, true);

    sched.run(tokio::sync::watch::channel(false).1).await.expect("run once");

    assert!(dir.path().join("out.conf").exists());
    assert!(!pre.exists());
    assert!(!post.exists());
}

#[tokio::test]
async fn render_failure_skips_hooks_and_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("reloaded");
    let cfg = config(dir.path(), &touch(&marker), "[]");
    let (sched, health) = scheduler(Arc::new(StaticIngressSource::new(items())), "{{ not_defined }}", &cfg, false);

    let err = sched.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Render(_)), "got {:?}", err);
    assert!(!marker.exists());
    assert!(!dir.path().join("out.conf").exists());

    let snap = health.report().await;
    assert!(!snap.healthy);
    assert!(snap.body().starts_with("Unhealthy: render"), "body={}", snap.body());
}

#[tokio::test]
async fn post_hook_failure_keeps_written_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path(), "['sh', '-c', 'exit 1']", "[]");
    let (sched, health) = scheduler(Arc::new(StaticIngressSource::new(items())), TEMPLATE, &cfg, false);

    let err = sched.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Hook(_)), "got {:?}", err);
    assert!(dir.path().join("out.conf").exists());
    assert!(!health.report().await.healthy);
}

#[tokio::test]
async fn pre_hook_failure_skips_render() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path(), "[]", "['sh', '-c', 'exit 2']");
    let (sched, _health) = scheduler(Arc::new(StaticIngressSource::new(items())), TEMPLATE, &cfg, false);

    let err = sched.run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::PreHook(_)), "got {:?}", err);
    assert!(!dir.path().join("out.conf").exists());
}

#[tokio::test]
async fn collection_failure_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path(), "[]", "[]");
    let (sched, health) = scheduler(Arc::new(FailingSource), TEMPLATE, &cfg, false);

    let err = sched.run(tokio::sync::watch::channel(false).1).await.unwrap_err();
    assert!(matches!(err, CycleError::Collection(_)), "got {:?}", err);
    let snap = health.report().await;
    assert!(snap.cause.unwrap_or_default().contains("api server unreachable"));
}

#[tokio::test(start_paused = true)]
async fn continuous_mode_ticks_until_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path(), "[]", "[]");
    let calls = Arc::new(AtomicUsize::new(0));
    let renderer = TemplateRenderer::compile(TEMPLATE, &default_funcs()).expect("compile");
    let (publisher, _health) = spawn_health(Duration::from_secs(60), DEFAULT_INBOX_CAP);
    let sched = Scheduler::new(Arc::new(CountingSource(calls.clone())), renderer, &cfg, publisher, SchedulerOptions::from_config(&cfg));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move { sched.run(stop_rx).await });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    // first tick is immediate, then one per second
    assert!(calls.load(Ordering::SeqCst) >= 3, "calls={}", calls.load(Ordering::SeqCst));

    stop_tx.send(true).expect("stop");
    let res = tokio::time::timeout(Duration::from_secs(5), task).await.expect("stopped");
    res.expect("join").expect("run");
    let after = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn shutdown_lets_the_in_flight_cycle_finish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path(), "[]", "[]");
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let source = GatedSource { entered: entered.clone(), release: release.clone(), calls: calls.clone() };
    let renderer = TemplateRenderer::compile(TEMPLATE, &default_funcs()).expect("compile");
    let (publisher, health) = spawn_health(Duration::from_secs(60), DEFAULT_INBOX_CAP);
    // an older failure that only the in-flight cycle's result can supersede
    publisher.publish(RenderCycleResult::failed("before shutdown"));
    let sched = Scheduler::new(Arc::new(source), renderer, &cfg, publisher, SchedulerOptions::from_config(&cfg));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move { sched.run(stop_rx).await });

    entered.notified().await;
    stop_tx.send(true).expect("stop");
    release.notify_one();

    let res = tokio::time::timeout(Duration::from_secs(5), task).await.expect("stopped");
    res.expect("join").expect("run");
    assert_eq!(std::fs::read_to_string(dir.path().join("out.conf")).expect("output"), "h1/ -> web\nh1/api -> api\n");
    assert!(health.report().await.healthy);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
