//! Ingressify health: the last render cycle outcome and the `/health` endpoint.
//!
//! Render cycles publish their outcome into a bounded inbox owned by a single
//! actor task. HTTP reads go through the same actor, so a read never races a
//! publish and always sees every result published before it.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Message reported when no render cycle has completed within the staleness window.
pub const STUCK_MESSAGE: &str = "ingressify seems to be stuck";
/// Pending results kept before the oldest is dropped.
pub const DEFAULT_INBOX_CAP: usize = 10;

/// Outcome of one render cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderCycleResult {
    pub success: bool,
    /// Monotonic completion time, used for staleness.
    pub timestamp: Instant,
    /// Wall-clock completion time, for logs only.
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RenderCycleResult {
    pub fn ok() -> Self {
        Self { success: true, timestamp: Instant::now(), finished_at: Utc::now(), error: None }
    }

    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self { success: false, timestamp: Instant::now(), finished_at: Utc::now(), error: Some(err.to_string()) }
    }
}

/// What `/health` answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub cause: Option<String>,
}

impl HealthSnapshot {
    pub fn healthy() -> Self { Self { healthy: true, cause: None } }

    pub fn unhealthy(cause: impl Into<String>) -> Self { Self { healthy: false, cause: Some(cause.into()) } }

    fn from_result(r: &RenderCycleResult) -> Self {
        if r.success {
            Self::healthy()
        } else {
            Self::unhealthy(r.error.clone().unwrap_or_else(|| "unknown error".to_string()))
        }
    }

    pub fn status_code(&self) -> StatusCode {
        if self.healthy { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR }
    }

    pub fn body(&self) -> String {
        match (&self.healthy, &self.cause) {
            (true, _) => "Healthy !\n".to_string(),
            (false, Some(cause)) => format!("Unhealthy: {} !\n", cause),
            (false, None) => "Unhealthy: unknown error !\n".to_string(),
        }
    }
}

/// Cached last result plus a bounded inbox of results not yet read.
#[derive(Debug)]
pub struct HealthCache {
    last: RenderCycleResult,
    inbox: VecDeque<RenderCycleResult>,
    cap: usize,
    dropped: u64,
    staleness: Duration,
}

impl HealthCache {
    /// Starts optimistic: a synthetic success stamped now.
    pub fn new(staleness: Duration, cap: usize) -> Self {
        let cap = cap.max(1);
        Self { last: RenderCycleResult::ok(), inbox: VecDeque::with_capacity(cap), cap, dropped: 0, staleness }
    }

    /// Queue a result; when the inbox is full the oldest pending one is dropped.
    pub fn publish(&mut self, r: RenderCycleResult) {
        if self.inbox.len() >= self.cap {
            self.inbox.pop_front();
            self.dropped += 1;
            counter!("health_dropped_results", 1u64);
            debug!(dropped = self.dropped, "health inbox full; dropped oldest result");
        }
        self.inbox.push_back(r);
    }

    /// Adopt the newest pending result if any; otherwise judge the cached one
    /// against the staleness window.
    pub fn report(&mut self, now: Instant) -> HealthSnapshot {
        if let Some(newest) = self.inbox.pop_back() {
            self.inbox.clear();
            self.last = newest;
            return HealthSnapshot::from_result(&self.last);
        }
        if now.saturating_duration_since(self.last.timestamp) > self.staleness {
            warn!(staleness = ?self.staleness, last = %self.last.finished_at, "no render result within staleness window");
            return HealthSnapshot::unhealthy(STUCK_MESSAGE);
        }
        HealthSnapshot::from_result(&self.last)
    }

    pub fn pending(&self) -> usize { self.inbox.len() }
    pub fn dropped(&self) -> u64 { self.dropped }
}

enum HealthMsg {
    Publish(RenderCycleResult),
    Read(oneshot::Sender<HealthSnapshot>),
}

/// Write side, held by the scheduler.
#[derive(Clone, Debug)]
pub struct HealthPublisher {
    tx: mpsc::UnboundedSender<HealthMsg>,
}

impl HealthPublisher {
    /// Never blocks; a result published after the actor stopped is discarded.
    pub fn publish(&self, r: RenderCycleResult) {
        if self.tx.send(HealthMsg::Publish(r)).is_err() {
            warn!("health actor stopped; dropping render result");
        }
    }
}

/// Read side, held by the HTTP handler.
#[derive(Clone, Debug)]
pub struct HealthHandle {
    tx: mpsc::UnboundedSender<HealthMsg>,
}

impl HealthHandle {
    pub async fn report(&self) -> HealthSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HealthMsg::Read(reply)).is_err() {
            return HealthSnapshot::unhealthy("health state unavailable");
        }
        rx.await.unwrap_or_else(|_| HealthSnapshot::unhealthy("health state unavailable"))
    }
}

/// Spawn the actor owning the [`HealthCache`]. It exits once every publisher
/// and handle has been dropped.
pub fn spawn_health(staleness: Duration, cap: usize) -> (HealthPublisher, HealthHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<HealthMsg>();
    // stamp the optimistic startup report now, not when the task is first polled
    let mut cache = HealthCache::new(staleness, cap);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                HealthMsg::Publish(r) => cache.publish(r),
                HealthMsg::Read(reply) => {
                    let _ = reply.send(cache.report(Instant::now()));
                }
            }
        }
        debug!(dropped = cache.dropped(), "health actor stopped");
    });
    (HealthPublisher { tx: tx.clone() }, HealthHandle { tx })
}

pub fn router(handle: HealthHandle) -> Router {
    Router::new().route("/health", get(health)).with_state(handle)
}

async fn health(State(handle): State<HealthHandle>) -> (StatusCode, String) {
    counter!("health_requests", 1u64);
    let snap = handle.report().await;
    if !snap.healthy {
        debug!(cause = ?snap.cause, "health check failing");
    }
    (snap.status_code(), snap.body())
}

/// Serve `/health` on `listener` until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, handle: HealthHandle, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

/// Bind `0.0.0.0:port` and serve in the background. Bind or serve failures
/// are logged; the render loop keeps running without a health endpoint.
pub fn spawn_health_server(port: u16, handle: HealthHandle, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, error = %e, "health server is down: bind failed");
                return;
            }
        };
        info!(%addr, "health server listening");
        if let Err(e) = serve(listener, handle, shutdown).await {
            error!(error = %e, "health server is down");
        }
        info!("health server stopped");
    })
}
