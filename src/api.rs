//! Status API.
//!
//! Read-only: `/health` for liveness and `/api/stats` for a full
//! snapshot of the engine (bid statistics, pacer, wallet pool, queue
//! depth, memory, stream state, bid history). Nothing here mutates the
//! engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::events::EventManager;
use crate::history::BidHistoryStore;
use crate::pacer::BidPacer;
use crate::shutdown::Shutdown;
use crate::stats::{BidStats, EventStats};
use crate::wallets::WalletSelector;

#[derive(Clone)]
pub struct ApiState {
    pub started_at: DateTime<Utc>,
    pub bid_stats: Arc<BidStats>,
    pub event_stats: Arc<EventStats>,
    pub pacer: Arc<BidPacer>,
    pub wallets: Arc<WalletSelector>,
    pub history: Arc<BidHistoryStore>,
    pub events: Arc<EventManager>,
    pub ws_connected: Arc<AtomicBool>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Full engine snapshot. Purely informational.
async fn get_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    Json(serde_json::json!({
        "runtime": {
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "startedAt": state.started_at.to_rfc3339(),
            "uptimeSecs": uptime_secs,
        },
        "bidStats": state.bid_stats.snapshot(),
        "eventStats": state.event_stats.snapshot(),
        "pacer": {
            "used": state.pacer.used(),
            "capacity": state.pacer.capacity(),
        },
        "wallets": state.wallets.snapshot(),
        "queueDepth": state.events.queue_len(),
        "memory": process_memory(),
        "websocketConnected": state.ws_connected.load(Ordering::SeqCst),
        "bidHistory": state.history.snapshot(),
    }))
}

/// Process memory via sysinfo; a cached System instance avoids the
/// expensive re-initialization on every request.
fn process_memory() -> serde_json::Value {
    use parking_lot::Mutex;
    use std::sync::OnceLock;
    use sysinfo::{Pid, ProcessRefreshKind, System};

    static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    let sys_mutex = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new()));
    let mut sys = sys_mutex.lock();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );

    let (resident, virtual_mem) = sys
        .process(pid)
        .map(|p| (p.memory(), p.virtual_memory()))
        .unwrap_or((0, 0));

    serde_json::json!({
        "residentBytes": resident,
        "virtualBytes": virtual_mem,
    })
}

/// Request logging, skipping /health to keep the noise down.
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, path, status, latency_ms, "request failed");
    } else {
        info!(%method, path, status, latency_ms, "request");
    }
    response
}

/// Bind and serve until shutdown.
pub async fn serve(state: ApiState, port: u16, shutdown: Shutdown) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "status API listening");

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::EventStats;
    use crate::wallets::file::WalletsFile;
    use std::collections::HashSet;

    fn state(dir: &tempfile::TempDir) -> ApiState {
        let shutdown = Shutdown::new();
        let file: WalletsFile = serde_json::from_str(
            r#"{"wallets": [
                {"label": "w0", "wif": "k", "paymentAddress": "bc1q0", "receiveAddress": "bc1p0"}
            ]}"#,
        )
        .unwrap();
        let wallets =
            Arc::new(WalletSelector::from_file(file, 10, shutdown.clone()).unwrap());
        let event_stats = Arc::new(EventStats::default());
        let collections: HashSet<String> = ["frogs".to_string()].into_iter().collect();
        let events = Arc::new(EventManager::new(
            collections,
            wallets.clone(),
            event_stats.clone(),
        ));
        ApiState {
            started_at: Utc::now(),
            bid_stats: Arc::new(BidStats::default()),
            event_stats,
            pacer: Arc::new(BidPacer::new(10, shutdown)),
            wallets,
            history: Arc::new(
                BidHistoryStore::load(dir.path().join("bidHistory.json")).unwrap(),
            ),
            events,
            ws_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_stats_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let Json(body) = get_stats(State(state(&dir))).await;

        assert_eq!(body["pacer"]["capacity"], 10);
        assert_eq!(body["queueDepth"], 0);
        assert_eq!(body["websocketConnected"], false);
        assert!(body["runtime"]["pid"].as_u64().is_some());
        assert!(body["bidStats"]["bidsPlaced"].as_u64().is_some());
        assert!(body["eventStats"]["received"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_health_is_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
