// =============================================================================
// Aurora Verdict — Main Entry Point
// =============================================================================
//
// Loads configuration, wires the upstream compute client into the serving
// core and keeps the refresh and warmup jobs running until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aurora_verdict::audit_log::AuditLog;
use aurora_verdict::clock::SystemClock;
use aurora_verdict::compute::HttpComputeProvider;
use aurora_verdict::runtime_config::ServiceConfig;
use aurora_verdict::VerdictService;

const DEFAULT_CONFIG_PATH: &str = "verdict_config.json";
const DEFAULT_COMPUTE_URL: &str = "http://127.0.0.1:8700";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Aurora Verdict starting up");

    let config_path =
        std::env::var("AURORA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        ServiceConfig::default()
    });

    if let Ok(list) = std::env::var("AURORA_WATCHLIST") {
        config.apply_watchlist_override(&list);
    }
    info!(
        watchlist = ?config
            .warmup
            .watchlist
            .iter()
            .map(|w| format!("{}:{}", w.symbol, w.horizon))
            .collect::<Vec<_>>(),
        "Configured warmup watch-list"
    );

    // ── 2. Upstream compute client ───────────────────────────────────────
    let compute_url =
        std::env::var("AURORA_COMPUTE_URL").unwrap_or_else(|_| DEFAULT_COMPUTE_URL.to_string());
    let secret = std::env::var("AURORA_COMPUTE_SECRET").ok();
    let provider = HttpComputeProvider::new(
        &compute_url,
        secret,
        Duration::from_millis(config.compute.timeout_ms),
    )?;
    info!(url = %compute_url, "Upstream compute client ready");

    // ── 3. Audit log ─────────────────────────────────────────────────────
    let audit = match std::env::var("AURORA_AUDIT_LOG") {
        Ok(path) => AuditLog::open(&path)
            .with_context(|| format!("failed to open audit log at {path}"))?,
        Err(_) => {
            warn!("AURORA_AUDIT_LOG not set, audit records kept in memory only");
            AuditLog::in_memory()
        }
    };

    // ── 4. Serving core & background jobs ────────────────────────────────
    let service = Arc::new(VerdictService::new(
        config,
        Arc::new(provider),
        Arc::new(SystemClock),
        Arc::new(audit),
    ));
    service.start_jobs();

    let status_service = service.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let status = status_service.status();
            for job in &status.jobs {
                info!(
                    job = %job.name,
                    running = job.running,
                    ticks = job.ticks,
                    failures = job.failures,
                    last_error = ?job.last_error,
                    "job status"
                );
            }
            info!(
                entries = status.cache.entries,
                in_flight = status.cache.in_flight,
                fresh_hits = status.serve.fresh_hits,
                stale_serves = status.serve.stale_serves,
                misses = status.serve.misses,
                unavailable = status.serve.unavailable,
                "cache status"
            );
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            warn!("Shutdown signal received, stopping gracefully");
        }
        res = status_task => {
            warn!(result = ?res, "status reporter exited unexpectedly");
        }
    }

    service.stop_jobs();
    info!(audit_records = service.audit().len(), "Aurora Verdict shut down complete.");
    Ok(())
}
