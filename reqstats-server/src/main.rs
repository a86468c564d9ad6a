//! Reqstats Server - HTTP responder reporting per-request traffic and timing

use anyhow::Result;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use reqstats_common::{ReqstatsConfig, StatsResult};
use reqstats_server::progress::log_progress;
use reqstats_server::server::{full_body, ResponseBody};
use reqstats_server::{HttpStatsServer, ServerStatsHub, StatsListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reqstats=info".parse()?)
                .add_directive("reqstats_server=info".parse()?),
        )
        .init();

    info!("Starting reqstats v{}", env!("CARGO_PKG_VERSION"));

    // Determine config path
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("reqstats.toml"));

    // Load or create default configuration
    let config = if config_path.exists() {
        info!("Loading configuration from {}", config_path.display());
        ReqstatsConfig::load(&config_path)?
    } else {
        info!("No configuration file found, using defaults");
        let config = ReqstatsConfig::default();
        // Save default config for reference
        if let Err(e) = config.save(&config_path) {
            error!("Failed to save default config: {}", e);
        }
        config
    };

    let delay = Duration::from_millis(config.server.response_delay_ms);
    let mut server = HttpStatsServer::new(move |req| respond(req, delay));

    let hub = ServerStatsHub::new();
    hub.attach(&mut server, Some(stats_listener(&config)));

    if config.stats.progress_interval_ms > 0 {
        let interval = Duration::from_millis(config.stats.progress_interval_ms);
        hub.events().on_request(move |handle| {
            tokio::spawn(log_progress(handle.clone(), interval));
        });
    }

    let listener = TcpListener::bind(config.listen_address()).await?;
    let server_handle = tokio::spawn(server.serve(listener));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("reqstats shutdown complete");
    Ok(())
}

/// Access log and optional JSON dump of every completed request
fn stats_listener(config: &ReqstatsConfig) -> StatsListener {
    let access_log = config.server.access_log;
    let log_json = config.stats.log_json;

    Arc::new(move |stats: &StatsResult| {
        if access_log {
            if stats.ok {
                info!(
                    "{} {} {} {}ms in={}B out={}B",
                    stats.request.method,
                    stats.request.path,
                    stats.response.status,
                    stats.elapsed_ms,
                    stats.request.bytes,
                    stats.response.bytes
                );
            } else {
                warn!(
                    "{} {} aborted after {}ms in={}B out={}B",
                    stats.request.method,
                    stats.request.path,
                    stats.elapsed_ms,
                    stats.request.bytes,
                    stats.response.bytes
                );
            }
        }
        if log_json {
            match serde_json::to_string(stats) {
                Ok(json) => debug!("{}", json),
                Err(e) => warn!("Failed to serialize stats: {}", e),
            }
        }
    })
}

/// Drain the request body, wait, and answer with a short text body
async fn respond(req: Request<Incoming>, delay: Duration) -> Result<Response<ResponseBody>> {
    let received = req.into_body().collect().await?.to_bytes().len();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let body = Bytes::from(format!("ok {}\n", received));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(full_body(body))?)
}
