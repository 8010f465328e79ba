mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use auction_server::{Server, ServerConfig};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bid_engine::Exchange;
use bidder_registry::{build_filter_table, Bidders};
use clap::Parser;
use core_types::MemoryKv;
use risk_engine::RiskClient;
use vast_proxy::VastProxy;

use crate::config::RtbdConfig;

#[derive(Parser)]
#[command(name = "rtbd", about = "Real-time bidding dispatch server")]
struct Args {
    /// Server name; the reversed FQDN by default.
    #[arg(long)]
    name: Option<String>,

    /// Address of the private/debug endpoint.
    #[arg(long, default_value = "127.0.0.1:6060")]
    private: SocketAddr,
}

#[derive(Clone)]
struct PrivateState {
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
    bidders: Arc<Bidders>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = observability::init_tracing("rtbd");
    let prometheus = observability::init_metrics();

    let config = RtbdConfig::load()?;
    let name = args.name.unwrap_or_else(|| {
        if config.name.is_empty() {
            reversed_fqdn()
        } else {
            config.name.clone()
        }
    });
    tracing::info!(%name, "starting");

    let bidders = Arc::new(Bidders::new(config.bidders_config()));
    let mut background = vec![bidders.start().await.context("load bidders")?];

    let mut exchange = Exchange::new(bidders.clone()).with_user_ids(Arc::new(MemoryKv::default()));

    if config.risk.enabled {
        let risk = Arc::new(RiskClient::new(config.risk_config()));
        background.push(risk.start());
        exchange = exchange.with_risk(risk);
    }

    #[cfg(feature = "segment-filter")]
    let segments = {
        let store = Arc::new(core_types::HttpObjectStore::new(config.object_store.clone()));
        let cache = Arc::new(segment_cache::SegmentCache::new(
            config.segments_config(),
            store,
        ));
        exchange = exchange.with_segments(cache.clone());
        cache
    };

    let bid_server = Arc::new(Server::new(
        ServerConfig {
            addr: config.servers.bid_addr,
            name: format!("{name}.bid"),
            close_timeout: config.close_timeout(),
        },
        Arc::new(exchange),
    ));
    bid_server.start().await.context("start bid server")?;

    let proxy_server = Arc::new(Server::new(
        ServerConfig {
            addr: config.servers.proxy_addr,
            name: format!("{name}.proxy"),
            close_timeout: config.close_timeout(),
        },
        Arc::new(VastProxy::new(config.proxy_config())),
    ));
    proxy_server.start().await.context("start proxy server")?;

    spawn_private_endpoint(
        args.private,
        PrivateState {
            prometheus,
            bidders: bidders.clone(),
        },
    )
    .await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("closing");

    proxy_server.close().await.context("close proxy server")?;
    bid_server.close().await.context("close bid server")?;
    #[cfg(feature = "segment-filter")]
    segments.close();
    for handle in background {
        handle.cancel();
    }

    tracing::info!("done");
    Ok(())
}

/// Host FQDN with its labels reversed, the conventional service name.
fn reversed_fqdn() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string());

    host.split('.').rev().collect::<Vec<_>>().join(".")
}

async fn spawn_private_endpoint(addr: SocketAddr, state: PrivateState) -> Result<()> {
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .route("/debug/agents", get(debug_agents))
        .route("/debug/filters", get(debug_filters))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind private endpoint {addr}"))?;
    tracing::info!(%addr, "private endpoint started");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(%err, "private endpoint failed");
        }
    });
    Ok(())
}

async fn render_metrics(State(state): State<PrivateState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn debug_agents(State(state): State<PrivateState>) -> impl IntoResponse {
    Json(state.bidders.ids())
}

async fn debug_filters(State(state): State<PrivateState>) -> impl IntoResponse {
    let table = build_filter_table(&state.bidders.all());
    Json(serde_json::json!({
        "attributes": table.keys(),
        "combinations": table.len(),
    }))
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("install SIGINT handler")?,
        _ = term.recv() => {}
    }
    Ok(())
}
