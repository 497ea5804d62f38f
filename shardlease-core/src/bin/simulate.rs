//! Cluster simulation binary
//!
//! Runs several nodes in one process against a shared in-memory agent table
//! and serves metrics and the table contents over HTTP.

use axum::extract::State;
use axum::{routing::get, Json, Router};
use shardlease_core::clock::SystemClock;
use shardlease_core::metrics::gather_system_metrics;
use shardlease_core::storage::InMemoryAgentRepository;
use shardlease_core::{
    Agent, AgentType, CoordinationConfig, Pulser, PulserHandle, ShardAssignmentDescriptor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn cluster(State(repo): State<Arc<InMemoryAgentRepository>>) -> Json<Vec<Agent>> {
    Json(repo.snapshot())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting shardlease simulation");

    let node_count: usize = env_or("NODE_COUNT", 3);
    let pulse_interval = Duration::from_millis(env_or("PULSE_INTERVAL_MS", shardlease_core::DEFAULT_PULSE_INTERVAL_MS));
    let lease_duration = Duration::from_millis(env_or("LEASE_DURATION_MS", shardlease_core::DEFAULT_LEASE_DURATION_MS));
    let agent_type = AgentType::new(env_or("AGENT_TYPE", shardlease_core::DEFAULT_AGENT_TYPE.to_string()));
    let static_total: Option<u32> = std::env::var("STATIC_TOTAL_SHARDS").ok().and_then(|v| v.parse().ok());
    let metrics_addr: SocketAddr = env_or("METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 9100)));

    let repo = Arc::new(InMemoryAgentRepository::new());
    let clock = Arc::new(SystemClock);

    let mut handles: Vec<PulserHandle> = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let static_assignment = match static_total {
            Some(total) => Some(ShardAssignmentDescriptor::round_robin(total, i)?),
            None => None,
        };
        let config = CoordinationConfig {
            agent_type: agent_type.clone(),
            agent_name: format!("node-{}", i),
            pulse_interval,
            lease_duration,
            static_assignment,
        };

        let pulser = Pulser::new(config, repo.clone(), clock.clone())?;
        let handle = match pulser.start().await {
            Ok(handle) => handle,
            Err(e) => {
                error!("node-{} failed to start: {}", i, e);
                return Err(e.into());
            }
        };

        let mut assignments = handle.subscribe();
        tokio::spawn(async move {
            while assignments.changed().await.is_ok() {
                let current = *assignments.borrow_and_update();
                match current {
                    Some(assignment) => info!("node-{} now owns shard {}", i, assignment),
                    None => info!("node-{} owns no shard", i),
                }
            }
        });
        handles.push(handle);
    }

    let app = Router::new()
        .route("/metrics", get(|| async { gather_system_metrics() }))
        .route("/cluster", get(cluster))
        .layer(CorsLayer::permissive())
        .with_state(repo.clone());

    let listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!("Metrics API listening on {}", metrics_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down {} nodes", handles.len());

    for handle in handles {
        if let Err(e) = handle.stop().await {
            warn!("Node stopped with error: {}", e);
        }
    }

    Ok(())
}
