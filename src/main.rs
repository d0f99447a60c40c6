//! Smart-intercom control plane
//!
//! Bridges a street-side SIP doorphone with mobile clients: each inbound
//! ring mints a single-use SIP identity, pushes a call invite to the
//! registered devices, drives bridge construction and outbound
//! origination against the telephony engine, and guarantees cleanup on
//! every exit path via TTL'd records and a reconciling janitor.

#![allow(dead_code)]

mod ari;
mod config;
mod error;
mod events;
mod handlers;
mod janitor;
mod kv;
mod orchestrator;
mod push;
mod realtime;
mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use config::Config;
pub use error::{Error, Result};

use ari::AriClient;
use kv::KvStore;
use orchestrator::Orchestrator;
use push::PushDispatcher;
use realtime::RealtimeStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub realtime: RealtimeStore,
    pub orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    info!("Starting intercom orchestrator");

    let config = Arc::new(Config::from_env()?);

    let realtime = RealtimeStore::connect(&config).await?;
    realtime.ensure_schema().await?;
    realtime.ensure_templates().await?;

    let kv = KvStore::connect(&config.redis_url()).await?;

    let ari = AriClient::new(
        config.ari_base_url(),
        config.ari_ws_url(),
        config.ari_user.clone(),
        config.ari_password.clone(),
        config.ari_app_name.clone(),
    );
    ari.subscribe_endpoint_events().await?;

    let push = PushDispatcher::new(config.push_access_token.clone());

    let orchestrator = Orchestrator::new(
        config.clone(),
        kv.clone(),
        realtime.clone(),
        ari.clone(),
        push,
    );

    // Event-stream consumer. Each event runs on its own task so the
    // socket reader never blocks on engine REST round-trips.
    {
        let ari = ari.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            ari.run_events(move |event| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.handle_event(event).await;
                });
            })
            .await;
        });
    }

    tokio::spawn(janitor::run_stale_sweep(kv.clone(), realtime.clone()));
    tokio::spawn(janitor::run_originate_retry(
        orchestrator.clone(),
        realtime.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        realtime,
        orchestrator,
    };
    let app = routes::create_router(state);

    let listener = TcpListener::bind(config.bind_address())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
    info!(port = config.app_port, app = %config.ari_app_name, "HTTP API listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    Ok(())
}
