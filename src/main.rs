//! CIL — Central Intelligence Layer for the trading pipeline.
//!
//! Wires the strand store, prediction engine, multi-cluster learning loop,
//! resonance workers and the public API, then runs the dispatcher loops.

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cil_backend::api::{router, AppState};
use cil_backend::models::Config;
use cil_backend::plans::PermissiveDoctrine;
use cil_backend::ports::{LlmPort, MarketDataPort, OpenRouterClient, RestMarketData, WallClock};
use cil_backend::store::StrandStore;
use cil_backend::Cil;

#[derive(Debug, Parser)]
#[command(name = "cil", about = "Central intelligence layer backend")]
struct Cli {
    /// Override the strand database path.
    #[arg(long)]
    db: Option<String>,

    /// Override the API port.
    #[arg(long)]
    port: Option<u16>,

    /// Run without the LLM path even if credentials are present.
    #[arg(long, default_value_t = false)]
    code_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cil_backend=info,cil=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.code_only {
        config.llm_enabled = false;
    }

    info!(db = %config.database_path, port = config.port, "starting cil backend");

    let store = StrandStore::new(&config.database_path).context("opening strand store")?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .user_agent("cil-backend/0.1")
        .build()
        .context("building http client")?;

    let market: Arc<dyn MarketDataPort> = Arc::new(RestMarketData::binance(http.clone()));

    let llm: Option<Arc<dyn LlmPort>> = if config.llm_enabled {
        match OpenRouterClient::from_env(http, &config.llm_model) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "llm credentials missing, running code-only");
                None
            }
        }
    } else {
        None
    };

    let cil = Cil::bootstrap(
        store,
        market,
        llm,
        Arc::new(WallClock::new()),
        Arc::new(PermissiveDoctrine),
        config.clone(),
    )
    .context("bootstrapping pipeline")?;

    cil.dispatcher.spawn_loops();

    let state = AppState {
        store: cil.store.clone(),
        dispatcher: cil.dispatcher.clone(),
        field: cil.field.clone(),
        config: config.clone(),
    };
    let app: Router = router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "api listening");
    axum::serve(listener, app).await.context("serving api")?;

    Ok(())
}
