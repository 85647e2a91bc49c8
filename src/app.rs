use crate::ari::{ws, AriClient, HttpAriClient};
use crate::call::Dispatcher;
use crate::config::Config;
use crate::plan::Plan;
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub ari: Arc<dyn AriClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub ari: Option<Arc<dyn AriClient>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            ari: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject a non-HTTP ARI client (used by tests).
    pub fn ari(mut self, ari: Arc<dyn AriClient>) -> Self {
        self.ari = Some(ari);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();

        let ari = self
            .ari
            .unwrap_or_else(|| Arc::new(HttpAriClient::new(&config.ari)));

        let plans = Plan::load_dir(&config.flows_path)?;
        if plans.is_empty() {
            anyhow::bail!("no call flows found in {}", config.flows_path);
        }
        info!(flows = plans.len(), path = %config.flows_path, "call flows loaded");

        let dispatcher = Arc::new(Dispatcher::new(
            ari.clone(),
            plans,
            config.grace_period_secs,
            token.child_token(),
        ));

        Ok(Arc::new(AppStateInner {
            config,
            ari,
            dispatcher,
            token,
        }))
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };

    let (event_tx, event_rx) = mpsc::channel(state.config.event_queue_size);
    let ws_task = tokio::spawn(ws::run_event_stream(
        state.config.ari.clone(),
        event_tx,
        state.token.child_token(),
    ));
    let dispatcher_task = tokio::spawn(state.dispatcher.clone().run(event_rx));

    let http_task = axum::serve(listener, app.into_make_service());
    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = state.token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }

    // stop admitting, drain live calls up to a bounded wait, then cancel
    state
        .dispatcher
        .shutdown(Duration::from_secs(state.config.shutdown_wait_secs))
        .await;
    state.token.cancel();
    ws_task.abort();
    dispatcher_task.abort();
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    crate::handler::router().with_state(state).layer(cors)
}
