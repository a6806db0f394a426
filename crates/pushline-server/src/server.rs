use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use pushline_db_postgres::PostgresStorage;
use pushline_delivery::adapters::{AdapterSet, EmailAdapter, ExpoPushAdapter, WebhookAdapter};
use pushline_delivery::{Dispatcher, RetrySweeper};
use pushline_storage::{DynStorage, MemoryStorage};

use crate::config::{AppConfig, StorageBackend};
use crate::handlers;

/// Shared per-request state. Cheap to clone; everything heavy is behind an
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub storage: DynStorage,
    pub dispatcher: Arc<Dispatcher>,
    pub plans: Arc<pushline_core::PlanTable>,
    pub rate_limit: crate::config::RateLimitConfig,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health and info
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        // Push pipeline
        .route(
            "/push/{topic}",
            post(handlers::push::publish)
                .put(handlers::push::publish)
                .get(handlers::push::history),
        )
        // Pushover-compatible surface
        .route(
            "/pushover",
            post(handlers::pushover::messages).get(handlers::pushover::info),
        )
        .route("/1/messages.json", post(handlers::pushover::messages))
        // Management API
        .route(
            "/topics",
            get(handlers::topics::list).post(handlers::topics::create),
        )
        .route("/topics/{id}", axum::routing::delete(handlers::topics::delete))
        .route(
            "/topics/{id}/subscribers",
            get(handlers::subscribers::list).post(handlers::subscribers::create),
        )
        .route(
            "/topics/{id}/subscribers/{sub_id}",
            axum::routing::delete(handlers::subscribers::delete),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http.request",
                    http.method = %req.method(),
                    http.target = %req.uri(),
                )
            }),
        )
}

/// Wires storage, adapters, dispatcher, and sweeper from configuration.
pub struct ServerBuilder {
    config: AppConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn build(self) -> anyhow::Result<PushlineServer> {
        let cfg = self.config;

        let storage: DynStorage = match cfg.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Running on in-memory storage; state is lost on restart");
                Arc::new(MemoryStorage::new())
            }
            StorageBackend::Postgres => {
                let pg_config = cfg
                    .storage
                    .postgres
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("storage.postgres configuration missing"))?;
                Arc::new(PostgresStorage::connect(pg_config).await?)
            }
        };
        tracing::info!(backend = storage.backend_name(), "Storage initialized");

        let adapters = Arc::new(AdapterSet::new(
            WebhookAdapter::new(),
            EmailAdapter::new(cfg.delivery.smtp.clone()),
            ExpoPushAdapter::new(cfg.delivery.expo_url.clone()),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            adapters.clone(),
            cfg.delivery.dispatch_timeout(),
            cfg.delivery.max_retries,
        ));

        let sweeper = RetrySweeper::new(
            storage.clone(),
            adapters,
            cfg.delivery.retry_batch_size,
            cfg.delivery.retry_interval(),
            cfg.delivery.dispatch_timeout(),
            cfg.delivery.max_retries,
        );

        let state = AppState {
            storage,
            dispatcher,
            plans: Arc::new(cfg.plans.clone()),
            rate_limit: cfg.rate_limit,
        };

        Ok(PushlineServer {
            addr: cfg.addr(),
            app: build_app(state)
                .layer(axum::extract::DefaultBodyLimit::max(cfg.server.body_limit_bytes)),
            sweeper,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PushlineServer {
    addr: SocketAddr,
    app: Router,
    sweeper: RetrySweeper,
}

impl PushlineServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = self.sweeper;
        let sweeper_handle = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let _ = shutdown_tx.send(true);
        let _ = sweeper_handle.await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
