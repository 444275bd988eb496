mod auth;
mod email;
mod error;
mod pipeline;
mod prompt;
mod rate_limiters;
mod request_tracing;
mod routes;
mod server_config;
mod store;
#[cfg(test)]
mod testing;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use auth::{session_store::PendingAuthStore, token_store::cookie_key, CookiePolicy, SessionManager};
use axum::extract::FromRef;
use mimalloc::MiMalloc;
use pipeline::BatchOrchestrator;
use prompt::ChatExtractor;
use rate_limiters::RateLimiters;
use routes::AppRouter;
use server_config::ServerConfig;
use store::{MemoryRecordStore, RecordStore, SeaOrmRecordStore};
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_cookies::Key;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[derive(Clone, FromRef)]
pub struct ServerState {
    pub http_client: HttpClient,
    pub config: Arc<ServerConfig>,
    pub session_manager: SessionManager,
    pub pending_auth: PendingAuthStore,
    pub cookie_key: Key,
    pub cookie_policy: CookiePolicy,
    pub orchestrator: BatchOrchestrator,
    pub records: Arc<dyn RecordStore>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn build_state(config: ServerConfig) -> anyhow::Result<ServerState> {
    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let cookie_key = cookie_key(&config.session)?;
    let cookie_policy = CookiePolicy::from_config(&config.server, &config.session);
    let session_manager = SessionManager::new(
        http_client.clone(),
        config.oauth.clone(),
        Duration::from_secs(config.session.refresh_reuse_secs),
    );

    let extractor = ChatExtractor::new(
        http_client.clone(),
        Arc::new(config.extraction.clone()),
        RateLimiters::from_limits(&config.extraction.prompt_limits),
    );
    let orchestrator = BatchOrchestrator::from_config(Arc::new(extractor), &config.batch);

    let records: Arc<dyn RecordStore> = match config.database.url.as_deref() {
        Some(url) if !url.is_empty() => {
            tracing::info!("Persisting processed messages to the database");
            Arc::new(SeaOrmRecordStore::connect(url).await?)
        }
        _ => {
            tracing::info!("No database configured, processed messages are kept in memory");
            Arc::new(MemoryRecordStore::new())
        }
    };

    Ok(ServerState {
        http_client,
        config: Arc::new(config),
        session_manager,
        pending_auth: PendingAuthStore::new(),
        cookie_key,
        cookie_policy,
        orchestrator,
        records,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::load()?;
    tracing::info!("{}", config);
    let port = config.server.port;

    let state = build_state(config).await?;

    let mut scheduler = JobScheduler::new().await?;
    {
        // Drops abandoned sign-ins and settled token refreshes
        let pending_auth = state.pending_auth.clone();
        let session_manager = state.session_manager.clone();
        scheduler
            .add(Job::new("0 */3 * * * *", move |_uuid, _lock| {
                pending_auth.clean_store();
                session_manager.purge_settled_refreshes();
            })?)
            .await?;
    }
    scheduler.set_shutdown_handler(Box::new(|| {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));
    scheduler.start().await?;

    let router = AppRouter::create(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server running on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(mut scheduler: JobScheduler) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("Scheduler did not shut down cleanly: {:?}", e);
    }
    tracing::info!("Cleanups done, shutting down");
}
