//! Presence Keeper binary entrypoint wiring REST, SSE, the finalize worker and the
//! connection store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use presence_keeper::{
    config::PresenceConfig,
    dao::{
        connection_store::{ConnectionStore, memory::MemoryConnectionStore},
        subjects::{MemorySubjectDirectory, SubjectDirectory},
    },
    routes,
    services::{
        presence_service::PresenceService,
        recorder::ConnectionRecorder,
        scheduler::{DeferredTaskScheduler, TokioScheduler, run_finalize_worker},
        sse_service,
    },
    state::{AppState, SharedState, clock::SystemClock, events::PresenceEvents},
};

const EVENT_CAPACITY: usize = 256;

/// Store, subject directory and backend name selected at startup.
struct Storage {
    store: Arc<dyn ConnectionStore>,
    subjects: Arc<dyn SubjectDirectory>,
    backend: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(PresenceConfig::load());
    let storage = open_storage().await?;
    info!(backend = storage.backend, "connection store ready");

    let events = Arc::new(PresenceEvents::new(EVENT_CAPACITY));
    let (scheduler, due) = TokioScheduler::new();
    let scheduler: Arc<dyn DeferredTaskScheduler> = Arc::new(scheduler);
    let recorder = Arc::new(ConnectionRecorder::new(
        storage.store.clone(),
        storage.subjects,
        Arc::new(SystemClock),
    ));
    let presence = Arc::new(PresenceService::new(
        recorder,
        scheduler.clone(),
        events.clone(),
        config,
    ));

    tokio::spawn(run_finalize_worker(presence.clone(), scheduler, due));

    let app_state = AppState::new(presence, events, storage.store, storage.backend);
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("serving axum")?;

    Ok(())
}

/// Connect to MongoDB when `MONGO_URI` is set, otherwise keep records in memory.
#[cfg(feature = "mongo-store")]
async fn open_storage() -> anyhow::Result<Storage> {
    use presence_keeper::dao::connection_store::mongodb::{
        MongoConfig, MongoConnectionStore, MongoSubjectDirectory,
    };

    let Ok(uri) = env::var("MONGO_URI") else {
        return Ok(memory_storage());
    };
    let db_name = env::var("MONGO_DB").ok();

    let config = MongoConfig::from_uri(&uri, db_name.as_deref())
        .await
        .context("parsing MONGO_URI")?;
    let store = MongoConnectionStore::connect(config)
        .await
        .context("connecting to MongoDB")?;
    let subjects = MongoSubjectDirectory::new(store.database());

    Ok(Storage {
        store: Arc::new(store),
        subjects: Arc::new(subjects),
        backend: "mongodb",
    })
}

#[cfg(not(feature = "mongo-store"))]
async fn open_storage() -> anyhow::Result<Storage> {
    Ok(memory_storage())
}

fn memory_storage() -> Storage {
    warn!("no database configured; presence records are kept in memory and every positive subject id is accepted");
    Storage {
        store: Arc::new(MemoryConnectionStore::new()),
        subjects: Arc::new(MemorySubjectDirectory::accept_all()),
        backend: "memory",
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM, then tell SSE subscribers the server is going away.
async fn shutdown_signal(state: SharedState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested");
    sse_service::broadcast_info(state.events(), "server shutting down");
}
