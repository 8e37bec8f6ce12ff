use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;

use mathlingo_backend::api::{self, AppState};
use mathlingo_backend::config::{self, Config};
use mathlingo_backend::db::Database;
use mathlingo_backend::help::HelpService;
use mathlingo_backend::metrics;
use mathlingo_backend::progress::sessions::SessionRegistry;
use mathlingo_backend::progress::store::{LocalStore, ProgressStore, RemoteStore};
use mathlingo_backend::rate_limit::RateLimiter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    config::set_local_mode(config.local_mode);
    if config.local_mode {
        tracing::info!(
            "Running in LOCAL MODE - authentication disabled, progress kept in {}",
            config.progress_file.display()
        );
    }

    metrics::register_metrics();

    let db = Arc::new(
        Database::new(&config.database_url)
            .await
            .expect("Failed to initialize database"),
    );

    let store: Arc<dyn ProgressStore> = if config.local_mode {
        Arc::new(LocalStore::new(config.progress_file.clone()))
    } else {
        Arc::new(RemoteStore::new(db.clone()))
    };

    let help = HelpService::from_config(&config).expect("Failed to build chat-completion client");

    let frontend_origin = HeaderValue::from_str(&config.frontend_origin)
        .expect("FRONTEND_URL is not a valid header value");

    let state = AppState {
        db,
        sessions: SessionRegistry::new(store),
        help: Arc::new(help),
        rate_limiter: RateLimiter::new(),
    };

    let app = api::router(state, frontend_origin);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Mathlingo backend listening on port {}", config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
