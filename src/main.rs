use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use ladder_bot::api::{self, AppState};
use ladder_bot::bracket::BracketService;
use ladder_bot::config::Config;
use ladder_bot::db::Database;
use ladder_bot::lifecycle::MatchLifecycle;
use ladder_bot::metrics;
use ladder_bot::notify::{LogSink, NotificationSink};
use ladder_bot::queue::{self, MatchmakingQueue};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    for admin in &config.admin_discord_ids {
        if let Err(e) = db.add_admin(admin).await {
            tracing::error!("Failed to register admin {admin}: {e}");
        }
    }

    let sink: Arc<dyn NotificationSink> = Arc::new(LogSink::new());
    let lifecycle = MatchLifecycle::new(db.clone(), sink.clone(), config.lifecycle());
    let brackets = Arc::new(BracketService::new(db.clone(), sink.clone()));
    let matchmaking = MatchmakingQueue::new();

    // Reported results that outlived a restart confirm or re-arm here
    if let Err(e) = lifecycle.recover_pending_confirmations().await {
        tracing::error!("Recovering pending confirmations failed: {e}");
    }

    queue::spawn_matchmaking_worker(
        db.clone(),
        sink.clone(),
        matchmaking.clone(),
        config.matchmaking_poll(),
    );

    let state = AppState {
        db,
        sink,
        lifecycle: lifecycle.clone(),
        brackets,
        queue: matchmaking,
    };
    let app = api::router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Ladder bot listening on {addr}");
    let served = axum::serve(listener, app).await;
    tracing::info!(
        "Shutting down with {} auto-confirm timers armed",
        lifecycle.timers().armed_count()
    );
    lifecycle.timers().cancel_all();
    served.expect("Failed to start server");
}
