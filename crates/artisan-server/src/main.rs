use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use artisan_api::middleware::require_identity;
use artisan_api::state::run_idle_sweep;
use artisan_api::webhook::WebhookNotifier;
use artisan_api::{AppState, AppStateInner, conversations, messages, notifications};
use artisan_gateway::Backend;
use artisan_messaging::MessagingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artisan=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("ARTISAN_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("ARTISAN_DB_PATH").unwrap_or_else(|_| "artisan.db".into());
    let host = std::env::var("ARTISAN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ARTISAN_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let webhook = std::env::var("ARTISAN_NOTIFY_WEBHOOK").ok().filter(|url| !url.is_empty());
    let config = MessagingConfig::from_env();
    let session_idle_secs: u64 = std::env::var("ARTISAN_SESSION_IDLE_SECS")
        .unwrap_or_else(|_| "1800".into())
        .parse()?;

    let db = artisan_db::Database::open(&PathBuf::from(&db_path))?;
    let backend = Backend::new(db);

    let mut inner = AppStateInner::new(Arc::new(backend), jwt_secret, config);
    if let Some(url) = webhook {
        info!("Recipient notifications go to {}", url);
        inner = inner.with_recipient_notifier(Arc::new(WebhookNotifier::new(url)));
    }
    let state: AppState = Arc::new(inner);

    // Background eviction of idle messaging sessions (checks every minute)
    tokio::spawn(run_idle_sweep(
        state.clone(),
        Duration::from_secs(session_idle_secs),
        Duration::from_secs(60),
    ));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::open_conversation))
        .route("/conversations/{conversation_id}/messages", post(messages::send_message))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_read))
        .route("/conversations/{conversation_id}/typing", post(conversations::start_typing))
        .route("/unread", get(conversations::unread))
        .route("/session", delete(conversations::sign_out))
        .layer(middleware::from_fn_with_state(state.clone(), require_identity))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/notifications", get(notifications::notifications_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Artisan messaging listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
