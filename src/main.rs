use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use ayugpt::agent::OllamaAgentService;
use ayugpt::config::AppConfig;
use ayugpt::db::SqliteBlobStorage;
use ayugpt::routes::api_routes::{
    chat_handler, clear_sessions_handler, create_session_handler, delete_session_handler,
    feedback_handler, get_session_handler, import_shared_handler, list_sessions_handler,
    rename_session_handler, select_session_handler, share_session_handler, state_handler,
    title_suggestions_handler,
};
use ayugpt::routes::ws_routes::ws_chat_handler;
use ayugpt::service::chat_service::ChatService;
use ayugpt::store::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ayugpt=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env();

    // ── Storage & session store ───────────────────────────────────────────────
    let storage = SqliteBlobStorage::connect(&config.database_url).await?;
    info!("Session storage ready at {}", config.database_url);

    let store = SessionStore::open(
        Arc::new(storage),
        config.persist_debounce,
        config.shared_token.as_deref(),
    )
    .await;

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let agent = OllamaAgentService::new(&config.ollama_base_url, &config.model)?;
    let chat_service = ChatService::new(store.clone(), Arc::new(agent));

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/api/state", get(state_handler))
        .route(
            "/api/sessions",
            get(list_sessions_handler)
                .post(create_session_handler)
                .delete(clear_sessions_handler),
        )
        .route(
            "/api/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/api/sessions/{id}/select", put(select_session_handler))
        .route("/api/sessions/{id}/title", put(rename_session_handler))
        .route("/api/sessions/{id}/title-suggestions", get(title_suggestions_handler))
        .route(
            "/api/sessions/{id}/messages/{message_id}/feedback",
            put(feedback_handler),
        )
        .route("/api/sessions/{id}/share", post(share_session_handler))
        .route("/api/shared", post(import_shared_handler))
        .route("/api/chat", post(chat_handler))
        .route("/ws/chat", get(ws_chat_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(chat_service);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    // Write anything still waiting on the debounce timer.
    store.flush().await;
    Ok(())
}
