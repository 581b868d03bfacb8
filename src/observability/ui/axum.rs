use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::error;

use crate::connection::Connection;
use crate::observability::stats::{Layout, Stats};

#[derive(Clone)]
struct UiState {
    connection: Arc<Connection>,
    queues: Arc<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct HtmlParams {
    layout: Option<Layout>,
    refresh: Option<String>,
}

/// Creates a stats router that can be mounted on any path.
///
/// Serves the HTML table at `/`, JSON at `/stats` and plain text at
/// `/stats.txt`. An empty `queues` list means every opened queue.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rmq::{Connection, ConnectionConfig, RedisStore};
/// use rmq::observability::stats_ui;
/// use axum::Router;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisStore::builder()
///     .redis_url("redis://127.0.0.1:6379")
///     .build()
///     .await?;
/// let store = Arc::new(store);
/// let connection = Connection::open("stats", store, ConnectionConfig::default()).await?;
///
/// let app: Router = Router::new().nest("/rmq", stats_ui(Arc::new(connection), Vec::new()));
/// # Ok(())
/// # }
/// ```
pub fn stats_ui(connection: Arc<Connection>, queues: Vec<String>) -> Router {
    let state = UiState {
        connection,
        queues: Arc::new(queues),
    };

    Router::new()
        .route("/", get(stats_html))
        .route("/stats", get(stats_json))
        .route("/stats.txt", get(stats_text))
        .with_state(state)
}

async fn collect(state: &UiState) -> Result<Stats, StatusCode> {
    let stats = if state.queues.is_empty() {
        Stats::collect_all(&state.connection).await
    } else {
        Stats::collect(&state.connection, &state.queues).await
    };
    stats.map_err(|e| {
        error!(error = %e, "failed to collect stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn stats_html(
    State(state): State<UiState>,
    Query(params): Query<HtmlParams>,
) -> Result<Html<String>, StatusCode> {
    let stats = collect(&state).await?;
    Ok(Html(stats.to_html(
        params.layout.unwrap_or_default(),
        params.refresh.as_deref(),
    )))
}

async fn stats_json(State(state): State<UiState>) -> Result<Json<Stats>, StatusCode> {
    collect(&state).await.map(Json)
}

async fn stats_text(State(state): State<UiState>) -> Result<String, StatusCode> {
    collect(&state).await.map(|stats| stats.to_string())
}
