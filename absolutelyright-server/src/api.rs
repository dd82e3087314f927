use crate::db::{self, CounterTable, DAY_COUNTS, PROMPT_WORD_COUNTS};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};

/// Current home of the prompt-words dashboard.
const PROMPT_WORDS_PAGE: &str = "/things-i-tell-claude";

#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub secret: Option<String>,
}

/// Full application: API routes for both tables, pageview logging, CORS, and
/// the static dashboard when `static_dir` exists.
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health))
        .merge(counter_routes("/api", &DAY_COUNTS))
        .merge(counter_routes("/api/things-i-tell-claude", &PROMPT_WORD_COUNTS))
        .route("/prompt_words", get(moved_to_prompt_words_page))
        .route("/prompt-words", get(moved_to_prompt_words_page));

    if let Some(dir) = static_dir.filter(|d| d.is_dir()) {
        app = app
            .route_service("/2", ServeFile::new(dir.join("workstations.html")))
            .route_service(
                PROMPT_WORDS_PAGE,
                ServeFile::new(dir.join("prompt_words").join("index.html")),
            )
            .fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.layer(middleware::from_fn(log_pageview))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `today`, `history`, `by-workstation` and `set` for one table under `prefix`.
fn counter_routes(prefix: &str, table: &'static CounterTable) -> Router<AppState> {
    Router::new()
        .route(
            &format!("{prefix}/today"),
            get(move |state: State<AppState>| today(state, table)),
        )
        .route(
            &format!("{prefix}/history"),
            get(move |state: State<AppState>| history(state, table)),
        )
        .route(
            &format!("{prefix}/by-workstation"),
            get(move |state: State<AppState>| by_workstation(state, table)),
        )
        .route(
            &format!("{prefix}/set"),
            post(move |state: State<AppState>, payload: Json<SetRequest>| {
                set_day(state, payload, table)
            }),
        )
}

async fn moved_to_prompt_words_page() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, PROMPT_WORDS_PAGE)],
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({"ok": true}))
}

fn cached<T: IntoResponse>(max_age: u32, body: T) -> Response {
    let value = format!("public, max-age={max_age}");
    match HeaderValue::from_str(&value) {
        Ok(v) => ([(header::CACHE_CONTROL, v)], body).into_response(),
        Err(_) => body.into_response(),
    }
}

fn open(state: &AppState) -> Result<rusqlite::Connection, StatusCode> {
    db::open_or_create(&state.db_path).map_err(|e| {
        tracing::error!(error = %e, path = %state.db_path.display(), "failed to open database");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn internal(table: &CounterTable) -> impl FnOnce(rusqlite::Error) -> StatusCode + '_ {
    move |e| {
        tracing::error!(error = %e, table = table.table, "query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn today(
    State(state): State<AppState>,
    table: &'static CounterTable,
) -> Result<Response, StatusCode> {
    let conn = open(&state)?;
    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let totals = table.today(&conn, &day).map_err(internal(table))?;
    Ok(cached(60, Json(totals)))
}

async fn history(
    State(state): State<AppState>,
    table: &'static CounterTable,
) -> Result<Response, StatusCode> {
    let conn = open(&state)?;
    let days = table.history(&conn).map_err(internal(table))?;
    Ok(cached(300, Json(days)))
}

async fn by_workstation(
    State(state): State<AppState>,
    table: &'static CounterTable,
) -> Result<Response, StatusCode> {
    let conn = open(&state)?;
    let grouped = table.by_workstation(&conn).map_err(internal(table))?;
    Ok(cached(60, Json(grouped)))
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    day: String,
    workstation_id: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

async fn set_day(
    State(state): State<AppState>,
    Json(payload): Json<SetRequest>,
    table: &'static CounterTable,
) -> Result<Json<&'static str>, (StatusCode, &'static str)> {
    if let Some(ref expected) = state.secret {
        if payload.secret.as_deref() != Some(expected.as_str()) {
            tracing::warn!(
                table = table.table,
                workstation_id = %payload.workstation_id,
                "rejected upload with invalid secret"
            );
            return Err((StatusCode::UNAUTHORIZED, "Invalid secret"));
        }
    }

    let counters = table.counters_from(&payload.fields);
    let total = table.total_from(&payload.fields);

    let conn = open(&state).map_err(|code| (code, "database unavailable"))?;
    table
        .upsert(&conn, &payload.day, &payload.workstation_id, &counters, total)
        .map_err(|e| (internal(table)(e), "write failed"))?;

    tracing::debug!(
        table = table.table,
        day = %payload.day,
        workstation_id = %payload.workstation_id,
        total,
        "counters stored"
    );
    Ok(Json("ok"))
}

async fn log_pageview(req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if req.method() == axum::http::Method::GET && (path == "/" || path == "/index.html") {
        tracing::info!(path = %path, "pageview");
    }
    next.run(req).await
}
