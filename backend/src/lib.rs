use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use game_core::{whole_number, Flags, GameState, PlayerId, Scores, Snapshot, Team, TeamCounts};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub mod config;
pub mod error;
pub mod persist;

use error::ApiError;
use persist::Persister;

/// Request bodies larger than this are rejected before they are parsed.
pub const MAX_BODY_BYTES: usize = 1_000_000;

#[derive(Clone, Default)]
pub struct AppState {
    game: Arc<RwLock<GameState>>,
    persister: Option<Arc<Persister>>,
}

impl AppState {
    /// Loads the snapshot at `path` if there is one and writes every later
    /// mutation back to it, at most once per `debounce`.
    pub async fn with_persistence(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let path = path.into();
        let game = Arc::new(RwLock::new(persist::load(&path).await));
        let persister = Persister::new(path, debounce, game.clone());
        Self {
            game,
            persister: Some(Arc::new(persister)),
        }
    }

    #[cfg(test)]
    pub(crate) fn persist_path(&self) -> Option<&std::path::Path> {
        self.persister.as_deref().map(Persister::path)
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.game.read().await.snapshot()
    }

    /// Writes any pending state immediately. Used on shutdown.
    pub async fn flush(&self) {
        if let Some(persister) = &self.persister {
            persister.flush().await;
        }
    }

    async fn persist(&self) {
        if let Some(persister) = &self.persister {
            persister.schedule().await;
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/state", get(get_state).post(merge_state).fallback(not_found))
        .route("/assign", post(assign).fallback(not_found))
        .route("/score", post(score).fallback(not_found))
        .route("/flag", post(set_flag).fallback(not_found))
        .route("/teams", get(get_teams).fallback(not_found))
        .route("/teams/assign", post(assign).fallback(not_found))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(preflight))
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Answers every OPTIONS request with an empty 204. tower-http replies to
/// preflights with 200, which some game clients treat as a failure.
async fn preflight(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET,POST,OPTIONS"),
        ],
    )
        .into_response()
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Parses a request body. An empty body reads as `{}`.
fn parse_body(body: Result<Bytes, BytesRejection>) -> Result<Value, ApiError> {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(ApiError::PayloadTooLarge);
        }
        Err(rejection) => {
            debug!(error = %rejection, "failed to read request body");
            return Err(ApiError::BadJson);
        }
    };
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_slice(&body) {
        Ok(Value::Null) | Err(_) => Err(ApiError::BadJson),
        Ok(value) => Ok(value),
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Player ids (`userId`, `carrier`) arrive as strings, but numeric ids are
/// accepted and stringified. Zero counts as missing.
fn player_id(value: Option<&Value>) -> PlayerId {
    match value {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(n)) if n.as_f64() != Some(0.0) => n.to_string(),
        _ => PlayerId::new(),
    }
}

/// An absent delta means +1. Numbers and numeric strings are truncated to an
/// integer; anything else, `null` included, counts as 0.
fn score_delta(value: Option<&Value>) -> i64 {
    match value {
        None => 1,
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|n| whole_number(&Value::from(n)))
            .unwrap_or(0),
        Some(other) => whole_number(other).unwrap_or(0),
    }
}

#[derive(Serialize)]
struct TeamsResponse {
    counts: TeamCounts,
    assignments: BTreeMap<PlayerId, Team>,
}

#[derive(Serialize)]
struct AssignResponse {
    ok: bool,
    counts: TeamCounts,
    assignments: BTreeMap<PlayerId, Team>,
}

#[derive(Serialize)]
struct ScoreResponse {
    ok: bool,
    scores: Scores,
}

#[derive(Serialize)]
struct FlagResponse {
    ok: bool,
    flags: Flags,
    #[serde(skip_serializing_if = "Option::is_none")]
    scores: Option<Scores>,
}

#[derive(Serialize)]
struct MergeResponse {
    ok: bool,
    #[serde(flatten)]
    snapshot: Snapshot,
}

async fn get_state(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.snapshot().await)
}

async fn get_teams(State(state): State<AppState>) -> Json<TeamsResponse> {
    let game = state.game.read().await;
    Json(TeamsResponse {
        counts: game.counts(),
        assignments: game.assignments.clone(),
    })
}

async fn merge_state(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<MergeResponse>, ApiError> {
    let patch = parse_body(body)?;
    let snapshot = {
        let mut game = state.game.write().await;
        game.merge(&patch);
        game.snapshot()
    };
    info!(players = snapshot.assignments.len(), "state merged");
    state.persist().await;

    Ok(Json(MergeResponse { ok: true, snapshot }))
}

async fn assign(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AssignResponse>, ApiError> {
    let payload = parse_body(body)?;
    let user_id = player_id(payload.get("userId"));
    let team = str_field(&payload, "team");

    let response = {
        let mut game = state.game.write().await;
        let team = game.assign(&user_id, team)?;
        info!(user_id = %user_id, team = team.as_str(), "player assigned");
        AssignResponse {
            ok: true,
            counts: game.counts(),
            assignments: game.assignments.clone(),
        }
    };
    state.persist().await;

    Ok(Json(response))
}

async fn score(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let payload = parse_body(body)?;
    let team = str_field(&payload, "team");
    let delta = score_delta(payload.get("delta"));

    let scores = {
        let mut game = state.game.write().await;
        game.apply_score(team, delta)?.clone()
    };
    info!(team, delta, red = scores.red, blue = scores.blue, "score updated");
    state.persist().await;

    Ok(Json(ScoreResponse { ok: true, scores }))
}

async fn set_flag(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<FlagResponse>, ApiError> {
    let payload = parse_body(body)?;
    let flag = str_field(&payload, "flag");
    let status = str_field(&payload, "state");
    let carrier = player_id(payload.get("carrier"));

    let response = {
        let mut game = state.game.write().await;
        let update = game.set_flag(flag, status, &carrier)?;
        match update.scored {
            Some(scorer) => info!(
                flag = update.flag.as_str(),
                carrier = %carrier,
                scored = scorer.as_str(),
                "flag captured"
            ),
            None => info!(
                flag = update.flag.as_str(),
                status,
                carrier = %carrier,
                "flag updated"
            ),
        }
        FlagResponse {
            ok: true,
            flags: game.flags.clone(),
            scores: update.scored.map(|_| game.scores.clone()),
        }
    };
    state.persist().await;

    Ok(Json(response))
}
