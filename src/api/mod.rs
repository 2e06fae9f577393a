// HTTP API routes: players, ladders, match commands, thread registry and
// tournaments. Every match command maps `MatchError` onto a status code.

use axum::{
    extract::{Json, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::bracket::{BracketService, SeedingMethod};
use crate::db::Database;
use crate::elo::STARTING_ELO;
use crate::error::MatchError;
use crate::lifecycle::{MatchLifecycle, ScoreReport};
use crate::metrics;
use crate::models::{MatchKind, MatchRef, ThreadHandle};
use crate::notify::NotificationSink;
use crate::queue::{self, MatchmakingQueue};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreatePlayerRequest {
    pub discord_id: String,
    pub gamertag: String,
}

#[derive(Deserialize)]
pub struct CreateLadderRequest {
    pub name: String,
}

/// Admin command setting a ladder's per-opponent daily match limit.
#[derive(Deserialize)]
pub struct DailyLimitRequest {
    pub discord_id: String,
    pub limit: i64,
}

#[derive(Deserialize)]
pub struct CreateLadderMatchRequest {
    pub player1_id: i64,
    pub player2_id: i64,
}

/// Body of commands that only need to know who is asking.
#[derive(Deserialize)]
pub struct ActorRequest {
    pub discord_id: String,
}

#[derive(Deserialize)]
pub struct ReportRequest {
    pub discord_id: String,
    #[serde(flatten)]
    pub score: ScoreReport,
}

#[derive(Deserialize)]
pub struct DisputeRequest {
    pub discord_id: String,
    pub reason: String,
    pub evidence: Option<String>,
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub discord_id: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Deserialize)]
pub struct RegisterThreadRequest {
    pub kind: String,
    pub id: i64,
}

#[derive(Deserialize)]
pub struct CreateCompetitionRequest {
    pub name: String,
    pub slug: Option<String>,
}

#[derive(Deserialize)]
pub struct SeedingRequest {
    pub method: String,
    pub ladder_id: Option<i64>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub sink: Arc<dyn NotificationSink>,
    pub lifecycle: Arc<MatchLifecycle>,
    pub brackets: Arc<BracketService>,
    pub queue: MatchmakingQueue,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

/// Store failures share the `{error, message}` shape of every other command
/// error; the cause stays in the log.
fn internal_error(e: sqlx::Error) -> Response {
    tracing::error!("Database error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error", "message": "Internal server error" })),
    )
        .into_response()
}

fn match_error(e: MatchError) -> Response {
    let e = match e {
        MatchError::Internal(inner) => return internal_error(inner),
        other => other,
    };
    let status = match &e {
        MatchError::NotFound => StatusCode::NOT_FOUND,
        MatchError::WrongState(_)
        | MatchError::Disputed
        | MatchError::AlreadyConfirmed
        | MatchError::ConcurrentModification => StatusCode::CONFLICT,
        MatchError::NotParticipant | MatchError::Unauthorized => StatusCode::FORBIDDEN,
        MatchError::NotRegistered
        | MatchError::DrawRejected
        | MatchError::TieBreakInvalid
        | MatchError::NotEnoughParticipants { .. }
        | MatchError::InvalidSeeding(_)
        | MatchError::MissingLadder => StatusCode::BAD_REQUEST,
        MatchError::Internal(_) => unreachable!(),
    };
    (
        status,
        Json(json!({ "error": e.kind(), "message": e.to_string() })),
    )
        .into_response()
}

fn parse_match_ref(kind: &str, id: i64) -> Result<MatchRef, Response> {
    MatchKind::from_str_name(kind)
        .map(|k| MatchRef::new(k, id))
        .ok_or_else(|| {
            json_error(StatusCode::BAD_REQUEST, "kind must be ladder or tournament").into_response()
        })
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Players and ladders
        .route("/api/players", post(create_player))
        .route("/api/ladders", post(create_ladder))
        .route("/api/ladders/{id}/matches", post(create_ladder_match))
        .route("/api/ladders/{id}/standings", get(ladder_standings))
        .route("/api/ladders/{id}/daily-limit", put(set_daily_limit))
        .route(
            "/api/ladders/{id}/players/{player_id}/history",
            get(rating_history),
        )
        .route(
            "/api/ladders/{id}/queue",
            post(join_queue).delete(leave_queue),
        )
        // Match commands
        .route("/api/matches/{kind}/{id}", get(get_match))
        .route("/api/matches/{kind}/{id}/report", post(report_match))
        .route("/api/matches/{kind}/{id}/confirm", post(confirm_match))
        .route("/api/matches/{kind}/{id}/dispute", post(dispute_match))
        .route("/api/matches/{kind}/{id}/resolve", post(resolve_match))
        .route("/api/matches/{kind}/{id}/cancel", post(cancel_match))
        // Thread registry
        .route("/api/threads/{thread}", get(lookup_thread).post(register_thread))
        // Tournaments
        .route("/api/competitions", post(create_competition))
        .route("/api/competitions/{id}", get(get_competition))
        .route("/api/competitions/{id}/participants", post(add_participant))
        .route("/api/competitions/{id}/seeding", post(generate_seeding))
        .route("/api/competitions/{id}/start", post(start_competition))
        .route("/api/competitions/{id}/matches", get(list_competition_matches))
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

/// Count and time every request under its normalized path.
async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[&endpoint])
        .observe(start.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "ladder-bot" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Player and ladder handlers ───────────────────────────────────────

async fn create_player(
    State(state): State<AppState>,
    Json(req): Json<CreatePlayerRequest>,
) -> impl IntoResponse {
    if req.discord_id.is_empty() || req.gamertag.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "discord_id and gamertag are required")
            .into_response();
    }
    match state.db.upsert_player(&req.discord_id, &req.gamertag).await {
        Ok(player) => (StatusCode::CREATED, Json(json!(player))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn create_ladder(
    State(state): State<AppState>,
    Json(req): Json<CreateLadderRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    match state.db.create_ladder(&req.name).await {
        Ok(ladder) => (StatusCode::CREATED, Json(json!(ladder))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn create_ladder_match(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CreateLadderMatchRequest>,
) -> impl IntoResponse {
    if req.player1_id == req.player2_id {
        return json_error(StatusCode::BAD_REQUEST, "players must differ").into_response();
    }
    match state.db.get_ladder(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Ladder not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    }
    for player_id in [req.player1_id, req.player2_id] {
        match state.db.get_player(player_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return json_error(StatusCode::NOT_FOUND, "Player not found").into_response()
            }
            Err(e) => return internal_error(e).into_response(),
        }
    }
    match queue::open_ladder_match(
        &state.db,
        state.sink.as_ref(),
        id,
        req.player1_id,
        req.player2_id,
    )
    .await
    {
        Ok(created) => (StatusCode::CREATED, Json(json!(created))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn set_daily_limit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DailyLimitRequest>,
) -> impl IntoResponse {
    if let Err(e) = state.lifecycle.require_admin(&req.discord_id).await {
        return match_error(e);
    }
    let Some(limit) = i32::try_from(req.limit).ok().filter(|&l| l >= 1) else {
        return json_error(StatusCode::BAD_REQUEST, "limit must be at least 1").into_response();
    };
    match state.db.set_max_matches_per_opponent(id, Some(limit)).await {
        Ok(Some(ladder)) => {
            tracing::info!(
                "Admin {} set the daily per-opponent limit of ladder {id} to {limit}",
                req.discord_id
            );
            (StatusCode::OK, Json(json!(ladder))).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Ladder not found").into_response(),
        Err(e) => internal_error(e),
    }
}

async fn ladder_standings(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.db.standings(id).await {
        Ok(rows) => (StatusCode::OK, Json(json!(rows))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn rating_history(
    State(state): State<AppState>,
    Path((id, player_id)): Path<(i64, i64)>,
) -> impl IntoResponse {
    match state.db.rating_history(player_id, id).await {
        Ok(rows) => (StatusCode::OK, Json(json!(rows))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn join_queue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> impl IntoResponse {
    let player = match state.db.resolve_player(&req.discord_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return match_error(MatchError::NotRegistered),
        Err(e) => return internal_error(e).into_response(),
    };
    let rating = match state.db.get_rating(player.id, id).await {
        Ok(r) => r.map_or(STARTING_ELO, |r| r.rating),
        Err(e) => return internal_error(e).into_response(),
    };
    let added = state.queue.enqueue(player.id, id, rating);
    let status = state.queue.status(player.id, id);
    let code = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (code, Json(json!(status))).into_response()
}

async fn leave_queue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> impl IntoResponse {
    let player = match state.db.resolve_player(&req.discord_id).await {
        Ok(Some(p)) => p,
        Ok(None) => return match_error(MatchError::NotRegistered),
        Err(e) => return internal_error(e).into_response(),
    };
    if state.queue.remove(player.id, id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        json_error(StatusCode::NOT_FOUND, "Not queued").into_response()
    }
}

// ── Match handlers ───────────────────────────────────────────────────

async fn get_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let record = match state.db.get_match_record(r).await {
        Ok(Some(record)) => record,
        Ok(None) => return match_error(MatchError::NotFound),
        Err(e) => return internal_error(e).into_response(),
    };
    let (thread, disputes) = match (
        state.db.thread_for_match(r).await,
        state.db.list_disputes(r).await,
    ) {
        (Ok(t), Ok(d)) => (t, d),
        (Err(e), _) | (_, Err(e)) => return internal_error(e).into_response(),
    };
    (
        StatusCode::OK,
        Json(json!({ "record": record, "thread": thread, "disputes": disputes })),
    )
        .into_response()
}

async fn report_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<ReportRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state
        .lifecycle
        .report_result(r, &req.discord_id, req.score)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(json!(record))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn confirm_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<ActorRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.lifecycle.confirm_result(r, &req.discord_id).await {
        Ok(confirmation) => (StatusCode::OK, Json(json!(confirmation))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn dispute_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<DisputeRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if req.reason.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "reason is required").into_response();
    }
    match state
        .lifecycle
        .open_dispute(r, &req.discord_id, &req.reason, req.evidence.as_deref())
        .await
    {
        Ok(dispute) => (StatusCode::CREATED, Json(json!(dispute))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn resolve_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<ResolveRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state
        .lifecycle
        .resolve_dispute(r, &req.discord_id, &req.notes)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(json!(record))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn cancel_match(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<ActorRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&kind, id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.lifecycle.cancel_match(r, &req.discord_id).await {
        Ok(record) => (StatusCode::OK, Json(json!(record))).into_response(),
        Err(e) => match_error(e),
    }
}

// ── Thread registry handlers ─────────────────────────────────────────

async fn lookup_thread(
    State(state): State<AppState>,
    Path(thread): Path<String>,
) -> impl IntoResponse {
    let r = match state.lifecycle.resolve_thread(&ThreadHandle(thread)).await {
        Ok(r) => r,
        Err(e) => return match_error(e),
    };
    match state.db.get_match_record(r).await {
        Ok(Some(record)) => (StatusCode::OK, Json(json!(record))).into_response(),
        Ok(None) => match_error(MatchError::NotFound),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn register_thread(
    State(state): State<AppState>,
    Path(thread): Path<String>,
    Json(req): Json<RegisterThreadRequest>,
) -> impl IntoResponse {
    let r = match parse_match_ref(&req.kind, req.id) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.db.get_match_record(r).await {
        Ok(Some(_)) => {}
        Ok(None) => return match_error(MatchError::NotFound),
        Err(e) => return internal_error(e).into_response(),
    }
    match state.db.register_thread(r, &ThreadHandle(thread)).await {
        Ok(true) => (StatusCode::CREATED, Json(json!({ "match": r }))).into_response(),
        Ok(false) => {
            json_error(StatusCode::CONFLICT, "Thread or match already registered").into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Tournament handlers ──────────────────────────────────────────────

async fn create_competition(
    State(state): State<AppState>,
    Json(req): Json<CreateCompetitionRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    let slug = req.slug.unwrap_or_else(|| slugify(&req.name));
    match state.db.create_competition(&req.name, &slug).await {
        Ok(competition) => (StatusCode::CREATED, Json(json!(competition))).into_response(),
        Err(e)
            if e.as_database_error()
                .is_some_and(|d| d.is_unique_violation()) =>
        {
            json_error(StatusCode::CONFLICT, "Slug already taken").into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_competition(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    let competition = match state.db.get_competition(id).await {
        Ok(Some(c)) => c,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Competition not found").into_response(),
        Err(e) => return internal_error(e).into_response(),
    };
    match state.db.list_participants(id).await {
        Ok(participants) => (
            StatusCode::OK,
            Json(json!({ "competition": competition, "participants": participants })),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn add_participant(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> impl IntoResponse {
    match state.brackets.register_participant(id, &req.discord_id).await {
        Ok(participant) => (StatusCode::CREATED, Json(json!(participant))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn generate_seeding(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SeedingRequest>,
) -> impl IntoResponse {
    let Some(method) = SeedingMethod::from_str_name(&req.method) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "method must be registration, ladder or random",
        )
        .into_response();
    };
    match state
        .brackets
        .generate_seeding(id, method, req.ladder_id)
        .await
    {
        Ok(seeded) => (StatusCode::OK, Json(json!(seeded))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn start_competition(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.brackets.start_bracket(id).await {
        Ok(start) => (StatusCode::OK, Json(json!(start))).into_response(),
        Err(e) => match_error(e),
    }
}

async fn list_competition_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.db.list_tournament_matches(id).await {
        Ok(matches) => (StatusCode::OK, Json(json!(matches))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Spring Cup 2024"), "spring-cup-2024");
        assert_eq!(slugify("  FIFA -- Open!! "), "fifa-open");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(match_error(MatchError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(match_error(MatchError::Disputed).status(), StatusCode::CONFLICT);
        assert_eq!(
            match_error(MatchError::NotParticipant).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            match_error(MatchError::DrawRejected).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            match_error(MatchError::Internal(sqlx::Error::RowNotFound)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_store_failure_body_has_error_kind() {
        for resp in [
            internal_error(sqlx::Error::PoolTimedOut),
            match_error(MatchError::Internal(sqlx::Error::RowNotFound)),
        ] {
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["error"], "internal_error");
            assert_eq!(body["message"], "Internal server error");
        }
    }

    #[test]
    fn test_parse_match_ref() {
        assert_eq!(parse_match_ref("ladder", 3).unwrap(), MatchRef::Ladder(3));
        assert_eq!(
            parse_match_ref("tournament", 9).unwrap(),
            MatchRef::Tournament(9)
        );
        assert!(parse_match_ref("friendly", 1).is_err());
    }
}
