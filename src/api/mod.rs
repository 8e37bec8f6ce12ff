// REST API routes for the catalog, progress and tutoring help.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Request, State},
    http::{header, request::Parts, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::auth::{self, AuthUser, Claims, OptionalAuthUser};
use crate::db::{Database, Lesson, Question};
use crate::help::{coerce_text, HelpService};
use crate::metrics;
use crate::progress::sessions::SessionRegistry;
use crate::progress::{parse_lesson_id, ProgressError, ProgressView};
use crate::rate_limit::{RateLimitType, RateLimiter};

// ── Request / Response types ──────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub question_id: i64,
    pub selected_index: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub correct: bool,
    pub correct_index: i64,
}

/// Lesson ids arrive from clients in many shapes; they are coerced later.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLessonRequest {
    #[serde(default)]
    pub lesson_id: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiHelpRequest {
    #[serde(default)]
    pub question: Value,
    #[serde(default)]
    pub lesson_context: Value,
}

#[derive(Serialize)]
pub struct LessonStatus {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub locked: bool,
    pub completed: bool,
}

#[derive(Serialize)]
pub struct LessonDetail {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub questions: Vec<Question>,
}

// ── App state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub sessions: SessionRegistry,
    pub help: Arc<HelpService>,
    pub rate_limiter: RateLimiter,
}

// ── Helpers ───────────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

fn internal_error(e: sqlx::Error) -> Response {
    tracing::error!("Database error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn progress_error(e: ProgressError) -> Response {
    tracing::error!("Progress write failed: {e}");
    json_error(StatusCode::SERVICE_UNAVAILABLE, "Progress could not be saved")
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState, frontend_origin: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(frontend_origin.clone())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // The help endpoint is called straight from the browser with a plain
    // JSON body, so it gets the narrowest policy.
    let help_cors = CorsLayer::new()
        .allow_origin(frontend_origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let help = Router::new()
        .route("/api/ai-help", post(ai_help))
        .layer(help_cors);

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Auth
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        // Catalog
        .route("/api/courses", get(list_courses))
        .route("/api/courses/{id}", get(get_course))
        .route("/api/courses/{id}/lessons", get(list_course_lessons))
        .route("/api/lessons/{id}", get(get_lesson))
        .route("/api/lessons/{id}/answers", post(answer_question))
        // Progress
        .route("/api/progress", get(get_progress))
        .route("/api/progress/complete", post(complete_lesson))
        .layer(cors);

    api.merge(help)
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Records request counts and latency per normalized path.
async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

// ── Health & metrics ──────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "mathlingo-backend" }))
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

// ── Catalog handlers ──────────────────────────────────────────────────

async fn list_courses(State(state): State<AppState>) -> Response {
    match state.db.list_courses().await {
        Ok(courses) => Json(json!(courses)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_course(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.db.get_course(id).await {
        Ok(Some(course)) => Json(json!(course)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Course not found"),
        Err(e) => internal_error(e),
    }
}

async fn list_course_lessons(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    match state.db.get_course(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Course not found"),
        Err(e) => return internal_error(e),
    }

    let lessons = match state.db.list_lessons(id).await {
        Ok(lessons) => lessons,
        Err(e) => return internal_error(e),
    };
    let order: Vec<i64> = lessons.iter().map(|l| l.id).collect();

    let engine = state.sessions.engine(&claims.learner_id()).await;

    let statuses: Vec<LessonStatus> = lessons
        .into_iter()
        .map(|lesson| LessonStatus {
            locked: !engine.is_unlocked(lesson.id, &order),
            completed: engine.progress().is_completed(lesson.id),
            lesson,
        })
        .collect();
    Json(json!(statuses)).into_response()
}

async fn get_lesson(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    let lesson = match state.db.get_lesson(id).await {
        Ok(Some(lesson)) => lesson,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Lesson not found"),
        Err(e) => return internal_error(e),
    };

    let order: Vec<i64> = match state.db.list_lessons(lesson.course_id).await {
        Ok(lessons) => lessons.iter().map(|l| l.id).collect(),
        Err(e) => return internal_error(e),
    };

    let unlocked = state
        .sessions
        .engine(&claims.learner_id())
        .await
        .is_unlocked(lesson.id, &order);
    if !unlocked {
        return json_error(StatusCode::FORBIDDEN, "Lesson is locked");
    }

    match state.db.list_questions(id).await {
        Ok(questions) => Json(json!(LessonDetail { lesson, questions })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn answer_question(
    AuthUser(_claims): AuthUser,
    State(state): State<AppState>,
    Path(lesson_id): Path<i64>,
    Json(req): Json<AnswerRequest>,
) -> Response {
    match state.db.get_question(req.question_id).await {
        Ok(Some(question)) if question.lesson_id == lesson_id => Json(json!(AnswerResponse {
            correct: question.correct_index == req.selected_index,
            correct_index: question.correct_index,
        }))
        .into_response(),
        Ok(_) => json_error(StatusCode::NOT_FOUND, "Question not found"),
        Err(e) => internal_error(e),
    }
}

// ── Progress handlers ─────────────────────────────────────────────────

async fn get_progress(AuthUser(claims): AuthUser, State(state): State<AppState>) -> Response {
    let engine = state.sessions.engine(&claims.learner_id()).await;
    Json(json!(ProgressView::from(engine.progress()))).into_response()
}

async fn complete_lesson(
    AuthUser(claims): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CompleteLessonRequest>,
) -> Response {
    let mut engine = state.sessions.engine(&claims.learner_id()).await;

    // Unusable ids are a no-op; the client just gets its current progress.
    let Some(lesson_id) = parse_lesson_id(&req.lesson_id) else {
        return Json(json!(ProgressView::from(engine.progress()))).into_response();
    };

    match engine.complete_lesson(lesson_id).await {
        Ok(progress) => Json(json!(ProgressView::from(&progress))).into_response(),
        Err(e) => progress_error(e),
    }
}

// ── Tutoring help ─────────────────────────────────────────────────────

/// Peer address of the caller, present when the server is run with
/// connect info.
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Rate-limit bucket for a caller: the learner when signed in, otherwise
/// the client address.
fn help_limit_key(claims: Option<&Claims>, client: &ClientAddr) -> (String, RateLimitType) {
    match (claims, client.0) {
        (Some(claims), _) => (claims.sub.clone(), RateLimitType::AiHelp),
        (None, Some(addr)) => (addr.ip().to_string(), RateLimitType::AnonymousAiHelp),
        (None, None) => ("unknown".to_string(), RateLimitType::AnonymousAiHelp),
    }
}

async fn ai_help(
    OptionalAuthUser(claims): OptionalAuthUser,
    client: ClientAddr,
    State(state): State<AppState>,
    Json(req): Json<AiHelpRequest>,
) -> Response {
    let question = coerce_text(&req.question);
    let lesson_context = coerce_text(&req.lesson_context);

    // Invalid questions never spend quota
    if let Err(e) = state.help.check_question(&question) {
        return e.into_response();
    }

    let (key, limit_type) = help_limit_key(claims.as_ref(), &client);
    if let Err(e) = state.rate_limiter.check_limit(&key, limit_type) {
        metrics::AI_HELP_REQUESTS_TOTAL
            .with_label_values(&["rate_limited"])
            .inc();
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string());
    }

    match state.help.ask(&question, &lesson_context).await {
        Ok(answer) => Json(json!({ "answer": answer })).into_response(),
        Err(e) => e.into_response(),
    }
}
