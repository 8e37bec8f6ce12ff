// End-to-end tests of the HTTP surface against an in-memory database.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use mathlingo_backend::api::{self, AppState};
use mathlingo_backend::db::Database;
use mathlingo_backend::help::{ChatProvider, ChatRequest, HelpService, ProviderError};
use mathlingo_backend::progress::sessions::SessionRegistry;
use mathlingo_backend::progress::store::RemoteStore;
use mathlingo_backend::rate_limit::RateLimiter;

const ORIGIN: &str = "http://localhost:5173";

struct CannedProvider(Option<String>);

#[async_trait]
impl ChatProvider for CannedProvider {
    async fn complete(&self, _request: &ChatRequest) -> Result<Option<String>, ProviderError> {
        Ok(self.0.clone())
    }
}

async fn app_with_provider(provider: Option<Arc<dyn ChatProvider>>) -> Router {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let state = AppState {
        db: db.clone(),
        sessions: SessionRegistry::new(Arc::new(RemoteStore::new(db))),
        help: Arc::new(HelpService::new(provider, "gpt-4o-mini")),
        rate_limiter: RateLimiter::new(),
    };
    api::router(state, HeaderValue::from_static(ORIGIN))
}

async fn app() -> Router {
    app_with_provider(Some(Arc::new(CannedProvider(Some("Answer text".into()))))).await
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// Marks a request as coming from `peer`, as the server does for real
/// connections.
fn from_peer(mut req: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

/// Registers and logs in, returning the bearer token.
async fn sign_in(app: &Router, email: &str) -> String {
    let credentials = json!({ "email": email, "password": "correct-horse" });
    let (status, _) = send(app, post_json("/api/auth/register", None, credentials.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(app, post_json("/api/auth/login", None, credentials)).await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_register_validation_and_duplicates() {
    let app = app().await;

    let (status, body) = send(
        &app,
        post_json("/api/auth/register", None, json!({"email": "", "password": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app,
        post_json(
            "/api/auth/register",
            None,
            json!({"email": "Ana@Example.com", "password": "correct-horse"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["email"], "ana@example.com");

    let (status, _) = send(
        &app,
        post_json(
            "/api/auth/register",
            None,
            json!({"email": "ana@example.com", "password": "another-pass"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        post_json(
            "/api/auth/login",
            None,
            json!({"email": "ana@example.com", "password": "wrong-password"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_progress_requires_token() {
    let app = app().await;
    let (status, _) = send(&app, get("/api/progress", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fresh_learner_starts_at_zero() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    let (status, body) = send(&app, get("/api/progress", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "completedLessons": [],
            "xp": 0,
            "currentStreak": 0,
            "level": 1,
            "xpWithinLevel": 0,
            "xpForNextLevel": 100
        })
    );
}

#[tokio::test]
async fn test_complete_lesson_is_idempotent() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    let (status, body) = send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["xp"], 20);
    assert_eq!(body["currentStreak"], 1);
    assert_eq!(body["completedLessons"], json!([1]));

    // Same lesson again, this time as a string
    let (status, body) = send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["xp"], 20);
    assert_eq!(body["currentStreak"], 1);
}

#[tokio::test]
async fn test_invalid_lesson_ids_are_ignored() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    for lesson_id in [json!(0), json!(-5), json!("abc"), json!(null), json!(true)] {
        let (status, body) = send(
            &app,
            post_json(
                "/api/progress/complete",
                Some(&token),
                json!({ "lessonId": lesson_id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["xp"], 0);
        assert_eq!(body["completedLessons"], json!([]));
    }
}

#[tokio::test]
async fn test_progress_survives_new_session() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;
    send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": 1})),
    )
    .await;

    let (status, _) = send(&app, post_json("/api/auth/logout", Some(&token), json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(
        &app,
        post_json(
            "/api/auth/login",
            None,
            json!({"email": "ana@example.com", "password": "correct-horse"}),
        ),
    )
    .await;
    let token = body["token"].as_str().unwrap();
    let (_, body) = send(&app, get("/api/progress", Some(token))).await;
    assert_eq!(body["xp"], 20);
    assert_eq!(body["completedLessons"], json!([1]));
}

#[tokio::test]
async fn test_lessons_unlock_in_order() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    let (status, body) = send(&app, get("/api/courses/1/lessons", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let locked: Vec<bool> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["locked"].as_bool().unwrap())
        .collect();
    assert_eq!(locked, vec![false, true, true, true]);

    let (status, _) = send(&app, get("/api/lessons/2", Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": 1})),
    )
    .await;

    let (status, body) = send(&app, get("/api/lessons/2", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 2);
    assert!(!body["questions"].as_array().unwrap().is_empty());
    assert!(body["questions"][0].get("correctIndex").is_none());

    let (_, body) = send(&app, get("/api/courses/1/lessons", Some(&token))).await;
    assert_eq!(body[0]["completed"], true);
    assert_eq!(body[1]["locked"], false);
    assert_eq!(body[2]["locked"], true);
}

#[tokio::test]
async fn test_unknown_catalog_entries() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    let (status, _) = send(&app, get("/api/courses/99", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, get("/api/lessons/99", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_courses_listing() {
    let app = app().await;
    let (status, body) = send(&app, get("/api/courses", None)).await;
    assert_eq!(status, StatusCode::OK);
    let courses = body.as_array().unwrap();
    assert_eq!(courses.len(), 2);
    assert_eq!(courses[0]["lessonCount"], 4);
    assert_eq!(courses[1]["lessonCount"], 2);
}

#[tokio::test]
async fn test_answer_checking() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    let (_, lesson) = send(&app, get("/api/lessons/1", Some(&token))).await;
    let question_id = lesson["questions"][0]["id"].as_i64().unwrap();

    let (status, body) = send(
        &app,
        post_json(
            "/api/lessons/1/answers",
            Some(&token),
            json!({"questionId": question_id, "selectedIndex": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"correct": true, "correctIndex": 1}));

    let (_, body) = send(
        &app,
        post_json(
            "/api/lessons/1/answers",
            Some(&token),
            json!({"questionId": question_id, "selectedIndex": 0}),
        ),
    )
    .await;
    assert_eq!(body["correct"], false);

    // A question from another lesson
    let (status, _) = send(
        &app,
        post_json(
            "/api/lessons/2/answers",
            Some(&token),
            json!({"questionId": question_id, "selectedIndex": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Tutoring help ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_help_empty_question() {
    let app = app().await;
    for body in [json!({"question": ""}), json!({"question": "   "}), json!({})] {
        let (status, body) = send(&app, post_json("/api/ai-help", None, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_help_answers() {
    let app = app().await;
    let (status, body) = send(
        &app,
        post_json(
            "/api/ai-help",
            None,
            json!({"question": "Why is 2+3=5?", "lessonContext": "Addition"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"answer": "Answer text"}));
}

#[tokio::test]
async fn test_help_without_api_key() {
    let app = app_with_provider(None).await;
    let (status, body) = send(&app, post_json("/api/ai-help", None, json!({"question": "2+2?"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("OPENAI_API_KEY"));
}

#[tokio::test]
async fn test_help_empty_model_answer() {
    let app = app_with_provider(Some(Arc::new(CannedProvider(None)))).await;
    let (status, _) = send(&app, post_json("/api/ai-help", None, json!({"question": "2+2?"}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_help_rate_limit_per_learner() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    for _ in 0..30 {
        let (status, _) = send(
            &app,
            post_json("/api/ai-help", Some(&token), json!({"question": "2+2?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(
        &app,
        post_json("/api/ai-help", Some(&token), json!({"question": "2+2?"})),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_help_cors_preflight() {
    let app = app().await;
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/ai-help")
        .header(header::ORIGIN, ORIGIN)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
    let allowed = headers[header::ACCESS_CONTROL_ALLOW_HEADERS]
        .to_str()
        .unwrap()
        .to_lowercase();
    assert!(allowed.contains("content-type"));
    assert!(!allowed.contains("authorization"));
}

#[tokio::test]
async fn test_invalid_help_requests_do_not_spend_quota() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    for _ in 0..40 {
        let (status, _) = send(
            &app,
            post_json("/api/ai-help", Some(&token), json!({"question": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    for _ in 0..30 {
        let (status, _) = send(
            &app,
            post_json("/api/ai-help", Some(&token), json!({"question": "2+2?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // Quota spent, but an empty question is still a validation error
    let (status, _) = send(
        &app,
        post_json("/api/ai-help", Some(&token), json!({"question": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_anonymous_help_is_limited_per_address() {
    let app = app().await;
    let ask = |peer: &str, question: &str| {
        from_peer(
            post_json("/api/ai-help", None, json!({ "question": question })),
            peer,
        )
    };

    for _ in 0..200 {
        let (status, _) = send(&app, ask("198.51.100.4:40000", "2+2?")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(&app, ask("198.51.100.4:40001", "2+2?")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, ask("198.51.100.4:40000", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Another browser is unaffected
    let (status, body) = send(&app, ask("198.51.100.9:40000", "2+2?")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "Answer text");
}

#[tokio::test]
async fn test_completing_a_locked_lesson_is_accepted() {
    let app = app().await;
    let token = sign_in(&app, "ana@example.com").await;

    // Lesson 3 sits behind lessons 1 and 2
    let (status, _) = send(&app, get("/api/lessons/3", Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["xp"], 20);
    assert_eq!(body["completedLessons"], json!([3]));

    // Completion is recorded; unlocking still follows the predecessor rule
    let (_, body) = send(&app, get("/api/courses/1/lessons", Some(&token))).await;
    let flags: Vec<(bool, bool)> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|l| (l["locked"].as_bool().unwrap(), l["completed"].as_bool().unwrap()))
        .collect();
    assert_eq!(
        flags,
        vec![(false, false), (true, false), (true, true), (false, false)]
    );

    // Ids outside the catalog are credited the same way
    let (_, body) = send(
        &app,
        post_json("/api/progress/complete", Some(&token), json!({"lessonId": 999})),
    )
    .await;
    assert_eq!(body["xp"], 40);
}
