// Authentication: password hashing, JWT tokens, extractors and account handlers.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::config::{is_local_mode, LOCAL_EMAIL, LOCAL_LEARNER_ID};
use crate::db::User;
use crate::progress::LearnerId;

// ── JWT ──────────────────────────────────────────────────────────────

/// JWT secret – in production this should come from an env var.
fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "mathlingo-dev-secret-change-in-production".to_string())
        .into_bytes()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // learner id
    pub email: String,
    pub role: String,
    pub exp: usize, // expiry (unix timestamp)
}

impl Claims {
    pub fn learner_id(&self) -> LearnerId {
        LearnerId::new(self.sub.clone())
    }

    fn local() -> Self {
        Claims {
            sub: LOCAL_LEARNER_ID.to_string(),
            email: LOCAL_EMAIL.to_string(),
            role: "user".to_string(),
            exp: usize::MAX,
        }
    }
}

pub fn create_token(user_id: &str, email: &str, role: &str) -> Result<String, String> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(24))
        .ok_or_else(|| "Token expiry out of range".to_string())?
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role: role.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// Extracts the authenticated learner from the Authorization header.
/// In local mode every request is the local learner.
/// Usage: `AuthUser(claims)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if is_local_mode() {
            return Ok(AuthUser(Claims::local()));
        }

        if parts.headers.get("Authorization").is_none() {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Missing Authorization header"})),
            ));
        }

        let token = bearer_token(parts).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid Authorization header format"})),
            )
        })?;

        verify_token(token).map(AuthUser).map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid token"})),
            )
        })
    }
}

/// Optional auth extractor – does not reject if no valid token is present.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<Claims>);

impl<S> FromRequestParts<S> for OptionalAuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if is_local_mode() {
            return Ok(OptionalAuthUser(Some(Claims::local())));
        }
        Ok(OptionalAuthUser(
            bearer_token(parts).and_then(|token| verify_token(token).ok()),
        ))
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPublic,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublic {
    pub id: String,
    pub email: String,
    pub role: String,
    pub created_at: String,
}

impl From<User> for UserPublic {
    fn from(user: User) -> Self {
        UserPublic {
            id: user.id,
            email: user.email,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

/// Emails are compared trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "Internal error"})),
    )
        .into_response()
}

fn issue_token(user: User) -> axum::response::Response {
    match create_token(&user.id, &user.email, &user.role) {
        Ok(token) => Json(serde_json::json!(AuthResponse {
            token,
            user: user.into(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Token creation error: {e}");
            internal_error()
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let email = normalize_email(&req.email);
    if email.is_empty() || req.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "email and password are required"})),
        )
            .into_response();
    }

    if !email.contains('@') || email.len() > 254 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "email is not valid"})),
        )
            .into_response();
    }

    if req.password.len() < 8 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "password must be at least 8 characters"})),
        )
            .into_response();
    }

    let password_hash = match hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("Password hash error: {e}");
            return internal_error();
        }
    };

    match state.db.create_user(&email, &password_hash).await {
        Ok(user) => {
            tracing::info!("Registered learner {}", user.id);
            let response = issue_token(user);
            if response.status() == StatusCode::OK {
                let (mut parts, body) = response.into_parts();
                parts.status = StatusCode::CREATED;
                axum::response::Response::from_parts(parts, body)
            } else {
                response
            }
        }
        Err(e) => {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                (
                    StatusCode::CONFLICT,
                    Json(serde_json::json!({"error": "Email already registered"})),
                )
                    .into_response()
            } else {
                tracing::error!("DB error in register: {e}");
                internal_error()
            }
        }
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let email = normalize_email(&req.email);
    let user = match state.db.get_user_by_email(&email).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid credentials"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("DB error in login: {e}");
            return internal_error();
        }
    };

    match verify_password(&req.password, &user.password_hash) {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid credentials"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Password verify error: {e}");
            return internal_error();
        }
    }

    state.sessions.login(&LearnerId::new(user.id.clone())).await;
    issue_token(user)
}

pub async fn logout(AuthUser(claims): AuthUser, State(state): State<AppState>) -> impl IntoResponse {
    state.sessions.logout(&claims.learner_id()).await;
    StatusCode::NO_CONTENT
}

pub async fn me(AuthUser(claims): AuthUser, State(state): State<AppState>) -> impl IntoResponse {
    if is_local_mode() {
        return Json(serde_json::json!(UserPublic {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
            created_at: String::new(),
        }))
        .into_response();
    }

    match state.db.get_user(&claims.sub).await {
        Ok(Some(user)) => Json(serde_json::json!(UserPublic::from(user))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "User not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("DB error: {e}");
            internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "testpassword123";
        let hash = hash_password(password).unwrap();
        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrongpassword", &hash).unwrap());
    }

    #[test]
    fn test_jwt_create_and_verify() {
        let token = create_token("0b5c-learner", "ana@example.com", "user").unwrap();
        let claims = verify_token(&token).unwrap();
        assert_eq!(claims.sub, "0b5c-learner");
        assert_eq!(claims.email, "ana@example.com");
        assert_eq!(claims.role, "user");
        assert_eq!(claims.learner_id(), LearnerId::new("0b5c-learner"));
    }

    #[test]
    fn test_jwt_invalid_token() {
        assert!(verify_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ana@Example.COM "), "ana@example.com");
        assert_eq!(normalize_email("   "), "");
    }
}
