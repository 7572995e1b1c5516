//! Axum HTTP surface for Therabook: search/options/page-view JSON APIs, the
//! admin dashboard API behind bearer sessions, the sitemap endpoint, and the
//! email relay endpoints (notifications + password reset).

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use therabook_backend::{BackendError, Config, EmailMessage, EmailRelay, MailRelay};
use therabook_gateway::{
    AccountSortKey, AccountStore, AccountManager, PageViewTracker, PgAccountStore,
    PgProfileOptions, PgSitemapSource, PgTherapistSearch, PgViewSink, ProfileOptionLoader,
    SearchGateway, SessionError, SessionManager, SitemapBuilder, TherapistFilters,
};

pub const CRATE_NAME: &str = "therabook-web";

const MSG_UPSTREAM: &str = "일시적인 오류가 발생했습니다. 잠시 후 다시 시도해주세요.";
const MSG_AUTH: &str = "인증이 필요합니다.";
const MSG_FORBIDDEN: &str = "접근 권한이 없습니다.";
const MSG_NOT_FOUND: &str = "요청한 정보를 찾을 수 없습니다.";
const MSG_RESET_SENT: &str = "비밀번호 재설정 링크를 이메일로 보냈습니다.";

/// HTTP-facing error taxonomy. Backend details never cross this boundary;
/// they are logged at the call site and reduced to a localized message.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Auth,
    Forbidden,
    Conflict(String),
    NotFound,
    Upstream,
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Auth => (StatusCode::UNAUTHORIZED, MSG_AUTH.to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, MSG_FORBIDDEN.to_string()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::NotFound => (StatusCode::NOT_FOUND, MSG_NOT_FOUND.to_string()),
            Self::Upstream => (StatusCode::INTERNAL_SERVER_ERROR, MSG_UPSTREAM.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound => Self::NotFound,
            other => {
                error!(error = %other, "backend call failed");
                Self::Upstream
            }
        }
    }
}

/// Seam over the recovery-token procedure so the password-reset handler is
/// testable without a database. `None` means no account matched the email.
#[async_trait]
pub trait RecoveryTokenRpc: Send + Sync {
    async fn create_reset_token(&self, email: &str) -> Result<Option<Uuid>, BackendError>;
}

pub struct PgRecoveryTokens {
    pool: PgPool,
}

impl PgRecoveryTokens {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecoveryTokenRpc for PgRecoveryTokens {
    async fn create_reset_token(&self, email: &str) -> Result<Option<Uuid>, BackendError> {
        let token: Option<Uuid> = sqlx::query_scalar("SELECT create_password_reset_token($1)")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| BackendError::rpc("create_password_reset_token", err))?;
        Ok(token)
    }
}

pub struct AppState {
    pub search: SearchGateway,
    pub options: ProfileOptionLoader,
    pub tracker: PageViewTracker,
    pub accounts: Arc<dyn AccountStore>,
    pub sessions: SessionManager,
    pub sitemap: SitemapBuilder,
    pub mailer: Arc<dyn MailRelay>,
    pub recovery: Arc<dyn RecoveryTokenRpc>,
    pub base_url: String,
}

impl AppState {
    /// Wires every seam to its Postgres/provider implementation.
    pub fn from_backend(config: &Config, pool: PgPool) -> anyhow::Result<Self> {
        Ok(Self {
            search: SearchGateway::new(Arc::new(PgTherapistSearch::new(pool.clone()))),
            options: ProfileOptionLoader::new(Arc::new(PgProfileOptions::new(pool.clone()))),
            tracker: PageViewTracker::new(Arc::new(PgViewSink::new(pool.clone()))),
            accounts: Arc::new(PgAccountStore::new(pool.clone())),
            sessions: SessionManager::from_config(config),
            sitemap: SitemapBuilder::new(
                Arc::new(PgSitemapSource::new(pool.clone())),
                config.site_base_url.clone(),
            ),
            mailer: Arc::new(EmailRelay::new(config)?),
            recovery: Arc::new(PgRecoveryTokens::new(pool)),
            base_url: config.site_base_url.trim_end_matches('/').to_string(),
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/therapists/search", post(search_handler))
        .route("/api/profile-options", get(options_handler))
        .route("/api/page-views", post(page_view_handler))
        .route("/api/admin/login", post(admin_login_handler))
        .route("/api/admin/logout", post(admin_logout_handler))
        .route("/api/admin/accounts", get(admin_accounts_handler))
        .route(
            "/api/admin/accounts/{id}/status",
            post(admin_account_status_handler),
        )
        .route("/api/admin/accounts/{id}", delete(admin_account_delete_handler))
        .route("/sitemap.xml", get(sitemap_handler))
        .route("/api/notifications", post(notification_handler))
        .route("/api/auth/password-reset", post(password_reset_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &Config, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    info!(port = config.listen_port, "therabook web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(filters): Json<TherapistFilters>,
) -> Response {
    // Errors are part of the outcome contract here, never an HTTP failure.
    Json(state.search.search(&filters).await).into_response()
}

async fn options_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.options.load().await).into_response()
}

#[derive(Debug, Deserialize)]
struct PageViewRequest {
    path: Option<String>,
}

async fn page_view_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PageViewRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let path = request
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("path가 필요합니다.".into()))?;
    let ip = header_value(&headers, "x-forwarded-for").unwrap_or_else(|| "unknown".into());
    let user_agent = header_value(&headers, "user-agent").unwrap_or_default();

    let outcome = state.tracker.track(&path, &ip, &user_agent).await?;
    Ok(Json(json!({
        "recorded": outcome == therabook_gateway::TrackOutcome::Recorded,
    })))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

// ---------------------------------------------------------------------------
// Admin API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

async fn admin_login_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let username = request
        .username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::Validation("username이 필요합니다.".into()))?;
    let password = request
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::Validation("password가 필요합니다.".into()))?;

    match state.sessions.create(&username, &password).await {
        Ok(context) => Ok(Json(json!({
            "token": context.token,
            "expiresAt": context.expires_at,
        }))),
        Err(SessionError::InvalidCredentials) => Err(ApiError::Auth),
        Err(SessionError::Disabled) => Err(ApiError::Forbidden),
    }
}

async fn admin_logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<JsonValue>, ApiError> {
    let token = require_session(&state, &headers).await?;
    state.sessions.destroy(token).await;
    Ok(Json(json!({ "success": true })))
}

async fn require_session(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = header_value(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(|t| t.to_string()))
        .and_then(|t| Uuid::parse_str(t.trim()).ok())
        .ok_or(ApiError::Auth)?;
    if !state.sessions.validate(token).await {
        return Err(ApiError::Auth);
    }
    Ok(token)
}

#[derive(Debug, Deserialize, Default)]
struct AccountsQuery {
    term: Option<String>,
    sort: Option<AccountSortKey>,
}

async fn admin_accounts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AccountsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    require_session(&state, &headers).await?;

    let mut manager = AccountManager::load(state.accounts.as_ref()).await?;
    if let Some(sort) = query.sort {
        manager.sort(sort);
    }
    let accounts = match &query.term {
        Some(term) => manager.search(term),
        None => manager.accounts().to_vec(),
    };
    Ok(Json(json!({ "accounts": accounts })))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: Option<String>,
}

async fn admin_account_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    require_session(&state, &headers).await?;
    let status = request
        .status
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("status가 필요합니다.".into()))?;

    let updated = state.accounts.set_status(id, &status).await?;
    Ok(Json(json!({ "account": updated })))
}

async fn admin_account_delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<JsonValue>, ApiError> {
    require_session(&state, &headers).await?;
    state.accounts.delete(id).await?;
    info!(%id, "account deleted");
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Sitemap
// ---------------------------------------------------------------------------

async fn sitemap_handler(State(state): State<Arc<AppState>>) -> Response {
    let xml = state.sitemap.build().await;
    (
        [
            (header::CONTENT_TYPE, "application/xml; charset=utf-8"),
            (
                header::CACHE_CONTROL,
                "public, max-age=3600, s-maxage=86400",
            ),
        ],
        xml,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Email relays
// ---------------------------------------------------------------------------

#[derive(Template)]
#[template(path = "notification_email.html")]
struct NotificationEmailTemplate {
    title: String,
    message: String,
}

#[derive(Template)]
#[template(path = "password_reset_email.html")]
struct PasswordResetEmailTemplate {
    reset_link: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationRequest {
    user_id: Option<String>,
    user_email: Option<String>,
    title: Option<String>,
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<JsonValue>,
}

async fn notification_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let user_id = request
        .user_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("userId가 필요합니다.".into()))?;
    let title = request
        .title
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("title이 필요합니다.".into()))?;
    let message = request
        .message
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("message가 필요합니다.".into()))?;
    let kind = request.kind.unwrap_or_else(|| "system".to_string());

    info!(
        user_id,
        kind,
        has_data = request.data.is_some(),
        "notification accepted"
    );

    // No address means the user has no deliverable email; the notification
    // is still accepted.
    if let Some(email) = request.user_email.filter(|v| !v.trim().is_empty()) {
        let html = NotificationEmailTemplate {
            title: title.clone(),
            message,
        }
        .render()
        .map_err(|err| {
            error!(error = %err, "notification template failed");
            ApiError::Upstream
        })?;
        state
            .mailer
            .send(&EmailMessage {
                to: email,
                subject: format!("[Therabook] {title}"),
                html,
            })
            .await?;
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct PasswordResetRequest {
    email: Option<String>,
}

async fn password_reset_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let email = request
        .email
        .filter(|v| v.contains('@'))
        .ok_or_else(|| ApiError::Validation("올바른 이메일을 입력해주세요.".into()))?;

    // Unknown addresses get the same success body; no account-existence
    // oracle.
    if let Some(token) = state.recovery.create_reset_token(&email).await? {
        let reset_link = format!("{}/auth/reset?token={}", state.base_url, token);
        let html = PasswordResetEmailTemplate { reset_link }
            .render()
            .map_err(|err| {
                error!(error = %err, "password reset template failed");
                ApiError::Upstream
            })?;
        state
            .mailer
            .send(&EmailMessage {
                to: email,
                subject: "[Therabook] 비밀번호 재설정 안내".to_string(),
                html,
            })
            .await?;
    }

    Ok(Json(json!({ "message": MSG_RESET_SENT })))
}
