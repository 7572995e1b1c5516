//! Glue components between the Therabook web surface and the managed
//! backend: filtered search, profile option loading, page-view tracking,
//! admin account management, admin sessions, and sitemap assembly.
//!
//! Every backend touchpoint sits behind an `async_trait` seam with a
//! Postgres implementation next to it, so each component is exercised in
//! tests without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use therabook_backend::{BackendError, Config};
use therabook_core::{Account, ProfileOption, SitemapUrl, TherapistRecord, TherapistTraits};

pub const CRATE_NAME: &str = "therabook-gateway";

// ---------------------------------------------------------------------------
// Search Gateway
// ---------------------------------------------------------------------------

pub const DEFAULT_SEARCH_LIMIT: i64 = 20;

/// Filter facets forwarded verbatim to the search procedure. Every facet is
/// optional; empty vectors mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TherapistFilters {
    pub location: Option<String>,
    pub mbti_type: Option<String>,
    pub age_range: Option<String>,
    pub height_range: Option<String>,
    #[serde(default)]
    pub service_styles: Vec<String>,
    pub facial_features: Option<String>,
    #[serde(default)]
    pub body_types: Vec<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub search_term: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Raw row shape returned by `search_therapists_with_filters`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TherapistRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub detailed_area: Option<String>,
    pub price: Option<i64>,
    pub mbti_type: Option<String>,
    pub age: Option<i32>,
    pub height: Option<i32>,
    pub service_style: Option<String>,
    pub facial_features: Option<String>,
    pub body_type: Option<String>,
    pub personality_traits: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
}

/// Search page plus pagination total. A stale or absent total is acceptable;
/// an empty page on procedure failure is surfaced through `error`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub data: Vec<TherapistRecord>,
    pub count: i64,
    pub error: Option<String>,
}

#[async_trait]
pub trait TherapistSearchRpc: Send + Sync {
    async fn search(&self, filters: &TherapistFilters) -> Result<Vec<TherapistRow>, BackendError>;
    async fn active_count(&self) -> Result<i64, BackendError>;
}

pub struct PgTherapistSearch {
    pool: PgPool,
}

impl PgTherapistSearch {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TherapistSearchRpc for PgTherapistSearch {
    async fn search(&self, filters: &TherapistFilters) -> Result<Vec<TherapistRow>, BackendError> {
        sqlx::query_as::<_, TherapistRow>(
            r#"
            SELECT id, name, description, location, detailed_area, price,
                   mbti_type, age, height, service_style, facial_features,
                   body_type, personality_traits, image_url, rating, review_count
              FROM search_therapists_with_filters(
                       $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&filters.location)
        .bind(&filters.mbti_type)
        .bind(&filters.age_range)
        .bind(&filters.height_range)
        .bind(&filters.service_styles)
        .bind(&filters.facial_features)
        .bind(&filters.body_types)
        .bind(&filters.personality_traits)
        .bind(filters.min_price)
        .bind(filters.max_price)
        .bind(&filters.search_term)
        .bind(filters.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .bind(filters.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| BackendError::rpc("search_therapists_with_filters", err))
    }

    async fn active_count(&self) -> Result<i64, BackendError> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM therapists WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

pub struct SearchGateway {
    rpc: Arc<dyn TherapistSearchRpc>,
}

impl SearchGateway {
    pub fn new(rpc: Arc<dyn TherapistSearchRpc>) -> Self {
        Self { rpc }
    }

    /// One procedure call for the page, one independent count for the
    /// pagination total. A count failure is logged and tolerated; a
    /// procedure failure empties the page and surfaces the message.
    pub async fn search(&self, filters: &TherapistFilters) -> SearchOutcome {
        let rows = match self.rpc.search(filters).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "therapist search procedure failed");
                return SearchOutcome {
                    data: Vec::new(),
                    count: 0,
                    error: Some(err.to_string()),
                };
            }
        };

        let count = match self.rpc.active_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "active therapist count failed; returning page without total");
                0
            }
        };

        SearchOutcome {
            data: rows.into_iter().map(flatten_row).collect(),
            count,
            error: None,
        }
    }
}

fn flatten_row(row: TherapistRow) -> TherapistRecord {
    TherapistRecord {
        id: row.id,
        name: row.name,
        description: row.description,
        location: row.location,
        detailed_area: row.detailed_area,
        price: row.price.unwrap_or(0),
        rating: row.rating.unwrap_or(0.0),
        review_count: row.review_count.unwrap_or(0),
        image_url: row.image_url,
        traits: TherapistTraits {
            mbti_type: row.mbti_type,
            age: row.age,
            height: row.height,
            service_style: row.service_style,
            facial_features: row.facial_features,
            body_type: row.body_type,
            personality_traits: row.personality_traits.unwrap_or_default(),
        },
    }
}

// ---------------------------------------------------------------------------
// Profile Option Loader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileOptionBundle {
    pub mbti_types: Vec<ProfileOption>,
    pub age_ranges: Vec<ProfileOption>,
    pub height_ranges: Vec<ProfileOption>,
    pub service_styles: Vec<ProfileOption>,
    pub facial_features: Vec<ProfileOption>,
    pub body_types: Vec<ProfileOption>,
    pub personality_traits: Vec<ProfileOption>,
}

fn plain_options(values: &[&str]) -> Vec<ProfileOption> {
    values.iter().map(|v| ProfileOption::new(*v, *v)).collect()
}

impl Default for ProfileOptionBundle {
    /// Built-in lists shown whenever the dynamic source is unavailable.
    fn default() -> Self {
        Self {
            mbti_types: plain_options(&[
                "INTJ", "INTP", "ENTJ", "ENTP", "INFJ", "INFP", "ENFJ", "ENFP", "ISTJ", "ISFJ",
                "ESTJ", "ESFJ", "ISTP", "ISFP", "ESTP", "ESFP",
            ]),
            age_ranges: plain_options(&["20대 초반", "20대 후반", "30대 초반", "30대 후반"]),
            height_ranges: plain_options(&["150-159", "160-169", "170-179", "180 이상"]),
            service_styles: plain_options(&["스웨디시", "아로마", "딥티슈", "타이"]),
            facial_features: plain_options(&["청순형", "섹시형", "귀여운형", "도도한형"]),
            body_types: plain_options(&["슬림", "보통", "글래머", "근육형"]),
            personality_traits: plain_options(&["친절함", "활발함", "차분함", "유머러스함"]),
        }
    }
}

/// Loader output mirroring the client-side hook state.
#[derive(Debug, Clone, Serialize)]
pub struct OptionLoadResult {
    pub options: ProfileOptionBundle,
    pub is_loading: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait ProfileOptionRpc: Send + Sync {
    async fn fetch_options(&self) -> Result<JsonValue, BackendError>;
}

pub struct PgProfileOptions {
    pool: PgPool,
}

impl PgProfileOptions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileOptionRpc for PgProfileOptions {
    async fn fetch_options(&self) -> Result<JsonValue, BackendError> {
        let value: JsonValue = sqlx::query_scalar("SELECT get_therapist_profile_options()")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| BackendError::rpc("get_therapist_profile_options", err))?;
        Ok(value)
    }
}

pub struct ProfileOptionLoader {
    rpc: Arc<dyn ProfileOptionRpc>,
}

impl ProfileOptionLoader {
    pub fn new(rpc: Arc<dyn ProfileOptionRpc>) -> Self {
        Self { rpc }
    }

    /// Fetches the option bundle in one call. Fallback is per-field: a
    /// missing or malformed list defaults alone, and a whole-call failure
    /// defaults every field while surfacing the message.
    pub async fn load(&self) -> OptionLoadResult {
        match self.rpc.fetch_options().await {
            Ok(value) => OptionLoadResult {
                options: bundle_from_response(&value),
                is_loading: false,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "profile option procedure failed; serving built-in lists");
                OptionLoadResult {
                    options: ProfileOptionBundle::default(),
                    is_loading: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

fn bundle_from_response(value: &JsonValue) -> ProfileOptionBundle {
    let defaults = ProfileOptionBundle::default();
    ProfileOptionBundle {
        mbti_types: list_or_default(value, "mbti_types", defaults.mbti_types),
        age_ranges: list_or_default(value, "age_ranges", defaults.age_ranges),
        height_ranges: list_or_default(value, "height_ranges", defaults.height_ranges),
        service_styles: list_or_default(value, "service_styles", defaults.service_styles),
        facial_features: list_or_default(value, "facial_features", defaults.facial_features),
        body_types: list_or_default(value, "body_types", defaults.body_types),
        personality_traits: list_or_default(value, "personality_traits", defaults.personality_traits),
    }
}

fn list_or_default(
    value: &JsonValue,
    key: &str,
    default: Vec<ProfileOption>,
) -> Vec<ProfileOption> {
    let parsed = value
        .get(key)
        .and_then(|list| serde_json::from_value::<Vec<ProfileOption>>(list.clone()).ok())
        .filter(|list| !list.is_empty());
    match parsed {
        Some(list) => list,
        None => {
            warn!(field = key, "option list missing from response; using built-in default");
            default
        }
    }
}

// ---------------------------------------------------------------------------
// Page-View Tracker
// ---------------------------------------------------------------------------

pub const DEDUP_WINDOW_MINUTES: i64 = 30;

/// Consistency class of one write strategy in a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Atomic,
    /// Read-modify-write; concurrent writers can lose updates.
    LostUpdatePossible,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteStrategy {
    pub name: &'static str,
    pub consistency: Consistency,
}

/// Ordered strategies for recording a page view: the RPC first, then the
/// direct table insert.
pub const PAGE_VIEW_STRATEGIES: [WriteStrategy; 2] = [
    WriteStrategy {
        name: "log_page_view_text",
        consistency: Consistency::Atomic,
    },
    WriteStrategy {
        name: "page_views_insert",
        consistency: Consistency::Atomic,
    },
];

/// Ordered strategies for the per-post blog counter. The fallback is a
/// non-atomic read-modify-write; its lost-update window is a known bounded
/// inconsistency of the original system, kept visible rather than hidden.
pub const BLOG_VIEW_STRATEGIES: [WriteStrategy; 2] = [
    WriteStrategy {
        name: "increment_blog_view",
        consistency: Consistency::Atomic,
    },
    WriteStrategy {
        name: "blog_posts_read_modify_write",
        consistency: Consistency::LostUpdatePossible,
    },
];

#[async_trait]
pub trait ViewSink: Send + Sync {
    async fn record_page_view(
        &self,
        path: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<(), BackendError>;

    async fn record_blog_view(&self, slug: &str) -> Result<(), BackendError>;
}

pub struct PgViewSink {
    pool: PgPool,
}

impl PgViewSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn page_view_rpc(&self, path: &str, ip: &str, user_agent: &str) -> Result<(), BackendError> {
        sqlx::query("SELECT log_page_view_text($1, $2, $3)")
            .bind(path)
            .bind(ip)
            .bind(user_agent)
            .execute(&self.pool)
            .await
            .map_err(|err| BackendError::rpc("log_page_view_text", err))?;
        Ok(())
    }

    async fn page_view_insert(
        &self,
        path: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO page_views (page, ip_address, user_agent, view_date) VALUES ($1, $2, $3, now())",
        )
        .bind(path)
        .bind(ip)
        .bind(user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn blog_view_rpc(&self, slug: &str) -> Result<(), BackendError> {
        sqlx::query("SELECT increment_blog_view($1)")
            .bind(slug)
            .execute(&self.pool)
            .await
            .map_err(|err| BackendError::rpc("increment_blog_view", err))?;
        Ok(())
    }

    async fn blog_view_read_modify_write(&self, slug: &str) -> Result<(), BackendError> {
        let views: Option<i64> = sqlx::query_scalar("SELECT views FROM blog_posts WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        let Some(views) = views else {
            return Err(BackendError::NotFound);
        };
        sqlx::query("UPDATE blog_posts SET views = $2 WHERE slug = $1")
            .bind(slug)
            .bind(views + 1)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ViewSink for PgViewSink {
    async fn record_page_view(
        &self,
        path: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<(), BackendError> {
        let mut last_error = None;
        for (attempt, strategy) in PAGE_VIEW_STRATEGIES.iter().enumerate() {
            let result = match strategy.name {
                "log_page_view_text" => self.page_view_rpc(path, ip, user_agent).await,
                _ => self.page_view_insert(path, ip, user_agent).await,
            };
            match result {
                Ok(()) => {
                    if attempt > 0 {
                        warn!(path, strategy = strategy.name, "page view recorded via fallback path");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(path, strategy = strategy.name, error = %err, "page view strategy failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(BackendError::NotFound))
    }

    async fn record_blog_view(&self, slug: &str) -> Result<(), BackendError> {
        let mut last_error = None;
        for strategy in BLOG_VIEW_STRATEGIES.iter() {
            let result = match strategy.name {
                "increment_blog_view" => self.blog_view_rpc(slug).await,
                _ => self.blog_view_read_modify_write(slug).await,
            };
            match result {
                Ok(()) => {
                    if strategy.consistency == Consistency::LostUpdatePossible {
                        warn!(slug, strategy = strategy.name, "blog view counted via non-atomic fallback");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(slug, strategy = strategy.name, error = %err, "blog view strategy failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(BackendError::NotFound))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOutcome {
    Skipped,
    Recorded,
}

/// Per-navigation state machine: check the dedup store for the path, then
/// either skip or record through the sink. The store is process-local, so
/// separate processes double-count; that matches the original's per-tab
/// behavior.
pub struct PageViewTracker {
    sink: Arc<dyn ViewSink>,
    window: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PageViewTracker {
    pub fn new(sink: Arc<dyn ViewSink>) -> Self {
        Self::with_window(sink, Duration::minutes(DEDUP_WINDOW_MINUTES))
    }

    pub fn with_window(sink: Arc<dyn ViewSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn track(
        &self,
        path: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<TrackOutcome, BackendError> {
        self.track_at(Utc::now(), path, ip, user_agent).await
    }

    pub async fn track_at(
        &self,
        now: DateTime<Utc>,
        path: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<TrackOutcome, BackendError> {
        {
            let seen = self.seen.lock().await;
            if let Some(last) = seen.get(path) {
                if now.signed_duration_since(*last) < self.window {
                    return Ok(TrackOutcome::Skipped);
                }
            }
        }

        self.sink.record_page_view(path, ip, user_agent).await?;
        if let Some(slug) = blog_slug(path) {
            self.sink.record_blog_view(slug).await?;
        }

        self.seen.lock().await.insert(path.to_string(), now);
        info!(path, "page view recorded");
        Ok(TrackOutcome::Recorded)
    }
}

/// Extracts the slug from `/blog/{slug}` paths; index and nested paths do
/// not carry a per-post counter.
fn blog_slug(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/blog/")?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

// ---------------------------------------------------------------------------
// Admin Account Manager
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Account>, BackendError>;
    async fn set_status(&self, id: Uuid, status: &str) -> Result<Account, BackendError>;
    async fn delete(&self, id: Uuid) -> Result<(), BackendError>;
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    name: String,
    email: String,
    account_type: String,
    created_at: DateTime<Utc>,
    status: String,
}

impl ProfileRow {
    fn into_account(self) -> Account {
        Account::from_row_parts(
            self.id,
            self.name,
            self.email,
            self.account_type,
            self.created_at,
            self.status,
        )
    }
}

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn load_all(&self) -> Result<Vec<Account>, BackendError> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT id, name, email, account_type, created_at, status
              FROM profiles
             ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProfileRow::into_account).collect())
    }

    async fn set_status(&self, id: Uuid, status: &str) -> Result<Account, BackendError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            UPDATE profiles
               SET status = $2
             WHERE id = $1
            RETURNING id, name, email, account_type, created_at, status
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProfileRow::into_account).ok_or(BackendError::NotFound)
    }

    async fn delete(&self, id: Uuid) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM profiles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSortKey {
    Newest,
    Oldest,
    Name,
    Status,
}

/// In-memory admin view over all profile rows. Mutations write through the
/// store and patch the local list only on the success variant; a failed
/// write leaves the view untouched.
pub struct AccountManager {
    accounts: Vec<Account>,
}

impl AccountManager {
    pub async fn load(store: &dyn AccountStore) -> Result<Self, BackendError> {
        let accounts = store.load_all().await?;
        Ok(Self { accounts })
    }

    #[cfg(test)]
    fn from_accounts(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Case-insensitive substring match over name, id, and email. A blank
    /// term keeps the full list; a non-matching term yields an empty list.
    pub fn search(&self, term: &str) -> Vec<Account> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return self.accounts.clone();
        }
        self.accounts
            .iter()
            .filter(|account| {
                account.name.to_lowercase().contains(&needle)
                    || account.id.to_string().to_lowercase().contains(&needle)
                    || account.email.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn sort(&mut self, key: AccountSortKey) {
        match key {
            AccountSortKey::Newest => self
                .accounts
                .sort_by(|a, b| b.registered_at.cmp(&a.registered_at)),
            AccountSortKey::Oldest => self
                .accounts
                .sort_by(|a, b| a.registered_at.cmp(&b.registered_at)),
            AccountSortKey::Name => self.accounts.sort_by(|a, b| a.name.cmp(&b.name)),
            AccountSortKey::Status => self.accounts.sort_by(|a, b| a.status.cmp(&b.status)),
        }
    }

    pub async fn set_status(
        &mut self,
        store: &dyn AccountStore,
        id: Uuid,
        status: &str,
    ) -> Result<Account, BackendError> {
        let updated = store.set_status(id, status).await?;
        if let Some(existing) = self.accounts.iter_mut().find(|a| a.id == id) {
            *existing = updated.clone();
        }
        Ok(updated)
    }

    pub async fn delete(&mut self, store: &dyn AccountStore, id: Uuid) -> Result<(), BackendError> {
        store.delete(id).await?;
        self.accounts.retain(|a| a.id != id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Admin sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("admin login is disabled")]
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub token: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Explicit session lifecycle for the admin surface: credentials come from
/// configuration, tokens live server-side with a TTL. Replaces the ambient
/// credential checks the original scattered across call sites.
pub struct SessionManager {
    username: String,
    password: String,
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, SessionContext>>,
}

impl SessionManager {
    pub fn from_config(config: &Config) -> Self {
        Self {
            username: config.admin_username.clone(),
            password: config.admin_password.clone(),
            ttl: Duration::minutes(config.session_ttl_minutes),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SessionContext, SessionError> {
        if self.password.is_empty() {
            return Err(SessionError::Disabled);
        }
        if username != self.username || password != self.password {
            return Err(SessionError::InvalidCredentials);
        }
        let created_at = Utc::now();
        let context = SessionContext {
            token: Uuid::new_v4(),
            username: username.to_string(),
            created_at,
            expires_at: created_at + self.ttl,
        };
        self.sessions.lock().await.insert(context.token, context.clone());
        info!(username, "admin session created");
        Ok(context)
    }

    pub async fn validate(&self, token: Uuid) -> bool {
        self.validate_at(token, Utc::now()).await
    }

    pub async fn validate_at(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&token) {
            Some(context) if context.expires_at > now => true,
            Some(_) => {
                sessions.remove(&token);
                false
            }
            None => false,
        }
    }

    pub async fn destroy(&self, token: Uuid) {
        if self.sessions.lock().await.remove(&token).is_some() {
            info!(%token, "admin session destroyed");
        }
    }
}

// ---------------------------------------------------------------------------
// Sitemap Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlogPostEntry {
    pub slug: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SitemapSource: Send + Sync {
    async fn published_blog_posts(&self) -> Result<Vec<BlogPostEntry>, BackendError>;
    async fn therapist_ids(&self) -> Result<Vec<Uuid>, BackendError>;
}

pub struct PgSitemapSource {
    pool: PgPool,
}

impl PgSitemapSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SitemapSource for PgSitemapSource {
    async fn published_blog_posts(&self) -> Result<Vec<BlogPostEntry>, BackendError> {
        let rows = sqlx::query_as::<_, BlogPostEntry>(
            "SELECT slug, published_at FROM blog_posts WHERE published = true",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn therapist_ids(&self) -> Result<Vec<Uuid>, BackendError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM therapists")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

/// Fixed URL set emitted regardless of backend availability.
pub fn static_urls(base_url: &str) -> Vec<SitemapUrl> {
    vec![
        SitemapUrl::new(base_url.to_string(), "daily", "1.0"),
        SitemapUrl::new(format!("{base_url}/therapists"), "daily", "0.9"),
        SitemapUrl::new(format!("{base_url}/booking"), "weekly", "0.8"),
        SitemapUrl::new(format!("{base_url}/blog"), "daily", "0.8"),
        SitemapUrl::new(format!("{base_url}/about"), "monthly", "0.5"),
        SitemapUrl::new(format!("{base_url}/login"), "monthly", "0.3"),
        SitemapUrl::new(format!("{base_url}/signup"), "monthly", "0.3"),
    ]
}

pub struct SitemapBuilder {
    source: Arc<dyn SitemapSource>,
    base_url: String,
}

impl SitemapBuilder {
    pub fn new(source: Arc<dyn SitemapSource>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            source,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Concatenates static, blog, and therapist URLs, then serializes. A
    /// failing dynamic source is logged and omitted; the static list always
    /// ships.
    pub async fn build(&self) -> String {
        let mut urls = static_urls(&self.base_url);

        match self.source.published_blog_posts().await {
            Ok(posts) => {
                for post in posts {
                    let mut url = SitemapUrl::new(
                        format!("{}/blog/{}", self.base_url, post.slug),
                        "weekly",
                        "0.7",
                    );
                    if let Some(published_at) = post.published_at {
                        url = url.with_lastmod(published_at.format("%Y-%m-%d").to_string());
                    }
                    urls.push(url);
                }
            }
            Err(err) => warn!(error = %err, "blog post fetch failed; omitting blog URLs"),
        }

        match self.source.therapist_ids().await {
            Ok(ids) => {
                for id in ids {
                    urls.push(SitemapUrl::new(
                        format!("{}/therapists/{}", self.base_url, id),
                        "weekly",
                        "0.6",
                    ));
                }
            }
            Err(err) => warn!(error = %err, "therapist id fetch failed; omitting profile URLs"),
        }

        render_sitemap_xml(&urls)
    }
}

pub fn render_sitemap_xml(urls: &[SitemapUrl]) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    for url in urls {
        out.push_str("  <url>\n");
        out.push_str(&format!("    <loc>{}</loc>\n", xml_escape(&url.loc)));
        if let Some(lastmod) = &url.lastmod {
            out.push_str(&format!("    <lastmod>{}</lastmod>\n", xml_escape(lastmod)));
        }
        out.push_str(&format!("    <changefreq>{}</changefreq>\n", url.changefreq));
        out.push_str(&format!("    <priority>{}</priority>\n", url.priority));
        out.push_str("  </url>\n");
    }
    out.push_str("</urlset>\n");
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend_down() -> BackendError {
        BackendError::rpc("search_therapists_with_filters", sqlx::Error::PoolClosed)
    }

    // -- search gateway ----------------------------------------------------

    struct StubSearch {
        rows: Result<Vec<TherapistRow>, ()>,
        count: Result<i64, ()>,
    }

    #[async_trait]
    impl TherapistSearchRpc for StubSearch {
        async fn search(
            &self,
            _filters: &TherapistFilters,
        ) -> Result<Vec<TherapistRow>, BackendError> {
            match &self.rows {
                Ok(rows) => Ok(rows.clone()),
                Err(()) => Err(backend_down()),
            }
        }

        async fn active_count(&self) -> Result<i64, BackendError> {
            match self.count {
                Ok(count) => Ok(count),
                Err(()) => Err(BackendError::Query(sqlx::Error::PoolClosed)),
            }
        }
    }

    fn sample_row(name: &str) -> TherapistRow {
        TherapistRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: Some("경력 5년".into()),
            location: Some("강남".into()),
            detailed_area: Some("역삼동".into()),
            price: Some(90000),
            mbti_type: Some("ENFP".into()),
            age: Some(27),
            height: Some(165),
            service_style: Some("스웨디시".into()),
            facial_features: Some("청순형".into()),
            body_type: Some("슬림".into()),
            personality_traits: Some(vec!["친절함".into(), "활발함".into()]),
            image_url: None,
            rating: Some(4.8),
            review_count: Some(12),
        }
    }

    #[tokio::test]
    async fn procedure_error_yields_empty_page_with_message() {
        let gateway = SearchGateway::new(Arc::new(StubSearch {
            rows: Err(()),
            count: Ok(42),
        }));
        let outcome = gateway.search(&TherapistFilters::default()).await;
        assert!(outcome.data.is_empty());
        assert_eq!(outcome.count, 0);
        assert!(outcome.error.as_deref().unwrap().contains("search_therapists_with_filters"));
    }

    #[tokio::test]
    async fn count_failure_does_not_block_page_data() {
        let gateway = SearchGateway::new(Arc::new(StubSearch {
            rows: Ok(vec![sample_row("수아"), sample_row("지유")]),
            count: Err(()),
        }));
        let outcome = gateway.search(&TherapistFilters::default()).await;
        assert_eq!(outcome.data.len(), 2);
        assert_eq!(outcome.count, 0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn rows_flatten_into_client_records() {
        let gateway = SearchGateway::new(Arc::new(StubSearch {
            rows: Ok(vec![sample_row("수아")]),
            count: Ok(1),
        }));
        let outcome = gateway.search(&TherapistFilters::default()).await;
        let record = &outcome.data[0];
        assert_eq!(record.price, 90000);
        assert_eq!(record.traits.personality_traits.len(), 2);
        assert_eq!(record.traits.mbti_type.as_deref(), Some("ENFP"));
        assert_eq!(outcome.count, 1);
    }

    // -- profile option loader ---------------------------------------------

    struct StubOptions {
        response: Result<JsonValue, ()>,
    }

    #[async_trait]
    impl ProfileOptionRpc for StubOptions {
        async fn fetch_options(&self) -> Result<JsonValue, BackendError> {
            match &self.response {
                Ok(value) => Ok(value.clone()),
                Err(()) => Err(BackendError::rpc(
                    "get_therapist_profile_options",
                    sqlx::Error::PoolClosed,
                )),
            }
        }
    }

    #[tokio::test]
    async fn whole_call_failure_defaults_every_field() {
        let loader = ProfileOptionLoader::new(Arc::new(StubOptions { response: Err(()) }));
        let result = loader.load().await;
        assert_eq!(result.options, ProfileOptionBundle::default());
        assert!(!result.is_loading);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn missing_fields_default_individually() {
        let response = serde_json::json!({
            "mbti_types": [{"value": "ENFP", "label": "ENFP - 재기발랄"}],
            "body_types": [],
        });
        let loader = ProfileOptionLoader::new(Arc::new(StubOptions {
            response: Ok(response),
        }));
        let result = loader.load().await;
        assert_eq!(result.options.mbti_types.len(), 1);
        assert_eq!(result.options.mbti_types[0].label, "ENFP - 재기발랄");
        // empty and absent lists both fall back
        assert_eq!(result.options.body_types, ProfileOptionBundle::default().body_types);
        assert_eq!(result.options.age_ranges, ProfileOptionBundle::default().age_ranges);
        assert!(result.error.is_none());
    }

    // -- page-view tracker -------------------------------------------------

    #[derive(Default)]
    struct CountingSink {
        page_views: AtomicUsize,
        blog_views: AtomicUsize,
    }

    #[async_trait]
    impl ViewSink for CountingSink {
        async fn record_page_view(
            &self,
            _path: &str,
            _ip: &str,
            _user_agent: &str,
        ) -> Result<(), BackendError> {
            self.page_views.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn record_blog_view(&self, _slug: &str) -> Result<(), BackendError> {
            self.blog_views.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_view_within_window_is_skipped() {
        let sink = Arc::new(CountingSink::default());
        let tracker = PageViewTracker::new(sink.clone());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        let first = tracker.track_at(t0, "/therapists", "10.0.0.1", "ua").await.unwrap();
        let second = tracker
            .track_at(t0 + Duration::minutes(10), "/therapists", "10.0.0.1", "ua")
            .await
            .unwrap();

        assert_eq!(first, TrackOutcome::Recorded);
        assert_eq!(second, TrackOutcome::Skipped);
        assert_eq!(sink.page_views.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn view_beyond_window_records_again() {
        let sink = Arc::new(CountingSink::default());
        let tracker = PageViewTracker::new(sink.clone());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        tracker.track_at(t0, "/therapists", "10.0.0.1", "ua").await.unwrap();
        let later = tracker
            .track_at(t0 + Duration::minutes(31), "/therapists", "10.0.0.1", "ua")
            .await
            .unwrap();

        assert_eq!(later, TrackOutcome::Recorded);
        assert_eq!(sink.page_views.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blog_paths_also_bump_the_post_counter() {
        let sink = Arc::new(CountingSink::default());
        let tracker = PageViewTracker::new(sink.clone());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();

        tracker.track_at(t0, "/blog/first-visit-guide", "10.0.0.1", "ua").await.unwrap();
        tracker.track_at(t0, "/blog", "10.0.0.1", "ua").await.unwrap();

        assert_eq!(sink.page_views.load(Ordering::SeqCst), 2);
        assert_eq!(sink.blog_views.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blog_slug_extraction() {
        assert_eq!(blog_slug("/blog/spring-promo"), Some("spring-promo"));
        assert_eq!(blog_slug("/blog/spring-promo/"), Some("spring-promo"));
        assert_eq!(blog_slug("/blog"), None);
        assert_eq!(blog_slug("/blog/"), None);
        assert_eq!(blog_slug("/blog/a/b"), None);
        assert_eq!(blog_slug("/therapists"), None);
    }

    #[test]
    fn fallback_chains_name_their_consistency() {
        assert_eq!(PAGE_VIEW_STRATEGIES[0].consistency, Consistency::Atomic);
        assert_eq!(
            BLOG_VIEW_STRATEGIES[1].consistency,
            Consistency::LostUpdatePossible
        );
    }

    // -- admin account manager ---------------------------------------------

    fn account(name: &str, email: &str, status: &str, day: u32) -> Account {
        Account::from_row_parts(
            Uuid::new_v4(),
            name.into(),
            email.into(),
            "user".into(),
            Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).single().unwrap(),
            status.into(),
        )
    }

    struct FailingStore;

    #[async_trait]
    impl AccountStore for FailingStore {
        async fn load_all(&self) -> Result<Vec<Account>, BackendError> {
            Err(BackendError::Query(sqlx::Error::PoolClosed))
        }

        async fn set_status(&self, _id: Uuid, _status: &str) -> Result<Account, BackendError> {
            Err(BackendError::Query(sqlx::Error::PoolClosed))
        }

        async fn delete(&self, _id: Uuid) -> Result<(), BackendError> {
            Err(BackendError::Query(sqlx::Error::PoolClosed))
        }
    }

    struct EchoStore;

    #[async_trait]
    impl AccountStore for EchoStore {
        async fn load_all(&self) -> Result<Vec<Account>, BackendError> {
            Ok(vec![])
        }

        async fn set_status(&self, id: Uuid, status: &str) -> Result<Account, BackendError> {
            Ok(Account::from_row_parts(
                id,
                "Park Jiyu".into(),
                "jiyu@example.com".into(),
                "therapist".into(),
                Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().unwrap(),
                status.into(),
            ))
        }

        async fn delete(&self, _id: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn search_matches_name_id_and_email_case_insensitively() {
        let accounts = vec![
            account("Kim Minji", "minji@example.com", "active", 3),
            account("Park Jiyu", "jiyu@test.kr", "suspended", 5),
        ];
        let id_fragment = accounts[1].id.to_string()[..8].to_string();
        let manager = AccountManager::from_accounts(accounts);

        assert_eq!(manager.search("MINJI").len(), 1);
        assert_eq!(manager.search("test.kr").len(), 1);
        assert_eq!(manager.search(&id_fragment).len(), 1);
        assert!(manager.search("nobody-here").is_empty());
        assert_eq!(manager.search("  ").len(), 2);
    }

    #[test]
    fn sort_orders_by_each_key() {
        let mut manager = AccountManager::from_accounts(vec![
            account("b", "b@example.com", "suspended", 1),
            account("a", "a@example.com", "active", 9),
        ]);

        manager.sort(AccountSortKey::Newest);
        assert_eq!(manager.accounts()[0].name, "a");
        manager.sort(AccountSortKey::Oldest);
        assert_eq!(manager.accounts()[0].name, "b");
        manager.sort(AccountSortKey::Name);
        assert_eq!(manager.accounts()[0].name, "a");
        manager.sort(AccountSortKey::Status);
        assert_eq!(manager.accounts()[0].status, "active");
    }

    #[tokio::test]
    async fn failed_mutation_leaves_local_state_untouched() {
        let original = account("Kim Minji", "minji@example.com", "active", 3);
        let id = original.id;
        let mut manager = AccountManager::from_accounts(vec![original]);

        let result = manager.set_status(&FailingStore, id, "suspended").await;
        assert!(result.is_err());
        assert_eq!(manager.accounts()[0].status, "active");

        let result = manager.delete(&FailingStore, id).await;
        assert!(result.is_err());
        assert_eq!(manager.accounts().len(), 1);
    }

    #[tokio::test]
    async fn successful_mutation_patches_local_state() {
        let original = account("Kim Minji", "minji@example.com", "active", 3);
        let id = original.id;
        let mut manager = AccountManager::from_accounts(vec![original]);

        manager.set_status(&EchoStore, id, "suspended").await.unwrap();
        assert_eq!(manager.accounts()[0].status, "suspended");

        manager.delete(&EchoStore, id).await.unwrap();
        assert!(manager.accounts().is_empty());
    }

    // -- sessions ----------------------------------------------------------

    fn session_manager(password: &str) -> SessionManager {
        let mut config = Config::from_env();
        config.admin_username = "admin".into();
        config.admin_password = password.into();
        config.session_ttl_minutes = 60;
        SessionManager::from_config(&config)
    }

    #[tokio::test]
    async fn session_lifecycle_create_validate_destroy() {
        let manager = session_manager("correct horse");
        let context = manager.create("admin", "correct horse").await.unwrap();
        assert!(manager.validate(context.token).await);

        manager.destroy(context.token).await;
        assert!(!manager.validate(context.token).await);
    }

    #[tokio::test]
    async fn wrong_credentials_and_disabled_login_are_rejected() {
        let manager = session_manager("correct horse");
        assert_eq!(
            manager.create("admin", "wrong").await.unwrap_err(),
            SessionError::InvalidCredentials
        );

        let disabled = session_manager("");
        assert_eq!(
            disabled.create("admin", "anything").await.unwrap_err(),
            SessionError::Disabled
        );
    }

    #[tokio::test]
    async fn expired_session_fails_validation() {
        let manager = session_manager("correct horse");
        let context = manager.create("admin", "correct horse").await.unwrap();
        let later = context.expires_at + Duration::minutes(1);
        assert!(!manager.validate_at(context.token, later).await);
    }

    // -- sitemap -----------------------------------------------------------

    struct StubSitemapSource {
        posts: Result<Vec<BlogPostEntry>, ()>,
        ids: Result<Vec<Uuid>, ()>,
    }

    #[async_trait]
    impl SitemapSource for StubSitemapSource {
        async fn published_blog_posts(&self) -> Result<Vec<BlogPostEntry>, BackendError> {
            match &self.posts {
                Ok(posts) => Ok(posts.clone()),
                Err(()) => Err(BackendError::Query(sqlx::Error::PoolClosed)),
            }
        }

        async fn therapist_ids(&self) -> Result<Vec<Uuid>, BackendError> {
            match &self.ids {
                Ok(ids) => Ok(ids.clone()),
                Err(()) => Err(BackendError::Query(sqlx::Error::PoolClosed)),
            }
        }
    }

    #[tokio::test]
    async fn static_urls_survive_total_dynamic_failure() {
        let builder = SitemapBuilder::new(
            Arc::new(StubSitemapSource {
                posts: Err(()),
                ids: Err(()),
            }),
            "https://therabook.app",
        );
        let xml = builder.build().await;
        assert!(xml.contains("<loc>https://therabook.app</loc>"));
        assert!(xml.contains("<loc>https://therabook.app/therapists</loc>"));
        assert!(xml.contains("<loc>https://therabook.app/blog</loc>"));
        assert!(!xml.contains("/blog/"));
    }

    #[tokio::test]
    async fn published_posts_get_weekly_point_seven_entries() {
        let id = Uuid::new_v4();
        let builder = SitemapBuilder::new(
            Arc::new(StubSitemapSource {
                posts: Ok(vec![BlogPostEntry {
                    slug: "first-visit-guide".into(),
                    published_at: Some(
                        Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).single().unwrap(),
                    ),
                }]),
                ids: Ok(vec![id]),
            }),
            "https://therabook.app/",
        );
        let xml = builder.build().await;
        let post_entry = xml
            .split("<url>")
            .find(|chunk| chunk.contains("/blog/first-visit-guide"))
            .expect("blog entry present");
        assert!(post_entry.contains("<changefreq>weekly</changefreq>"));
        assert!(post_entry.contains("<priority>0.7</priority>"));
        assert!(post_entry.contains("<lastmod>2026-02-10</lastmod>"));
        assert!(xml.contains(&format!("/therapists/{id}")));
    }

    #[test]
    fn xml_output_escapes_reserved_characters() {
        let urls = vec![SitemapUrl::new(
            "https://therabook.app/search?a=1&b=2",
            "daily",
            "0.5",
        )];
        let xml = render_sitemap_xml(&urls);
        assert!(xml.contains("a=1&amp;b=2"));
    }
}
