//!
//! pitchdesk HTTP/WS server
//! ------------------------
//! This module defines the Axum-based JSON API and WebSocket change feed for
//! pitchdesk.
//!
//! Responsibilities:
//! - Session management with a simple cookie + CSRF token model.
//! - Signup/login/logout/reset endpoints backed by the auth core.
//! - Admin user listing, approval and removal.
//! - CRUD endpoints for clients, the service catalog and proposals.
//! - Dashboard metrics endpoint.
//! - WebSocket endpoint broadcasting auth and table change events.
//! - First-run demo catalog creation and optional seed-admin provisioning.

use std::{net::SocketAddr, collections::HashMap, sync::Arc};

use axum::{routing::{get, post, put, delete}, Router, extract::{State, ws::{WebSocketUpgrade, Message}, Path}, Json};
use axum::response::IntoResponse;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Serialize, Deserialize};
use serde_json::json;
use tracing::{info, error};
use tokio::sync::{broadcast, RwLock};
use getrandom::getrandom;
use anyhow::Context;
use uuid::Uuid;

use crate::catalog::{NewService, ServiceStore, seed_demo_catalog};
use crate::directory::{ClientStore, NewClient};
use crate::error::AppError;
use crate::identity::{AuthService, AuthUser, HttpIdentityProvider, IdentityProvider,
                      LocalIdentityProvider, RemoteIdentityConfig, RoleCheck, SessionManager, SignUpOutcome};
use crate::profiles::{ParquetProfileRepository, ProfileChanges, ProfileRepository};
use crate::proposals::{compute_totals, dashboard_metrics, Proposal, ProposalStatus, ProposalStore};
use crate::storage::SharedStore;

const SESSION_COOKIE: &str = "pitchdesk_session";

/// One entry on the WebSocket change feed: a table mutation or an auth
/// transition, identified by table name, event kind and row/user id.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub table: String,
    pub event: String,
    pub id: String,
}

impl ChangeEvent {
    fn new(table: &str, event: &str, id: impl ToString) -> Self {
        Self { table: table.to_string(), event: event.to_string(), id: id.to_string() }
    }
}

/// Shared server state injected into all handlers.
///
/// Holds the table stores, the auth service, session maps (cookie id to
/// provider token plus CSRF tokens) and the change-feed sender.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub db_root: String,
    pub auth: Arc<AuthService>,
    pub clients: ClientStore,
    pub services: ServiceStore,
    pub proposals: ProposalStore,
    /// Session id -> identity-provider session token
    pub sessions: Arc<RwLock<HashMap<String, String>>>,
    /// Session id -> CSRF token mapping
    pub csrf_tokens: Arc<RwLock<HashMap<String, String>>>,
    pub events: broadcast::Sender<ChangeEvent>,
}

/// Startup configuration, read from the environment by `run()`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_root: String,
    pub session_ttl_secs: u64,
    /// When set, delegate identity to the hosted provider instead of the
    /// local credential store.
    pub remote_identity: Option<RemoteIdentityConfig>,
    /// Out-of-band admin provisioning for an empty profile table.
    pub seed_admin: Option<SeedAdmin>,
}

#[derive(Debug, Clone)]
pub struct SeedAdmin {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let http_port = std::env::var("PITCHDESK_HTTP_PORT").ok()
            .and_then(|s| s.parse::<u16>().ok()).unwrap_or(8790);
        let db_root = std::env::var("PITCHDESK_DB_FOLDER").unwrap_or_else(|_| "data".to_string());
        let session_ttl_secs = std::env::var("PITCHDESK_SESSION_TTL_SECS").ok()
            .and_then(|s| s.parse::<u64>().ok()).unwrap_or(3600);
        let remote_identity = std::env::var("PITCHDESK_IDENTITY_URL").ok().map(|base_url| RemoteIdentityConfig {
            base_url,
            anon_key: std::env::var("PITCHDESK_IDENTITY_ANON_KEY").unwrap_or_default(),
            service_key: std::env::var("PITCHDESK_IDENTITY_SERVICE_KEY").ok(),
        });
        let seed_admin = match (std::env::var("PITCHDESK_SEED_ADMIN_EMAIL"), std::env::var("PITCHDESK_SEED_ADMIN_PASSWORD")) {
            (Ok(email), Ok(password)) => Some(SeedAdmin {
                email,
                password,
                name: std::env::var("PITCHDESK_SEED_ADMIN_NAME").unwrap_or_else(|_| "Administrator".to_string()),
            }),
            _ => None,
        };
        ServerConfig { http_port, db_root, session_ttl_secs, remote_identity, seed_admin }
    }
}

fn log_startup_folders(db_root: &str) {
    let cwd = std::env::current_dir().ok();
    let exe = std::env::current_exe().ok();
    let db_env = std::env::var("PITCHDESK_DB_FOLDER").ok();
    info!(
        target: "startup",
        "pitchdesk starting. Folder configuration: cwd={:?}, exe={:?}, db_root_param={:?}, PITCHDESK_DB_FOLDER_env={:?}",
        cwd, exe, db_root, db_env
    );
    let db_exists = std::path::Path::new(db_root).exists();
    info!(target: "startup", "Path existence: db_root_exists={}", db_exists);
}

/// Build the shared state: store, table repositories, identity provider and
/// auth service. Seeding (admin + demo catalog) happens here so embedded
/// callers get the same startup behavior as `run()`.
pub async fn build_state(cfg: &ServerConfig) -> anyhow::Result<AppState> {
    std::fs::create_dir_all(&cfg.db_root)
        .with_context(|| format!("Failed to create or access data root: {}", cfg.db_root))?;
    let store = SharedStore::new(&cfg.db_root)
        .with_context(|| format!("While creating SharedStore with root: {}", cfg.db_root))?;

    let profiles: Arc<dyn ProfileRepository> = Arc::new(ParquetProfileRepository::new(store.clone()));
    let provider: Arc<dyn IdentityProvider> = match &cfg.remote_identity {
        Some(remote) => {
            info!(target: "startup", "identity provider: hosted at {}", remote.base_url);
            Arc::new(HttpIdentityProvider::new(remote.clone()))
        }
        None => {
            info!(target: "startup", "identity provider: local credential store");
            let ttl = std::time::Duration::from_secs(cfg.session_ttl_secs);
            Arc::new(LocalIdentityProvider::new(store.clone(), SessionManager::with_ttl(ttl)))
        }
    };
    let auth = Arc::new(AuthService::new(provider, profiles));

    if let Some(seed) = &cfg.seed_admin {
        match auth.ensure_seed_admin(&seed.email, &seed.password, &seed.name).await {
            Ok(true) => info!(target: "startup", "seed admin provisioned: {}", seed.email),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to provision seed admin: {}", e),
        }
    }

    let services = ServiceStore::new(store.clone());
    match seed_demo_catalog(&services) {
        Ok(0) => {}
        Ok(n) => info!(target: "startup", "Created demo catalog with {} services", n),
        Err(e) => tracing::warn!("Failed to create demo catalog: {}", e),
    }

    let (events, _) = broadcast::channel(256);
    Ok(AppState {
        store: store.clone(),
        db_root: cfg.db_root.clone(),
        auth,
        clients: ClientStore::new(store.clone()),
        services,
        proposals: ProposalStore::new(store),
        sessions: Arc::new(RwLock::new(HashMap::new())),
        csrf_tokens: Arc::new(RwLock::new(HashMap::new())),
        events,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "pitchdesk ok" }))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/reset-password", post(reset_password))
        .route("/change-password", post(change_password))
        .route("/me", get(me))
        .route("/csrf", get(get_csrf))
        .route("/admin/users", get(admin_list_users))
        .route("/admin/users/{id}/approve", post(admin_approve_user))
        .route("/admin/users/{id}", delete(admin_delete_user))
        .route("/clients", get(list_clients).post(create_client))
        .route("/clients/{id}", put(update_client).delete(delete_client))
        .route("/services", get(list_services).post(create_service))
        .route("/services/{id}", put(update_service).delete(delete_service))
        .route("/proposals", get(list_proposals).post(create_proposal))
        .route("/proposals/{id}", get(get_proposal))
        .route("/proposals/{id}/status", post(set_proposal_status))
        .route("/dashboard/metrics", get(metrics))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn run_with_config(cfg: ServerConfig) -> anyhow::Result<()> {
    log_startup_folders(&cfg.db_root);
    let state = build_state(&cfg).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Convenience entry point reading the full configuration from env vars.
pub async fn run() -> anyhow::Result<()> {
    run_with_config(ServerConfig::from_env()).await
}

#[derive(Debug, Deserialize)]
struct LoginPayload { email: String, password: String }

#[derive(Debug, Deserialize)]
struct SignupPayload { email: String, password: String, name: String }

#[derive(Debug, Deserialize)]
struct ResetPayload { email: String }

#[derive(Debug, Deserialize)]
struct ChangePasswordPayload { current_password: String, new_password: String }

#[derive(Debug, Deserialize)]
struct StatusPayload { status: String }

#[derive(Debug, Deserialize)]
struct CreateProposalPayload {
    client_id: Uuid,
    service_ids: Vec<Uuid>,
    #[serde(default)]
    discount_percent: f64,
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

fn get_sid_from_headers(headers: &HeaderMap) -> Option<String> {
    parse_cookie(headers, SESSION_COOKIE)
}

async fn get_token_from_headers(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let sid = get_sid_from_headers(headers)?;
    let map = state.sessions.read().await;
    map.get(&sid).cloned()
}

/// Resolve the caller's identity and role snapshot, failing closed on any
/// provider or profile trouble.
async fn get_identity(state: &AppState, headers: &HeaderMap) -> Option<(AuthUser, RoleCheck)> {
    let token = get_token_from_headers(state, headers).await?;
    state.auth.resolve_session(&token).await.ok()
}

async fn validate_csrf(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(sid) = get_sid_from_headers(headers) else { return false; };
    let Some(provided) = headers.get("x-csrf-token").and_then(|v| v.to_str().ok()).map(|s| s.to_string()) else { return false; };
    let cmap = state.csrf_tokens.read().await;
    match cmap.get(&sid) {
        Some(expected) => expected == &provided,
        None => false,
    }
}

fn set_session_cookie(sid: &str) -> HeaderValue {
    // Secure, HttpOnly cookie scoped to path / with SameSite=Strict
    HeaderValue::from_str(&format!("{}={}; HttpOnly; Secure; SameSite=Strict; Path=/", SESSION_COOKIE, sid)).unwrap()
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!("{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/", SESSION_COOKIE)).unwrap()
}

fn hex_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    let _ = getrandom(&mut bytes);
    let mut out = String::with_capacity(len * 2);
    use std::fmt::Write as _;
    for b in &bytes { let _ = write!(&mut out, "{:02x}", b); }
    out
}

/// Register a provider session under a fresh cookie id and CSRF token.
async fn install_session(state: &AppState, provider_token: String) -> (String, String) {
    let sid = hex_token(16);
    let csrf = hex_token(32);
    {
        let mut map = state.sessions.write().await;
        map.insert(sid.clone(), provider_token);
    }
    {
        let mut cmap = state.csrf_tokens.write().await;
        cmap.insert(sid.clone(), csrf.clone());
    }
    (sid, csrf)
}

fn error_body(e: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status":"error","code": e.code_str(), "message": e.message()})))
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"status":"unauthorized"})))
}

fn forbidden_csrf() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::FORBIDDEN, Json(json!({"status":"forbidden","error":"invalid csrf"})))
}

fn not_approved() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::FORBIDDEN, Json(json!({"status":"forbidden","error":"account not approved"})))
}

fn emit(state: &AppState, ev: ChangeEvent) {
    // No receivers is fine; the feed is best-effort.
    let _ = state.events.send(ev);
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> impl IntoResponse {
    match state.auth.sign_in(&payload.email, &payload.password).await {
        Ok(signed) => {
            let user_id = signed.session.user.id;
            let (sid, _csrf) = install_session(&state, signed.session.token.clone()).await;
            let mut headers = HeaderMap::new();
            headers.insert("Set-Cookie", set_session_cookie(&sid));
            emit(&state, ChangeEvent::new("auth", "sign_in", user_id));
            (StatusCode::OK, headers, Json(json!({
                "status":"ok",
                "role": signed.role.as_str(),
                "is_admin": signed.is_admin(),
            })))
        }
        Err(e) => {
            let (status, body) = error_body(&e.into());
            (status, HeaderMap::new(), body)
        }
    }
}

async fn signup(State(state): State<AppState>, Json(payload): Json<SignupPayload>) -> impl IntoResponse {
    match state.auth.sign_up(&payload.email, &payload.password, &payload.name).await {
        Ok(SignUpOutcome::Admin(session)) => {
            let user_id = session.user.id;
            let (sid, _csrf) = install_session(&state, session.token).await;
            let mut headers = HeaderMap::new();
            headers.insert("Set-Cookie", set_session_cookie(&sid));
            emit(&state, ChangeEvent::new("users", "insert", user_id));
            (StatusCode::OK, headers, Json(json!({
                "status":"ok",
                "is_admin": true,
                "approval_pending": false,
                "message": "You are the first user and were made an administrator.",
            })))
        }
        Ok(SignUpOutcome::AwaitingApproval { user_id }) => {
            emit(&state, ChangeEvent::new("users", "insert", user_id));
            (StatusCode::OK, HeaderMap::new(), Json(json!({
                "status":"ok",
                "is_admin": false,
                "approval_pending": true,
                "message": "Your account is awaiting administrator approval.",
            })))
        }
        Err(e) => {
            let (status, body) = error_body(&e.into());
            (status, HeaderMap::new(), body)
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    // Require CSRF token
    if !validate_csrf(&state, &headers).await {
        let (status, body) = forbidden_csrf();
        return (status, HeaderMap::new(), body);
    }
    if let Some(sid) = get_sid_from_headers(&headers) {
        let token = {
            let mut map = state.sessions.write().await;
            map.remove(&sid)
        };
        {
            let mut cmap = state.csrf_tokens.write().await;
            cmap.remove(&sid);
        }
        if let Some(token) = token {
            state.auth.sign_out(&token).await;
        }
        emit(&state, ChangeEvent::new("auth", "sign_out", sid));
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (StatusCode::OK, h, Json(json!({"status":"ok"})))
}

async fn get_csrf(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    // Must be logged in to fetch CSRF token
    if get_identity(&state, &headers).await.is_none() {
        return unauthorized();
    }
    let Some(sid) = get_sid_from_headers(&headers) else {
        return unauthorized();
    };
    let cmap = state.csrf_tokens.read().await;
    if let Some(token) = cmap.get(&sid) {
        return (StatusCode::OK, Json(json!({"status":"ok","csrf": token})));
    }
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error":"csrf not available"})))
}

async fn reset_password(State(state): State<AppState>, Json(payload): Json<ResetPayload>) -> impl IntoResponse {
    // Always report the attempt without disclosing whether the email exists.
    let sent = state.auth.reset_password(&payload.email).await;
    (StatusCode::OK, Json(json!({"status":"ok","sent": sent})))
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordPayload>,
) -> impl IntoResponse {
    let Some(token) = get_token_from_headers(&state, &headers).await else {
        return unauthorized();
    };
    if !validate_csrf(&state, &headers).await {
        return forbidden_csrf();
    }
    match state.auth.change_password(&token, &payload.current_password, &payload.new_password).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status":"ok"}))),
        Err(e) => error_body(&e.into()),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some((user, check)) = get_identity(&state, &headers).await else {
        return unauthorized();
    };
    (StatusCode::OK, Json(json!({
        "status":"ok",
        "user": { "id": user.id, "email": user.email, "name": user.metadata.name },
        "is_admin": check.is_admin,
        "is_approved": check.is_approved,
    })))
}

// --- admin surface ---

async fn admin_list_users(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some((_user, check)) = get_identity(&state, &headers).await else {
        return unauthorized();
    };
    if !check.is_admin {
        return (StatusCode::FORBIDDEN, Json(json!({"status":"forbidden"})));
    }
    match state.auth.profiles().list().await {
        Ok(profiles) => (StatusCode::OK, Json(json!({"status":"ok","users": profiles}))),
        Err(e) => {
            error!("admin user listing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn admin_approve_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let Some((_user, check)) = get_identity(&state, &headers).await else {
        return unauthorized();
    };
    if !check.is_admin {
        return (StatusCode::FORBIDDEN, Json(json!({"status":"forbidden"})));
    }
    if !validate_csrf(&state, &headers).await {
        return forbidden_csrf();
    }
    let changes = ProfileChanges { is_approved: Some(true), ..Default::default() };
    match state.auth.profiles().update(id, changes).await {
        Ok(profile) => {
            emit(&state, ChangeEvent::new("users", "update", id));
            info!(target: "pitchdesk::admin", "user approved: {}", profile.email);
            (StatusCode::OK, Json(json!({"status":"ok","user": profile})))
        }
        Err(crate::profiles::RepoError::NotFound(_)) =>
            (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"user not found"}))),
        Err(e) => {
            error!("approve failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn admin_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let Some((user, check)) = get_identity(&state, &headers).await else {
        return unauthorized();
    };
    if !check.is_admin {
        return (StatusCode::FORBIDDEN, Json(json!({"status":"forbidden"})));
    }
    if !validate_csrf(&state, &headers).await {
        return forbidden_csrf();
    }
    if user.id == id {
        return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"cannot delete your own account"})));
    }
    match state.auth.profiles().delete(id).await {
        Ok(()) => {
            emit(&state, ChangeEvent::new("users", "delete", id));
            (StatusCode::OK, Json(json!({"status":"ok"})))
        }
        Err(crate::profiles::RepoError::NotFound(_)) =>
            (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"user not found"}))),
        Err(e) => {
            error!("delete failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

// --- clients / services / proposals ---

/// Approved session required for every data route; approval is re-checked
/// against the profile row on each request.
async fn require_approved(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, (StatusCode, Json<serde_json::Value>)> {
    let Some((user, check)) = get_identity(state, headers).await else {
        return Err(unauthorized());
    };
    if check.is_approved != Some(true) {
        return Err(not_approved());
    }
    Ok(user)
}

async fn list_clients(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    let clients = match state.clients.list() {
        Ok(c) => c,
        Err(e) => { error!("client listing failed: {e}"); return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()}))); }
    };
    let proposals = state.proposals.list().unwrap_or_default();
    let rows: Vec<serde_json::Value> = clients.iter().map(|c| {
        let n = proposals.iter().filter(|p| p.client_id == c.id).count();
        json!({
            "id": c.id, "name": c.name, "email": c.email, "phone": c.phone,
            "created_at": c.created_at, "proposals_count": n,
        })
    }).collect();
    (StatusCode::OK, Json(json!({"status":"ok","clients": rows})))
}

async fn create_client(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<NewClient>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    if payload.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"client name is required"})));
    }
    match state.clients.insert(payload) {
        Ok(client) => {
            emit(&state, ChangeEvent::new("clients", "insert", client.id));
            (StatusCode::OK, Json(json!({"status":"ok","client": client})))
        }
        Err(e) => {
            error!("client insert failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn update_client(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>, Json(payload): Json<NewClient>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    match state.clients.update(id, payload) {
        Ok(Some(client)) => {
            emit(&state, ChangeEvent::new("clients", "update", id));
            (StatusCode::OK, Json(json!({"status":"ok","client": client})))
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"client not found"}))),
        Err(e) => {
            error!("client update failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn delete_client(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    match state.clients.delete(id) {
        Ok(true) => {
            emit(&state, ChangeEvent::new("clients", "delete", id));
            (StatusCode::OK, Json(json!({"status":"ok"})))
        }
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"client not found"}))),
        Err(e) => {
            error!("client delete failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn list_services(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    match state.services.list() {
        Ok(services) => (StatusCode::OK, Json(json!({"status":"ok","services": services}))),
        Err(e) => {
            error!("service listing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn create_service(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<NewService>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    if payload.name.trim().is_empty() || !payload.price.is_finite() || payload.price < 0.0 {
        return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"a name and a non-negative price are required"})));
    }
    match state.services.insert(payload) {
        Ok(service) => {
            emit(&state, ChangeEvent::new("services", "insert", service.id));
            (StatusCode::OK, Json(json!({"status":"ok","service": service})))
        }
        Err(e) => {
            error!("service insert failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn update_service(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>, Json(payload): Json<NewService>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    match state.services.update(id, payload) {
        Ok(Some(service)) => {
            emit(&state, ChangeEvent::new("services", "update", id));
            (StatusCode::OK, Json(json!({"status":"ok","service": service})))
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"service not found"}))),
        Err(e) => {
            error!("service update failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn delete_service(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    match state.services.delete(id) {
        Ok(true) => {
            emit(&state, ChangeEvent::new("services", "delete", id));
            (StatusCode::OK, Json(json!({"status":"ok"})))
        }
        Ok(false) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"service not found"}))),
        Err(e) => {
            error!("service delete failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn list_proposals(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    match state.proposals.list() {
        Ok(proposals) => (StatusCode::OK, Json(json!({"status":"ok","proposals": proposals}))),
        Err(e) => {
            error!("proposal listing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn get_proposal(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    match state.proposals.get(id) {
        Ok(Some(p)) => (StatusCode::OK, Json(json!({"status":"ok","proposal": p}))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"proposal not found"}))),
        Err(e) => {
            error!("proposal fetch failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn create_proposal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateProposalPayload>,
) -> impl IntoResponse {
    let user = match require_approved(&state, &headers).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    if payload.service_ids.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"select at least one service"})));
    }
    match state.clients.get(payload.client_id) {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"unknown client"}))),
        Err(e) => {
            error!("client lookup failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})));
        }
    }
    let mut prices = Vec::with_capacity(payload.service_ids.len());
    for sid in &payload.service_ids {
        match state.services.get(*sid) {
            Ok(Some(svc)) => prices.push(svc.price),
            Ok(None) => return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error": format!("unknown service {}", sid)}))),
            Err(e) => {
                error!("service lookup failed: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})));
            }
        }
    }
    let totals = compute_totals(&prices, payload.discount_percent);
    let proposal = Proposal {
        id: Uuid::new_v4(),
        client_id: payload.client_id,
        service_ids: payload.service_ids,
        discount_percent: payload.discount_percent.clamp(0.0, 100.0),
        subtotal: totals.subtotal,
        discount_amount: totals.discount_amount,
        total: totals.total,
        status: ProposalStatus::Pending,
        created_by: user.id,
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    match state.proposals.insert(proposal) {
        Ok(p) => {
            emit(&state, ChangeEvent::new("proposals", "insert", p.id));
            (StatusCode::OK, Json(json!({"status":"ok","proposal": p})))
        }
        Err(e) => {
            error!("proposal insert failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn set_proposal_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<StatusPayload>,
) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    if !validate_csrf(&state, &headers).await { return forbidden_csrf(); }
    let Some(status) = ProposalStatus::parse(&payload.status) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"status":"error","error":"unknown proposal status"})));
    };
    match state.proposals.set_status(id, status) {
        Ok(Some(p)) => {
            emit(&state, ChangeEvent::new("proposals", "update", id));
            (StatusCode::OK, Json(json!({"status":"ok","proposal": p})))
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"status":"error","error":"proposal not found"}))),
        Err(e) => {
            error!("status update failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = require_approved(&state, &headers).await { return resp; }
    match state.proposals.list() {
        Ok(proposals) => {
            let m = dashboard_metrics(&proposals);
            (StatusCode::OK, Json(json!({"status":"ok","metrics": m})))
        }
        Err(e) => {
            error!("metrics failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status":"error","error": e.to_string()})))
        }
    }
}

async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> impl IntoResponse {
    // Require login
    if get_identity(&state, &headers).await.is_none() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    // Require CSRF token header too
    if !validate_csrf(&state, &headers).await {
        return (StatusCode::FORBIDDEN, "forbidden: invalid csrf").into_response();
    }
    let mut rx = state.events.subscribe();
    ws.on_upgrade(move |socket| async move {
        use futures_util::{SinkExt, StreamExt};
        let (mut sender, mut receiver) = socket.split();
        loop {
            tokio::select! {
                evt = rx.recv() => match evt {
                    Ok(ev) => {
                        let payload = json!({"status":"ok","change": ev}).to_string();
                        if sender.send(Message::Text(payload.into())).await.is_err() { break; }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let payload = json!({"status":"error","code":"lagged","message": format!("{} events dropped", skipped)}).to_string();
                        if sender.send(Message::Text(payload.into())).await.is_err() { break; }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                },
            }
        }
    })
}
