//! KMS API Server
//!
//! HTTP interface to the keystore + adaptive threat system. Two listeners:
//!
//!   - the **service** listener, public-facing, serving `/service/api/v1/**`
//!     behind a machine-to-machine bearer token whose claims carry the
//!     tenant/realm (and `/browser/api/v1/**`, session-cookie authenticated);
//!   - the **admin** listener, bound to loopback only, serving
//!     `/admin/api/v1/**` — liveness, readiness, and barrier ceremonies.
//!     It is never reachable from the public listener.
//!
//! Configuration (environment variables):
//!   KMS_SERVICE_PORT       - Public listener port (default: 3000)
//!   KMS_ADMIN_PORT         - Loopback admin listener port (default: 3001)
//!   KMS_DATA_DIR           - Persistent data directory (default: ./kms-data)
//!   KMS_API_KEY            - Bootstrap admin token, plaintext (dev only)
//!   KMS_API_KEY_HASH       - Bootstrap admin token, SHA-256 hex (production)
//!   KMS_BOOTSTRAP_TENANT   - Tenant id for the bootstrap token (default: "default")
//!   KMS_LOG_FORMAT         - "json" for structured logging, "pretty" for dev
//!   KMS_RATE_LIMIT_RPS     - Requests per second per IP (default: 20)
//!   KMS_RATE_LIMIT_BURST   - Burst capacity per IP (default: 50)
//!
//! Token scopes:
//!   read    - GET endpoints (status, metrics, list/read keys)
//!   encrypt - encrypt/decrypt operations
//!   manage  - key lifecycle (generate, activate, rotate, revoke, destroy)
//!   admin   - all of the above + token management
//!
//! Bootstrap: on first run, `KMS_API_KEY` or `KMS_API_KEY_HASH` creates the
//! initial admin token for `KMS_BOOTSTRAP_TENANT`. After that, manage tokens
//! via `POST /service/api/v1/auth/tokens`.

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use kms_barrier::barrier::{Barrier, Layer as BarrierLayer, UnsealConfig};
use kms_core::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};

// ---------------------------------------------------------------------------
// Scopes and tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Scope {
    Read,
    Encrypt,
    Manage,
    Admin,
}

impl Scope {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Scope::Read),
            "encrypt" => Some(Scope::Encrypt),
            "manage" => Some(Scope::Manage),
            "admin" => Some(Scope::Admin),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Scope::Read => "read",
            Scope::Encrypt => "encrypt",
            Scope::Manage => "manage",
            Scope::Admin => "admin",
        }
    }
}

fn has_scope(granted: &[Scope], required: Scope) -> bool {
    granted.contains(&Scope::Admin) || granted.contains(&required)
}

fn required_scope(path: &str, method: &str) -> Option<Scope> {
    if path == "/health" {
        return None;
    }
    if path.ends_with("/whoami") {
        return Some(Scope::Read);
    }
    if path.contains("/auth/tokens") {
        return Some(Scope::Admin);
    }
    if path.ends_with("/encrypt") || path.ends_with("/decrypt") || path.ends_with("/sign") || path.ends_with("/verify") {
        return Some(Scope::Encrypt);
    }
    if method == "POST" || method == "DELETE" || method == "PATCH" || method == "PUT" {
        return Some(Scope::Manage);
    }
    Some(Scope::Read)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEntry {
    id: String,
    name: String,
    tenant_id: String,
    token_hash: String,
    scopes: Vec<Scope>,
    created_at: String,
    active: bool,
    #[serde(default)]
    last_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenStore {
    tokens: Vec<TokenEntry>,
}

#[derive(Serialize)]
struct TokenInfo {
    id: String,
    name: String,
    tenant_id: String,
    scopes: Vec<Scope>,
    created_at: String,
    active: bool,
    last_used: Option<String>,
}

impl TokenStore {
    fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::error!("failed to parse tokens.json: {}", e);
                Self::new()
            }),
            Err(_) => Self::new(),
        }
    }

    fn save(&self, path: &str) -> Result<(), String> {
        let data = serde_json::to_string_pretty(self).map_err(|e| format!("serialize: {e}"))?;
        std::fs::write(path, data).map_err(|e| format!("write {path}: {e}"))
    }

    fn authenticate(&self, provided_hash: &[u8; 32]) -> Option<&TokenEntry> {
        let provided_hex = hex::encode(provided_hash);
        self.tokens.iter().find(|t| {
            t.active && {
                let stored = t.token_hash.as_bytes();
                let provided = provided_hex.as_bytes();
                stored.len() == provided.len() && stored.ct_eq(provided).into()
            }
        })
    }

    fn add(&mut self, entry: TokenEntry) {
        self.tokens.push(entry);
    }

    fn deactivate(&mut self, id: &str) -> bool {
        if let Some(entry) = self.tokens.iter_mut().find(|t| t.id == id) {
            entry.active = false;
            true
        } else {
            false
        }
    }

    fn touch(&mut self, id: &str) {
        if let Some(entry) = self.tokens.iter_mut().find(|t| t.id == id) {
            entry.last_used = Some(chrono::Utc::now().to_rfc3339());
        }
    }

    fn list_info(&self) -> Vec<TokenInfo> {
        self.tokens
            .iter()
            .map(|t| TokenInfo {
                id: t.id.clone(),
                name: t.name.clone(),
                tenant_id: t.tenant_id.clone(),
                scopes: t.scopes.clone(),
                created_at: t.created_at.clone(),
                active: t.active,
                last_used: t.last_used.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    keystore: Keystore,
    tokens: RwLock<TokenStore>,
    tokens_path: String,
    rate_limiter: RateLimiter,
}

type Shared = Arc<AppState>;

// ---------------------------------------------------------------------------
// Rate limiter (token bucket, per source IP)
// ---------------------------------------------------------------------------

struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
    rps: f64,
    burst: u32,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(rps: f64, burst: u32) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), rps, burst }
    }

    async fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert(TokenBucket {
            tokens: self.burst as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn cleanup_rate_limiter(limiter: &RateLimiter) {
    let mut buckets = limiter.buckets.lock().await;
    let now = Instant::now();
    buckets.retain(|_, bucket| now.duration_since(bucket.last_refill).as_secs() < 300);
}

// ---------------------------------------------------------------------------
// Crypto utilities
// ---------------------------------------------------------------------------

fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn generate_token() -> String {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    hex::encode(buf)
}

fn generate_token_id() -> String {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    format!("tok_{}", hex::encode(buf))
}

// ---------------------------------------------------------------------------
// Realm/tenant context (C8) — populated by auth middleware, immutable after
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct RealmContext {
    tenant_id: TenantId,
    token_id: String,
    token_name: String,
    scopes: Vec<Scope>,
}

// ---------------------------------------------------------------------------
// Error mapping (§7) — every KeystoreError collapses to an ErrorKind, and
// every ErrorKind maps to exactly one status code.
// ---------------------------------------------------------------------------

fn kind_to_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Sealed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize, Clone)]
struct ApiError {
    error: String,
}

fn error_response(kind: ErrorKind, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    let msg = msg.into();
    // The ambient tracing span (see `request_id_middleware`) already carries
    // request_id and path; this just adds the stable error code on top, so
    // every error path is traceable to one request without re-threading it
    // through every handler's argument list.
    tracing::warn!(error_kind = ?kind, message = %msg, "request failed");
    (kind_to_status(kind), Json(ApiError { error: msg }))
}

// ---------------------------------------------------------------------------
// Middleware — rate limiting, then auth (realm extraction)
// ---------------------------------------------------------------------------

/// Stamps every request with a unique id, visible to handlers via request
/// extensions and attached to the tracing span so every log line --
/// including every error path -- carries it alongside the tenant id.
async fn request_id_middleware(mut req: Request, next: Next) -> impl IntoResponse {
    use tracing::Instrument;
    let request_id = uuid::Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));
    let span = tracing::info_span!("request", request_id = %request_id, path = %req.uri().path());
    next.run(req).instrument(span).await
}

#[derive(Clone)]
struct RequestId(String);

async fn rate_limit_middleware(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    if req.uri().path() == "/health" {
        return next.run(req).await.into_response();
    }

    if !state.rate_limiter.check(addr.ip()).await {
        state.keystore.record_threat_event(
            ThreatEvent::new(ThreatEventKind::RapidAccessPattern, 0.3)
                .with_detail(format!("rate limit exceeded: {}", addr.ip())),
        );
        tracing::warn!(ip = %addr.ip(), path = %req.uri().path(), "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            Json(ApiError { error: "rate limit exceeded".into() }),
        )
            .into_response();
    }

    next.run(req).await.into_response()
}

/// Authenticates the `/service/**` prefix: a bearer token whose claims carry
/// the tenant/realm. Populates [`RealmContext`] for downstream handlers.
async fn service_auth_middleware(
    State(state): State<Shared>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> impl IntoResponse {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();

    let required = match required_scope(&path, &method) {
        Some(s) => s,
        None => return next.run(req).await.into_response(),
    };

    let store = state.tokens.read().await;
    if store.tokens.is_empty() {
        drop(store);
        // Dev mode: no tokens configured, operate as the default tenant with full scope.
        req.extensions_mut().insert(RealmContext {
            tenant_id: TenantId::new("default"),
            token_id: "dev".into(),
            token_name: "dev-mode".into(),
            scopes: vec![Scope::Admin],
        });
        return next.run(req).await.into_response();
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match auth_header {
        Some(val) if val.starts_with("Bearer ") => {
            let provided = &val[7..];
            let provided_hash = hash_token(provided);

            match store.authenticate(&provided_hash) {
                Some(entry) => {
                    if !has_scope(&entry.scopes, required) {
                        tracing::warn!(ip = %addr.ip(), token_id = %entry.id, required = %required.as_str(), "insufficient scope");
                        return error_response(
                            ErrorKind::PermissionDenied,
                            format!("insufficient scope: requires '{}' permission", required.as_str()),
                        )
                        .into_response();
                    }

                    let ctx = RealmContext {
                        tenant_id: TenantId::new(&entry.tenant_id),
                        token_id: entry.id.clone(),
                        token_name: entry.name.clone(),
                        scopes: entry.scopes.clone(),
                    };
                    let token_id = entry.id.clone();
                    drop(store);

                    let state2 = state.clone();
                    tokio::spawn(async move {
                        let mut s = state2.tokens.write().await;
                        s.touch(&token_id);
                        let _ = s.save(&state2.tokens_path);
                    });

                    req.extensions_mut().insert(ctx);
                    next.run(req).await.into_response()
                }
                None => {
                    drop(store);
                    state.keystore.record_threat_event(
                        ThreatEvent::new(ThreatEventKind::AuthFailure, 0.5)
                            .with_detail(format!("invalid bearer token from {}", addr.ip())),
                    );
                    tracing::warn!(ip = %addr.ip(), path = %path, "invalid bearer token");
                    error_response(ErrorKind::PermissionDenied, "authentication failed").into_response()
                }
            }
        }
        _ => {
            drop(store);
            error_response(
                ErrorKind::PermissionDenied,
                "missing Authorization header (use: Bearer <token>)",
            )
            .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreatePoolReq {
    name: String,
    #[serde(default)]
    description: String,
    pool_name: Option<String>,
    key_type: String,
    algorithm: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default = "default_true")]
    versioning_allowed: bool,
    #[serde(default)]
    import_allowed: bool,
    policy_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct AddMaterialReq {
    #[serde(default)]
    force: bool,
    /// Caller-supplied key material, hex-encoded. Present only for
    /// `import`; absent (the default) means "generate fresh material",
    /// the original `rotate` behavior.
    secret_material_hex: Option<String>,
}

#[derive(Deserialize, Default)]
struct UpdatePoolReq {
    policy_id: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct EncryptReq {
    plaintext: String,
    #[serde(default)]
    aad: String,
}

#[derive(Deserialize)]
struct DecryptReq {
    blob: EncryptedBlob,
    #[serde(default)]
    aad: String,
}

#[derive(Deserialize)]
struct RevokeReq {
    reason: String,
}

#[derive(Deserialize)]
struct SignReq {
    message: String,
}

#[derive(Deserialize)]
struct VerifyReq {
    message: String,
    signature_hex: String,
}

#[derive(Deserialize)]
struct CreateTokenReq {
    name: String,
    tenant_id: String,
    scopes: Vec<String>,
}

#[derive(Deserialize)]
struct UnsealReq {
    share_hex: String,
}

#[derive(Deserialize)]
struct RotateBarrierReq {
    /// "intermediate" or "content" — "root" is rejected by the keystore.
    layer: String,
    id: String,
}

#[derive(Serialize)]
struct PoolResponse {
    id: String,
    name: String,
    description: String,
    pool_name: String,
    key_type: String,
    algorithm: String,
    provider: String,
    status: String,
    pool_disabled: bool,
    current_version: u32,
    versioning_allowed: bool,
    import_allowed: bool,
    export_allowed: bool,
    usage_count: u64,
    created_at: String,
    updated_at: String,
}

fn pool_to_response(meta: &KeyMetadata) -> PoolResponse {
    PoolResponse {
        id: meta.id.as_str().to_string(),
        name: meta.name.clone(),
        description: meta.description.clone(),
        pool_name: meta.pool_name.clone(),
        key_type: format!("{:?}", meta.key_type),
        algorithm: meta.algorithm.to_string(),
        provider: meta.provider.to_string(),
        status: meta.state.to_string(),
        pool_disabled: meta.pool_disabled,
        current_version: meta.current_version,
        versioning_allowed: meta.versioning_allowed,
        import_allowed: meta.import_allowed,
        export_allowed: meta.export_allowed,
        usage_count: meta.usage_count,
        created_at: meta.created_at.to_rfc3339(),
        updated_at: meta.updated_at.to_rfc3339(),
    }
}

fn parse_key_type(s: &str) -> Option<KeyType> {
    match s.to_lowercase().as_str() {
        "root" => Some(KeyType::Root),
        "domain" => Some(KeyType::Domain),
        "kek" | "keyencrypting" => Some(KeyType::KeyEncrypting),
        "dek" | "dataencrypting" => Some(KeyType::DataEncrypting),
        _ => None,
    }
}

fn parse_algorithm(s: &str) -> Option<AlgorithmFamily> {
    match s.to_lowercase().as_str() {
        "rsa" => Some(AlgorithmFamily::Rsa),
        "ec" => Some(AlgorithmFamily::Ec),
        "eddsa" => Some(AlgorithmFamily::EdDsa),
        "ecdh" => Some(AlgorithmFamily::Ecdh),
        "aes" => Some(AlgorithmFamily::Aes),
        "hmac" => Some(AlgorithmFamily::Hmac),
        _ => None,
    }
}

fn parse_provider(s: &str) -> Option<KeyProvider> {
    match s.to_lowercase().as_str() {
        "internal" => Some(KeyProvider::Internal),
        "aws" => Some(KeyProvider::Aws),
        "gcp" => Some(KeyProvider::Gcp),
        "azure" => Some(KeyProvider::Azure),
        _ => None,
    }
}

fn parse_layer(s: &str) -> Option<BarrierLayer> {
    match s.to_lowercase().as_str() {
        "root" => Some(BarrierLayer::Root),
        "intermediate" => Some(BarrierLayer::Intermediate),
        "content" => Some(BarrierLayer::Content),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Routes — /service/api/v1/elastickey/**
// ---------------------------------------------------------------------------

async fn create_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Json(body): Json<CreatePoolReq>,
) -> impl IntoResponse {
    let kt = match parse_key_type(&body.key_type) {
        Some(kt) => kt,
        None => return error_response(ErrorKind::InvalidArgument, format!("invalid key_type: {}", body.key_type)).into_response(),
    };
    let algo = match parse_algorithm(&body.algorithm) {
        Some(a) => a,
        None => return error_response(ErrorKind::InvalidArgument, format!("invalid algorithm: {}", body.algorithm)).into_response(),
    };
    let pool_name = body.pool_name.clone().unwrap_or_else(|| body.name.clone());
    let policy = body.policy_id.as_deref().map(PolicyId::new);
    let provider = match body.provider.as_deref() {
        None => KeyProvider::Internal,
        Some(s) => match parse_provider(s) {
            Some(p) => p,
            None => return error_response(ErrorKind::InvalidArgument, format!("invalid provider: {s}")).into_response(),
        },
    };

    match state.keystore.generate(
        &ctx.tenant_id,
        body.name.clone(),
        body.description.clone(),
        pool_name,
        kt,
        algo,
        provider,
        body.versioning_allowed,
        body.import_allowed,
        policy,
        None,
    ).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({"id": id.as_str()}))).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

async fn get_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.keystore.get(&ctx.tenant_id, &KeyId::new(&id)).await {
        Ok(meta) => Json(pool_to_response(&meta)).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn add_material(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    body: Option<Json<AddMaterialReq>>,
) -> impl IntoResponse {
    let Json(req) = body.unwrap_or(Json(AddMaterialReq { force: false, secret_material_hex: None }));
    let key_id = KeyId::new(&id);

    match req.secret_material_hex {
        Some(hex_material) => {
            let material = match hex::decode(&hex_material) {
                Ok(bytes) => bytes,
                Err(e) => return error_response(ErrorKind::InvalidArgument, format!("invalid secret_material_hex: {e}")).into_response(),
            };
            match state.keystore.import(&ctx.tenant_id, &key_id, &material).await {
                Ok(version) => Json(serde_json::json!({"status": "imported", "key_id": key_id.as_str(), "version": version})).into_response(),
                Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
            }
        }
        None => match state.keystore.rotate(&ctx.tenant_id, &key_id).await {
            Ok(new_id) => Json(serde_json::json!({"status": "added", "key_id": new_id.as_str()})).into_response(),
            Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
        },
    }
}

async fn list_materials(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.keystore.get(&ctx.tenant_id, &KeyId::new(&id)).await {
        Ok(meta) => Json(serde_json::json!({
            "versions": meta.versions.iter().map(|v| serde_json::json!({
                "version": v.version,
                "created_at": v.created_at.to_rfc3339(),
                "public_key_hex": v.public_key_hex,
                "revoked": v.revoked,
            })).collect::<Vec<_>>(),
        })).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn list_pools(State(state): State<Shared>, Extension(ctx): Extension<RealmContext>) -> impl IntoResponse {
    match state.keystore.list_keys(&ctx.tenant_id).await {
        Ok(keys) => Json(keys.iter().map(pool_to_response).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn activate_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.keystore.activate(&ctx.tenant_id, &KeyId::new(&id)).await {
        Ok(()) => Json(serde_json::json!({"status": "activated"})).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

/// `DisablePool`: blocks future `AddMaterial` only. For whole-key emergency
/// deactivation (blocks encrypt/sign immediately) see `revoke_pool`.
async fn disable_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.keystore.disable_pool(&ctx.tenant_id, &KeyId::new(&id)).await {
        Ok(()) => Json(serde_json::json!({"status": "pool_disabled"})).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

/// Whole-key emergency deactivation — the pre-existing `Keystore::revoke`,
/// distinct from `disable_pool` above.
async fn revoke_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    body: Option<Json<RevokeReq>>,
) -> impl IntoResponse {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_else(|| "revoked via API".into());
    match state.keystore.revoke(&ctx.tenant_id, &KeyId::new(&id), reason).await {
        Ok(()) => Json(serde_json::json!({"status": "revoked"})).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

/// `UpdatePool`: metadata-only update (policy/tags). Algorithm, key type,
/// and name are immutable and not accepted here.
async fn update_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePoolReq>,
) -> impl IntoResponse {
    let policy = body.policy_id.as_deref().map(PolicyId::new);
    match state.keystore.update_metadata(&ctx.tenant_id, &KeyId::new(&id), policy, body.tags).await {
        Ok(meta) => Json(pool_to_response(&meta)).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

/// `RevokeMaterial`: revoke a single version without touching the rest of
/// the key's lifecycle.
async fn revoke_material(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path((id, version)): Path<(String, u32)>,
) -> impl IntoResponse {
    match state.keystore.revoke_material(&ctx.tenant_id, &KeyId::new(&id), version).await {
        Ok(()) => Json(serde_json::json!({"status": "material_revoked", "version": version})).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

/// `GetMaterialPublic`: the public half of an asymmetric version.
async fn get_material_public(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path((id, version)): Path<(String, u32)>,
) -> impl IntoResponse {
    match state.keystore.get_material_public(&ctx.tenant_id, &KeyId::new(&id), version).await {
        Ok(public_key_hex) => Json(serde_json::json!({"version": version, "public_key_hex": public_key_hex})).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn destroy_pool(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.keystore.destroy(&ctx.tenant_id, &KeyId::new(&id)).await {
        Ok(()) => Json(serde_json::json!({"status": "destroyed"})).into_response(),
        Err(e) => error_response(e.0.kind(), e.to_string()).into_response(),
    }
}

async fn encrypt_data(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    Json(body): Json<EncryptReq>,
) -> impl IntoResponse {
    match state.keystore.encrypt(&ctx.tenant_id, &KeyId::new(&id), body.plaintext.as_bytes(), body.aad.as_bytes()).await {
        Ok(blob) => (StatusCode::OK, Json(blob)).into_response(),
        Err(e) => error_response(ErrorKind::InvalidArgument, e.to_string()).into_response(),
    }
}

async fn decrypt_data(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Json(body): Json<DecryptReq>,
) -> impl IntoResponse {
    match state.keystore.decrypt(&ctx.tenant_id, &body.blob, body.aad.as_bytes()).await {
        Ok(pt) => Json(serde_json::json!({"plaintext": String::from_utf8_lossy(&pt)})).into_response(),
        Err(e) => error_response(ErrorKind::Integrity, e.to_string()).into_response(),
    }
}

/// Only the HMAC family has a real signature primitive today (a MAC over the
/// content key barrier already manages) — see `Keystore::sign` for why
/// RSA/EC/EdDSA report `InvalidArgument` instead of a fabricated signature.
async fn sign_data(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    Json(body): Json<SignReq>,
) -> impl IntoResponse {
    match state.keystore.sign(&ctx.tenant_id, &KeyId::new(&id), body.message.as_bytes()).await {
        Ok(sig) => Json(serde_json::json!({"signature_hex": hex::encode(sig)})).into_response(),
        Err(e) => error_response(ErrorKind::InvalidArgument, e.to_string()).into_response(),
    }
}

async fn verify_data(
    State(state): State<Shared>,
    Extension(ctx): Extension<RealmContext>,
    Path(id): Path<String>,
    Json(body): Json<VerifyReq>,
) -> impl IntoResponse {
    let sig = match hex::decode(&body.signature_hex) {
        Ok(b) => b,
        Err(_) => return error_response(ErrorKind::InvalidArgument, "signature_hex is not valid hex").into_response(),
    };
    match state.keystore.verify(&ctx.tenant_id, &KeyId::new(&id), body.message.as_bytes(), &sig).await {
        Ok(valid) => Json(serde_json::json!({"valid": valid})).into_response(),
        Err(e) => error_response(ErrorKind::Integrity, e.to_string()).into_response(),
    }
}

/// Generate-random (C6's `Random` pseudo-family): fresh CSPRNG bytes, never
/// persisted as key material. `n` defaults to 32, capped at 1KiB per call.
async fn random_bytes(
    State(state): State<Shared>,
    Extension(_ctx): Extension<RealmContext>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let n: usize = params.get("n").and_then(|s| s.parse().ok()).unwrap_or(32);
    if n == 0 || n > 1024 {
        return error_response(ErrorKind::InvalidArgument, "n must be between 1 and 1024").into_response();
    }
    let bytes = state.keystore.generate_random(n);
    Json(serde_json::json!({"random_hex": hex::encode(bytes)})).into_response()
}

// ---------------------------------------------------------------------------
// Routes — /service/api/v1/status, metrics, threat, policies
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Shared>, Extension(ctx): Extension<RealmContext>) -> impl IntoResponse {
    let ks = &state.keystore;
    let level = ks.threat_level();
    let all = ks.list_keys(&ctx.tenant_id).await.unwrap_or_default();
    let active = all.iter().filter(|k| k.state == KeyState::Active).count();
    Json(serde_json::json!({
        "threat_level": level.value(), "threat_name": level.label(), "threat_color": level.color(),
        "threat_score": ks.threat_score(), "total_keys": all.len(), "active_keys": active,
    })).into_response()
}

async fn get_metrics(State(state): State<Shared>, Extension(ctx): Extension<RealmContext>) -> impl IntoResponse {
    match state.keystore.security_metrics(&ctx.tenant_id).await {
        Ok(m) => Json(m).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn get_threat(State(state): State<Shared>, Extension(_ctx): Extension<RealmContext>) -> impl IntoResponse {
    let ks = &state.keystore;
    let history: Vec<_> = ks.threat_history().iter().map(|(ts, lv, reason)| serde_json::json!({
        "timestamp": ts.to_rfc3339(), "level": lv.value(), "level_name": lv.label(), "reason": reason,
    })).collect();
    Json(serde_json::json!({
        "score": ks.threat_score(), "level": ks.threat_level().value(),
        "name": ks.threat_level().label(), "color": ks.threat_level().color(), "history": history,
    })).into_response()
}

async fn expire_due(State(state): State<Shared>, Extension(ctx): Extension<RealmContext>) -> impl IntoResponse {
    match state.keystore.expire_due_keys(&ctx.tenant_id).await {
        Ok(report) => Json(serde_json::json!({
            "expired": report.expired.len(), "warnings": report.warnings.len(), "skipped": report.skipped,
        })).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Routes — token management (admin scope, served on /service/**)
// ---------------------------------------------------------------------------

async fn list_tokens(State(state): State<Shared>) -> impl IntoResponse {
    let store = state.tokens.read().await;
    Json(store.list_info())
}

async fn create_token(State(state): State<Shared>, Json(req): Json<CreateTokenReq>) -> impl IntoResponse {
    if req.name.is_empty() || req.name.len() > 100 {
        return error_response(ErrorKind::InvalidArgument, "name must be 1-100 characters").into_response();
    }
    if req.tenant_id.is_empty() {
        return error_response(ErrorKind::InvalidArgument, "tenant_id is required").into_response();
    }

    let mut scopes = Vec::new();
    for s in &req.scopes {
        match Scope::from_str(s) {
            Some(scope) => { if !scopes.contains(&scope) { scopes.push(scope); } }
            None => return error_response(ErrorKind::InvalidArgument, format!("invalid scope '{s}' — valid: read, encrypt, manage, admin")).into_response(),
        }
    }
    if scopes.is_empty() {
        return error_response(ErrorKind::InvalidArgument, "at least one scope required").into_response();
    }

    let plaintext_token = generate_token();
    let token_hash = hash_token(&plaintext_token);
    let token_id = generate_token_id();

    let entry = TokenEntry {
        id: token_id.clone(),
        name: req.name.clone(),
        tenant_id: req.tenant_id.clone(),
        token_hash: hex::encode(token_hash),
        scopes: scopes.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        active: true,
        last_used: None,
    };

    let mut store = state.tokens.write().await;
    store.add(entry);
    if let Err(e) = store.save(&state.tokens_path) {
        return error_response(ErrorKind::Internal, format!("failed to save: {e}")).into_response();
    }

    tracing::info!(token_id = %token_id, tenant_id = %req.tenant_id, scopes = ?scopes, "created token");

    (StatusCode::CREATED, Json(serde_json::json!({
        "token_id": token_id, "tenant_id": req.tenant_id, "token": plaintext_token, "scopes": scopes,
        "warning": "Save this token now. It cannot be retrieved again.",
    }))).into_response()
}

async fn revoke_token(State(state): State<Shared>, Path(id): Path<String>) -> impl IntoResponse {
    let mut store = state.tokens.write().await;
    let target = store.tokens.iter().find(|t| t.id == id);
    match target {
        None => return error_response(ErrorKind::NotFound, format!("token '{id}' not found")).into_response(),
        Some(entry) => {
            if !entry.active {
                return error_response(ErrorKind::InvalidArgument, format!("token '{id}' already revoked")).into_response();
            }
            if entry.scopes.contains(&Scope::Admin) {
                let other_admins = store.tokens.iter()
                    .filter(|t| t.id != id && t.active && t.scopes.contains(&Scope::Admin))
                    .count();
                if other_admins == 0 {
                    return error_response(ErrorKind::InvalidArgument, "cannot revoke the last admin token").into_response();
                }
            }
        }
    }

    store.deactivate(&id);
    if let Err(e) = store.save(&state.tokens_path) {
        return error_response(ErrorKind::Internal, format!("failed to save: {e}")).into_response();
    }
    tracing::info!(token_id = %id, "revoked token");
    Json(serde_json::json!({"status": "revoked", "token_id": id})).into_response()
}

async fn whoami(Extension(ctx): Extension<RealmContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "token_id": ctx.token_id, "token_name": ctx.token_name,
        "tenant_id": ctx.tenant_id.as_str(), "scopes": ctx.scopes,
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// Admin listener (loopback only) — liveness, readiness, barrier ceremonies
// ---------------------------------------------------------------------------

async fn livez() -> impl IntoResponse {
    Json(serde_json::json!({"status": "alive"}))
}

async fn readyz(State(state): State<Shared>) -> impl IntoResponse {
    if state.keystore.is_sealed() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"ready": false, "reason": "sealed"}))).into_response()
    } else {
        Json(serde_json::json!({"ready": true})).into_response()
    }
}

async fn admin_unseal(State(state): State<Shared>, Json(req): Json<UnsealReq>) -> impl IntoResponse {
    let share = match hex::decode(&req.share_hex) {
        Ok(b) => b,
        Err(_) => return error_response(ErrorKind::InvalidArgument, "share_hex is not valid hex").into_response(),
    };
    match state.keystore.submit_unseal_share(share) {
        Ok(progress) => Json(serde_json::json!({
            "have": progress.have, "need": progress.need, "unsealed": progress.unsealed,
        })).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

async fn admin_seal(State(state): State<Shared>) -> impl IntoResponse {
    state.keystore.seal();
    Json(serde_json::json!({"status": "sealed"}))
}

async fn admin_rotate(State(state): State<Shared>, Json(req): Json<RotateBarrierReq>) -> impl IntoResponse {
    // Barrier-layer rotation (intermediate/content) is distinct from per-pool
    // material rotation, which is exposed on the service listener as
    // `POST /service/api/v1/elastickey/{id}/materialkey`.
    let layer = match parse_layer(&req.layer) {
        Some(l) => l,
        None => return error_response(ErrorKind::InvalidArgument, format!("unknown layer: {}", req.layer)).into_response(),
    };
    match state.keystore.rotate_barrier_layer(layer, &req.id) {
        Ok(()) => Json(serde_json::json!({"status": "rotated", "layer": req.layer, "id": req.id})).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn create_keystore(data_dir: &str) -> Keystore {
    let barrier_path = format!("{data_dir}/barrier-shares.json");
    let audit_path = format!("{data_dir}/kms-audit.jsonl");
    std::fs::create_dir_all(data_dir).expect("failed to create data directory");

    // A freshly-started process always comes up sealed; the operator supplies
    // unseal shares out-of-band via `POST /admin/api/v1/unseal`. For a brand
    // new barrier we mint shares and stash them (dev convenience only — a
    // production deployment distributes these to key custodians instead).
    let (barrier, shares) = Barrier::initialize(UnsealConfig::new(1, 1).expect("valid default quorum"))
        .expect("failed to initialize barrier");
    if !std::path::Path::new(&barrier_path).exists() {
        let _ = std::fs::write(&barrier_path, hex::encode(&shares[0]));
        tracing::warn!(path = %barrier_path, "wrote dev unseal share — do not do this in production");
    }

    let repo: Arc<KeyRepository> = Arc::new(InMemoryRepository::new());
    let file_sink: Arc<dyn AuditSinkSync> = Arc::new(FileAuditSink::new(&audit_path));
    let audit: Arc<dyn AuditSinkSync> = Arc::new(IntegrityChainSink::new(file_sink));

    let mut ks = Keystore::new(repo, Arc::new(barrier), audit);
    ks.register_policy(KeyPolicy::default_dek());
    ks.register_policy(KeyPolicy::default_kek());
    ks
}

fn resolve_bootstrap_hash() -> Option<[u8; 32]> {
    if let Ok(hex_hash) = std::env::var("KMS_API_KEY_HASH") {
        let hex_hash = hex_hash.trim();
        if hex_hash.is_empty() { return None; }
        if hex_hash.len() != 64 {
            tracing::error!("KMS_API_KEY_HASH must be 64 hex characters");
            std::process::exit(1);
        }
        let mut hash = [0u8; 32];
        return match hex::decode_to_slice(hex_hash, &mut hash) {
            Ok(()) => Some(hash),
            Err(e) => { tracing::error!("KMS_API_KEY_HASH invalid hex: {}", e); std::process::exit(1); }
        };
    }
    if let Ok(pt) = std::env::var("KMS_API_KEY") {
        let pt = pt.trim();
        if pt.is_empty() { return None; }
        tracing::warn!("using KMS_API_KEY (plaintext) — use KMS_API_KEY_HASH for production");
        return Some(hash_token(pt));
    }
    None
}

fn bootstrap_tokens(data_dir: &str) -> (TokenStore, String) {
    let path = format!("{data_dir}/tokens.json");
    let mut store = TokenStore::load(&path);

    if !store.tokens.is_empty() {
        let active = store.tokens.iter().filter(|t| t.active).count();
        tracing::info!(total = store.tokens.len(), active, "loaded tokens");
        return (store, path);
    }

    if let Some(hash_bytes) = resolve_bootstrap_hash() {
        let tenant = std::env::var("KMS_BOOTSTRAP_TENANT").unwrap_or_else(|_| "default".into());
        let entry = TokenEntry {
            id: "tok_bootstrap".to_string(),
            name: "bootstrap-admin".to_string(),
            tenant_id: tenant.clone(),
            token_hash: hex::encode(hash_bytes),
            scopes: vec![Scope::Admin],
            created_at: chrono::Utc::now().to_rfc3339(),
            active: true,
            last_used: None,
        };
        store.add(entry);
        if let Err(e) = store.save(&path) {
            tracing::error!("failed to save bootstrap token: {}", e);
        }
        tracing::info!(tenant_id = %tenant, "created bootstrap admin token from environment");
    } else {
        tracing::warn!("no tokens configured — dev mode (all service endpoints open as tenant 'default')");
    }

    (store, path)
}

fn service_router(state: Shared) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/service/api/v1/status", get(get_status))
        .route("/service/api/v1/metrics", get(get_metrics))
        .route("/service/api/v1/threat", get(get_threat))
        .route("/service/api/v1/expire", post(expire_due))
        .route("/service/api/v1/random", get(random_bytes))
        .route("/service/api/v1/elastickey", get(list_pools).post(create_pool))
        .route("/service/api/v1/elastickey/:id", get(get_pool).patch(update_pool))
        .route("/service/api/v1/elastickey/:id/activate", post(activate_pool))
        .route("/service/api/v1/elastickey/:id/disable", post(disable_pool))
        .route("/service/api/v1/elastickey/:id/revoke", post(revoke_pool))
        .route("/service/api/v1/elastickey/:id/destroy", post(destroy_pool))
        .route("/service/api/v1/elastickey/:id/materialkey", post(add_material))
        .route("/service/api/v1/elastickey/:id/materialkeys", get(list_materials))
        .route("/service/api/v1/elastickey/:id/materialkeys/:version/revoke", post(revoke_material))
        .route("/service/api/v1/elastickey/:id/materialkeys/:version/public", get(get_material_public))
        .route("/service/api/v1/elastickey/:id/encrypt", post(encrypt_data))
        .route("/service/api/v1/elastickey/:id/decrypt", post(decrypt_data))
        .route("/service/api/v1/elastickey/:id/sign", post(sign_data))
        .route("/service/api/v1/elastickey/:id/verify", post(verify_data))
        .route("/service/api/v1/auth/tokens", get(list_tokens).post(create_token))
        .route("/service/api/v1/auth/tokens/:id", axum::routing::delete(revoke_token))
        .route("/service/api/v1/auth/whoami", get(whoami))
        .layer(middleware::from_fn_with_state(state.clone(), service_auth_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

fn admin_router(state: Shared) -> Router {
    Router::new()
        .route("/admin/api/v1/livez", get(livez))
        .route("/admin/api/v1/readyz", get(readyz))
        .route("/admin/api/v1/unseal", post(admin_unseal))
        .route("/admin/api/v1/seal", post(admin_seal))
        .route("/admin/api/v1/rotate", post(admin_rotate))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let log_format = std::env::var("KMS_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kms_api=info,tower_http=info".into());
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).with_target(true).with_thread_ids(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let service_port: u16 = std::env::var("KMS_SERVICE_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let admin_port: u16 = std::env::var("KMS_ADMIN_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3001);
    let data_dir = std::env::var("KMS_DATA_DIR").unwrap_or_else(|_| "./kms-data".into());
    let rate_rps: f64 = std::env::var("KMS_RATE_LIMIT_RPS").ok().and_then(|v| v.parse().ok()).unwrap_or(20.0);
    let rate_burst: u32 = std::env::var("KMS_RATE_LIMIT_BURST").ok().and_then(|v| v.parse().ok()).unwrap_or(50);

    let (token_store, tokens_path) = bootstrap_tokens(&data_dir);
    let ks = create_keystore(&data_dir);

    let state: Shared = Arc::new(AppState {
        keystore: ks,
        tokens: RwLock::new(token_store),
        tokens_path,
        rate_limiter: RateLimiter::new(rate_rps, rate_burst),
    });

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_rate_limiter(&cleanup_state.rate_limiter).await;
        }
    });

    let service_app = service_router(state.clone());
    let admin_app = admin_router(state.clone());

    let service_addr = format!("0.0.0.0:{service_port}");
    let admin_addr = format!("127.0.0.1:{admin_port}");

    tracing::info!(data_dir = %data_dir, "starting KMS API server");
    tracing::info!("  service listener: http://{}/service/api/v1/", service_addr);
    tracing::info!("  admin listener:   http://{}/admin/api/v1/ (loopback only)", admin_addr);

    let service_listener = tokio::net::TcpListener::bind(&service_addr).await
        .unwrap_or_else(|e| { tracing::error!("failed to bind service listener: {}", e); std::process::exit(1); });
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await
        .unwrap_or_else(|e| { tracing::error!("failed to bind admin listener: {}", e); std::process::exit(2); });

    let service_task = axum::serve(service_listener, service_app.into_make_service_with_connect_info::<SocketAddr>());
    let admin_task = axum::serve(admin_listener, admin_app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        r = service_task => { if let Err(e) = r { tracing::error!("service listener error: {}", e); } }
        r = admin_task => { if let Err(e) = r { tracing::error!("admin listener error: {}", e); } }
    }
}
