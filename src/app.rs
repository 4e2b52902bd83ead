use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use axum_extra::TypedHeader;
use constant_time_eq::constant_time_eq;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::catalog::{no_data_on_decode, CatalogApi, ListQuery, VokinoClient};
use crate::config::Config;
use crate::detail::{DetailLoader, DetailView};
use crate::error::ApiError;
use crate::fetcher::Fetcher;
use crate::home::{Category, HomeFeed, HERO_ROTATE_INTERVAL};
use crate::models::{dedupe_by, parse_list};
use crate::overrides::{
    FileOverrideStore, MemoryOverrideStore, Override, OverrideCache, OverrideStore,
    RemoteOverrideStore,
};
use crate::palette::{self, Palette, PaletteSource};
use crate::search::{run_search, SearchParams};

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_BATCH_IDS: usize = 200;
const MAX_CACHED_PALETTES: usize = 1_000;

type AdminAuth = Option<TypedHeader<Authorization<Bearer>>>;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogApi>,
    pub store: Arc<dyn OverrideStore>,
    pub overrides: OverrideCache,
    pub details: DetailLoader,
    pub fetcher: Fetcher,
    pub admin_token: Option<String>,
    pub palettes: Arc<RwLock<HashMap<String, Palette>>>,
    pub palette_hosts: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        store: Arc<dyn OverrideStore>,
        fetcher: Fetcher,
        admin_token: Option<String>,
        override_ttl: Duration,
    ) -> Self {
        let overrides = OverrideCache::new(store.clone(), override_ttl);
        Self {
            details: DetailLoader::new(catalog.clone(), overrides.clone()),
            catalog,
            store,
            overrides,
            fetcher,
            admin_token,
            palettes: Arc::new(RwLock::new(HashMap::new())),
            palette_hosts: Arc::new(Vec::new()),
        }
    }

    /// Limits palette downloads to these image hosts.
    pub fn with_palette_hosts(mut self, hosts: Vec<String>) -> Self {
        self.palette_hosts = Arc::new(hosts);
        self
    }
}

pub async fn build_state(config: &Config) -> Result<AppState> {
    let fetcher = Fetcher::new(config.fetch)?;
    let catalog: Arc<dyn CatalogApi> = Arc::new(VokinoClient::new(
        fetcher.clone(),
        config.base_url.clone(),
        config.token.clone(),
    ));
    if config.token.is_none() {
        warn!("VOKINO_TOKEN not set, upstream requests are anonymous");
    }

    let store: Arc<dyn OverrideStore> = if let Some(url) = &config.overrides_url {
        info!("Reading overrides from {}", url);
        Arc::new(RemoteOverrideStore::new(fetcher.clone(), url.clone()))
    } else if let Some(path) = &config.overrides_path {
        info!("Using override file {}", path.display());
        Arc::new(
            FileOverrideStore::open(path)
                .await
                .with_context(|| format!("Failed to open override file {}", path.display()))?,
        )
    } else {
        warn!("OVERRIDES_PATH not set, overrides are kept in memory only");
        Arc::new(MemoryOverrideStore::new())
    };

    if config.admin_token.is_none() {
        info!("ADMIN_TOKEN not set, override writes are disabled");
    }

    if config.palette_hosts.is_empty() {
        info!("PALETTE_HOSTS not set, palettes may be fetched from any public host");
    }

    Ok(AppState::new(
        catalog,
        store,
        fetcher,
        config.admin_token.clone(),
        config.override_ttl,
    )
    .with_palette_hosts(config.palette_hosts.clone()))
}

pub async fn run_server(config: Config) -> Result<()> {
    let state = build_state(&config).await?;
    let app = build_router(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/search", get(search))
        .route("/api/list", get(list))
        .route("/api/compilations/:id", get(compilation))
        .route("/api/view/:id", get(view))
        .route("/api/overrides/movies", get(overrides_batch))
        .route(
            "/api/overrides/movies/:id",
            get(override_get).put(override_put).delete(override_delete),
        )
        .route("/api/franchise", get(franchise))
        .route("/api/palette", get(palette_for_url))
        .route("/api/home", get(home))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Token cancelled when the handler future is dropped, so upstream calls stop
/// once the client goes away.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    let body = run_search(state.catalog.as_ref(), &params).await?;
    Ok(Json(body))
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let body = no_data_on_decode(state.catalog.list(&query.with_page(page)).await, "list")?;
    list_response(&state, &body, page).await
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: Option<u32>,
}

async fn compilation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let body = no_data_on_decode(state.catalog.compilation(&id, page).await, "compilation")?;
    list_response(&state, &body, page).await
}

async fn list_response(state: &AppState, body: &Value, page: u32) -> Result<Json<Value>, ApiError> {
    let mut records = dedupe_by(parse_list(body), |t| Some(t.id.clone()));
    state.overrides.patch_records(&mut records).await;
    Ok(Json(json!({ "type": "list", "page": page, "channels": records })))
}

async fn view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DetailView>, ApiError> {
    let (cancel, _guard) = request_token();
    let detail = state.details.load(&id, &cancel).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
struct IdsQuery {
    #[serde(default)]
    ids: Option<String>,
}

async fn overrides_batch(
    State(state): State<AppState>,
    Query(query): Query<IdsQuery>,
) -> Result<Json<HashMap<String, Override>>, ApiError> {
    let ids = dedupe_by(
        query
            .ids
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        |id| Some(id.clone()),
    );
    if ids.len() > MAX_BATCH_IDS {
        return Err(ApiError::bad_request(format!(
            "At most {} ids per request",
            MAX_BATCH_IDS
        )));
    }
    let found = state.store.get_many(&ids).await?;
    debug!(requested = ids.len(), found = found.len(), "Override batch lookup");
    Ok(Json(found))
}

async fn override_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Override>, ApiError> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No override for {}", id)))
}

async fn override_put(
    State(state): State<AppState>,
    auth: AdminAuth,
    Path(id): Path<String>,
    Json(patch): Json<Override>,
) -> Result<Json<Override>, ApiError> {
    check_admin(&state, auth)?;
    if patch.is_empty() {
        return Err(ApiError::bad_request("Override patch is empty"));
    }
    state.store.put(&id, patch.clone()).await?;
    state.overrides.invalidate(&id).await;
    info!("Override for {} updated", id);
    Ok(Json(patch))
}

async fn override_delete(
    State(state): State<AppState>,
    auth: AdminAuth,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_admin(&state, auth)?;
    let removed = state.store.delete(&id).await?;
    state.overrides.invalidate(&id).await;
    if !removed {
        return Err(ApiError::not_found(format!("No override for {}", id)));
    }
    info!("Override for {} deleted", id);
    Ok(StatusCode::NO_CONTENT)
}

fn check_admin(state: &AppState, auth: AdminAuth) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::forbidden("Override writes are disabled"));
    };
    match auth {
        Some(TypedHeader(Authorization(bearer)))
            if constant_time_eq(bearer.token().as_bytes(), expected.as_bytes()) =>
        {
            Ok(())
        }
        _ => {
            warn!("Rejected override write with invalid or missing token");
            Err(ApiError::unauthorized())
        }
    }
}

#[derive(Debug, Deserialize)]
struct FranchiseQuery {
    #[serde(default)]
    kinopoisk_id: Option<String>,
}

async fn franchise(
    State(state): State<AppState>,
    Query(query): Query<FranchiseQuery>,
) -> Result<Json<Value>, ApiError> {
    let kp_id = query
        .kinopoisk_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("kinopoisk_id parameter is required"))?;
    let (cancel, _guard) = request_token();
    let body = state.catalog.franchise(kp_id, &cancel).await?;
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct PaletteQuery {
    #[serde(default)]
    url: Option<String>,
}

async fn palette_for_url(
    State(state): State<AppState>,
    Query(query): Query<PaletteQuery>,
) -> Result<Json<Palette>, ApiError> {
    let url = query
        .url
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .ok_or_else(|| ApiError::bad_request("url parameter is required"))?;
    if !palette::is_allowed_image_url(&url, &state.palette_hosts) {
        return Err(ApiError::bad_request("url host is not allowed"));
    }

    if let Some(cached) = state.palettes.read().await.get(&url) {
        return Ok(Json(*cached));
    }
    let palette = palette::extract_from_url(&state.fetcher, &url).await;
    if palette.source != PaletteSource::Default {
        let mut cache = state.palettes.write().await;
        if cache.len() >= MAX_CACHED_PALETTES {
            cache.clear();
        }
        cache.insert(url, palette);
    }
    Ok(Json(palette))
}

async fn home(State(state): State<AppState>) -> Json<Value> {
    let (feed, hero) =
        HomeFeed::load(state.catalog.clone(), state.overrides.clone(), &Category::ALL).await;
    let hero_palette = hero.current_palette(&state.fetcher).await;
    Json(json!({
        "rails": feed.rails,
        "hero": feed.hero,
        "hero_palette": hero_palette,
        "hero_interval_secs": HERO_ROTATE_INTERVAL.as_secs(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
