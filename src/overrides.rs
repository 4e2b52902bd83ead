use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::fetcher::Fetcher;
use crate::models::{person_names, TitleRecord};

/// Sparse per-title patch. A present field always wins over upstream data;
/// an absent one means "no opinion", never "clear the field".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Override {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backdrop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_colors: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub studio_logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub franchise: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Override {
    pub fn is_empty(&self) -> bool {
        *self == Override::default()
    }

    /// Patch for the title body: everything except the nested `franchise`.
    pub fn title_patch(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("franchise");
        }
        value
    }
}

/// Applies the card-level fields of an override to a list record.
pub fn apply_override(record: &mut TitleRecord, patch: &Override) {
    if let Some(poster) = &patch.poster {
        record.poster = Some(poster.clone());
    }
    if let Some(name) = &patch.name {
        record.name = name.clone();
    }
    if let Some(backdrop) = &patch.backdrop {
        record.backdrop = Some(backdrop.clone());
    }
    if let Some(cast) = &patch.cast {
        let names = person_names(cast);
        if !names.is_empty() {
            record.cast = names;
        }
    }
    let branding = [
        ("poster_logo", patch.poster_logo.clone().map(Value::String)),
        ("studio_logo", patch.studio_logo.clone().map(Value::String)),
        ("poster_colors", patch.poster_colors.clone()),
        ("franchise", patch.franchise.clone()),
    ];
    for (key, value) in branding {
        if let Some(value) = value {
            record.extra.insert(key.to_string(), value);
        }
    }
}

#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// Returns the overrides known for `ids`; unknown ids are simply absent.
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Override>>;
    async fn put(&self, id: &str, patch: Override) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<Override>> {
        let mut found = self.get_many(&[id.to_string()]).await?;
        Ok(found.remove(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryOverrideStore {
    entries: RwLock<HashMap<String, Override>>,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, Override>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl OverrideStore for MemoryOverrideStore {
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Override>> {
        let guard = self.entries.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.get(id).map(|o| (id.clone(), o.clone())))
            .collect())
    }

    async fn put(&self, id: &str, patch: Override) -> Result<()> {
        self.entries.write().await.insert(id.to_string(), patch);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(id).is_some())
    }
}

/// Overrides kept in a single JSON object on disk, `{ "<id>": { ... } }`.
/// The whole file is rewritten on every change.
#[derive(Debug)]
pub struct FileOverrideStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Override>>,
}

impl FileOverrideStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: HashMap<String, Override> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid overrides file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Overrides file {} not found, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        info!(
            "Loaded {} overrides from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, Override>) -> Result<()> {
        let body = serde_json::to_vec_pretty(entries).context("Failed to encode overrides")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }
}

#[async_trait]
impl OverrideStore for FileOverrideStore {
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Override>> {
        let guard = self.entries.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.get(id).map(|o| (id.clone(), o.clone())))
            .collect())
    }

    async fn put(&self, id: &str, patch: Override) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.insert(id.to_string(), patch);
        self.persist(&guard).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut guard = self.entries.write().await;
        let removed = guard.remove(id).is_some();
        if removed {
            self.persist(&guard).await?;
        }
        Ok(removed)
    }
}

/// Read-only client for another instance's `/api/overrides/movies` routes.
#[derive(Debug, Clone)]
pub struct RemoteOverrideStore {
    fetcher: Fetcher,
    base_url: String,
}

impl RemoteOverrideStore {
    pub fn new(fetcher: Fetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl OverrideStore for RemoteOverrideStore {
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Override>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let csv = ids.join(",");
        let url = format!(
            "{}/api/overrides/movies?ids={}",
            self.base_url,
            urlencoding::encode(&csv)
        );
        self.fetcher
            .get_json(&url)
            .await
            .map_err(|e| anyhow!("Override service request failed: {}", e))
    }

    async fn put(&self, _id: &str, _patch: Override) -> Result<()> {
        Err(anyhow!("Remote override store is read-only"))
    }

    async fn delete(&self, _id: &str) -> Result<bool> {
        Err(anyhow!("Remote override store is read-only"))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<Override>,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped on every invalidation; a batch started under an older
    /// generation may hold stale data and is not cached.
    generation: u64,
}

/// Shared override cache handed to every grid, slider and detail loader.
///
/// Lookups are batched: all ids missing from the cache go to the store in one
/// `get_many` call. Ids without an override are remembered as such so they
/// are not requested again until the entry expires or is invalidated.
#[derive(Clone)]
pub struct OverrideCache {
    store: Arc<dyn OverrideStore>,
    ttl: Duration,
    state: Arc<RwLock<CacheState>>,
}

impl OverrideCache {
    pub fn new(store: Arc<dyn OverrideStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    pub async fn resolve(&self, ids: &[String]) -> HashMap<String, Override> {
        let now = Instant::now();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        let generation = {
            let guard = self.state.read().await;
            for id in ids {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                match guard.entries.get(id) {
                    Some(entry) if now.duration_since(entry.fetched_at) < self.ttl => {
                        if let Some(value) = &entry.value {
                            found.insert(id.clone(), value.clone());
                        }
                    }
                    _ => missing.push(id.clone()),
                }
            }
            guard.generation
        };
        if missing.is_empty() {
            return found;
        }

        debug!(count = missing.len(), "Fetching overrides batch");
        match self.store.get_many(&missing).await {
            Ok(mut fetched) => {
                let mut guard = self.state.write().await;
                let cacheable = guard.generation == generation;
                if !cacheable {
                    debug!("Overrides changed during lookup, not caching batch");
                }
                let fetched_at = Instant::now();
                for id in missing {
                    let value = fetched.remove(&id);
                    if let Some(v) = &value {
                        found.insert(id.clone(), v.clone());
                    }
                    if cacheable {
                        guard.entries.insert(id, CacheEntry { value, fetched_at });
                    }
                }
            }
            Err(e) => warn!("Override lookup failed for {} ids: {}", missing.len(), e),
        }
        found
    }

    pub async fn resolve_one(&self, id: &str) -> Option<Override> {
        self.resolve(&[id.to_string()]).await.remove(id)
    }

    /// Resolves every record's override in one batch and applies it in place.
    pub async fn patch_records(&self, records: &mut [TitleRecord]) {
        if records.is_empty() {
            return;
        }
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let overrides = self.resolve(&ids).await;
        for record in records.iter_mut() {
            if let Some(patch) = overrides.get(&record.id) {
                apply_override(record, patch);
            }
        }
    }

    /// Drops one id, e.g. after its override changed.
    pub async fn invalidate(&self, id: &str) {
        let mut guard = self.state.write().await;
        guard.entries.remove(id);
        guard.generation += 1;
    }

    pub async fn clear(&self) {
        let mut guard = self.state.write().await;
        guard.entries.clear();
        guard.generation += 1;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}
