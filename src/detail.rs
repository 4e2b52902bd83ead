use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{kinopoisk_id, CatalogApi};
use crate::fetcher::FetchError;
use crate::merge::deep_merge;
use crate::models::TitleRecord;
use crate::overrides::OverrideCache;

/// Everything the detail page shows for one title, overrides already merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailView {
    pub id: String,
    pub title: Value,
    pub kinopoisk_id: Option<String>,
    pub franchise: Option<Value>,
}

impl DetailView {
    pub fn record(&self) -> Option<TitleRecord> {
        let mut record = TitleRecord::from_value(&self.title)?;
        record.id = self.id.clone();
        Some(record)
    }
}

#[derive(Clone)]
pub struct DetailLoader {
    catalog: Arc<dyn CatalogApi>,
    overrides: OverrideCache,
}

impl DetailLoader {
    pub fn new(catalog: Arc<dyn CatalogApi>, overrides: OverrideCache) -> Self {
        Self { catalog, overrides }
    }

    /// Loads title, override, timeline and franchise data for `id`.
    ///
    /// The same token guards every hop of the chain, so cancelling it (the
    /// user moved to another title) aborts whatever request is in flight.
    /// Only a failed title fetch is an error; missing override, timeline or
    /// franchise data just leaves those parts out.
    pub async fn load(&self, id: &str, cancel: &CancellationToken) -> Result<DetailView, FetchError> {
        let (view, patch, timeline) = tokio::join!(
            self.catalog.view(id, cancel),
            self.overrides.resolve_one(id),
            self.catalog.timeline(id, cancel),
        );
        let canonical = view?;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let title = match &patch {
            Some(p) => deep_merge(&canonical, &p.title_patch()),
            None => canonical,
        };

        let kp_id = match timeline {
            Ok(Some(kp)) => Some(kp),
            Ok(None) => kinopoisk_id(&title),
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(e) => {
                warn!("Timeline lookup failed for {}: {}", id, e);
                kinopoisk_id(&title)
            }
        };

        let upstream_franchise = match &kp_id {
            Some(kp) => match self.catalog.franchise(kp, cancel).await {
                Ok(data) => Some(data),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    warn!("Franchise lookup failed for {} (kp {}): {}", id, kp, e);
                    None
                }
            },
            None => {
                debug!(id = %id, "No Kinopoisk id, skipping franchise data");
                None
            }
        };

        let franchise_patch = patch.as_ref().and_then(|p| p.franchise.as_ref());
        let franchise = match (upstream_franchise, franchise_patch) {
            (Some(base), Some(p)) => Some(deep_merge(&base, p)),
            (None, Some(p)) => Some(p.clone()),
            (base, None) => base,
        };

        Ok(DetailView {
            id: id.to_string(),
            title,
            kinopoisk_id: kp_id,
            franchise,
        })
    }
}
