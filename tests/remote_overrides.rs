//! One instance reading overrides from another over HTTP.

use cinerails::app::{build_router, AppState};
use cinerails::catalog::{CatalogApi, ListQuery};
use cinerails::fetcher::{FetchError, Fetcher, RetryPolicy};
use cinerails::overrides::{
    MemoryOverrideStore, Override, OverrideCache, OverrideStore, RemoteOverrideStore,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct EmptyCatalog;

#[async_trait::async_trait]
impl CatalogApi for EmptyCatalog {
    async fn search(&self, _name: &str, _page: u32, _year: Option<&str>) -> Result<Value, FetchError> {
        Ok(json!([]))
    }
    async fn view(&self, _id: &str, _cancel: &CancellationToken) -> Result<Value, FetchError> {
        Err(FetchError::Status(404))
    }
    async fn list(&self, _query: &ListQuery) -> Result<Value, FetchError> {
        Ok(json!([]))
    }
    async fn compilation(&self, _id: &str, _page: u32) -> Result<Value, FetchError> {
        Ok(json!([]))
    }
    async fn timeline(
        &self,
        _id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError> {
        Ok(None)
    }
    async fn franchise(
        &self,
        _kinopoisk_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        Err(FetchError::Status(404))
    }
}

fn fetcher() -> Fetcher {
    Fetcher::new(RetryPolicy {
        timeout: Duration::from_secs(2),
        retries: 1,
    })
    .unwrap()
}

async fn serve_overrides(entries: HashMap<String, Override>) -> String {
    let state = AppState::new(
        Arc::new(EmptyCatalog),
        Arc::new(MemoryOverrideStore::with_entries(entries)),
        fetcher(),
        None,
        Duration::from_secs(60),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn remote_store_reads_batched_overrides() {
    let patch: Override = serde_json::from_value(json!({
        "poster": "remote.jpg",
        "poster_colors": ["#101010", "#202020"]
    }))
    .unwrap();
    let base = serve_overrides(HashMap::from([("7".to_string(), patch.clone())])).await;

    let remote = Arc::new(RemoteOverrideStore::new(fetcher(), base));
    let found = remote
        .get_many(&["7".to_string(), "8".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.get("7"), Some(&patch));

    let cache = OverrideCache::new(remote.clone(), Duration::from_secs(60));
    assert_eq!(
        cache.resolve_one("7").await.and_then(|o| o.poster),
        Some("remote.jpg".to_string())
    );
    assert!(cache.resolve_one("8").await.is_none());
}

#[tokio::test]
async fn remote_store_is_read_only() {
    let base = serve_overrides(HashMap::new()).await;
    let remote = RemoteOverrideStore::new(fetcher(), base);
    assert!(remote.put("1", Override::default()).await.is_err());
    assert!(remote.delete("1").await.is_err());
}
