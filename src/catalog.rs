use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::fetcher::{FetchError, Fetcher};
use crate::models::{pick, scalar_string};

/// Query for the upstream `/list` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl ListQuery {
    pub fn new(sort: Option<&str>, kind: Option<&str>, tag: Option<&str>) -> Self {
        Self {
            sort: sort.map(str::to_string),
            kind: kind.map(str::to_string),
            tag: tag.map(str::to_string),
            page: None,
        }
    }

    pub fn with_page(&self, page: u32) -> Self {
        Self {
            page: Some(page),
            ..self.clone()
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(sort) = &self.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(kind) = &self.kind {
            params.push(("type", kind.clone()));
        }
        if let Some(tag) = &self.tag {
            params.push(("tag", tag.clone()));
        }
        params.push(("page", self.page.unwrap_or(1).to_string()));
        params
    }

    /// Path + query as the frontend would request it, e.g. `/list?sort=popular&page=1`.
    pub fn path(&self) -> String {
        format!("/list?{}", encode_params(&self.params()))
    }
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn search(&self, name: &str, page: u32, year: Option<&str>) -> Result<Value, FetchError>;
    async fn view(&self, id: &str, cancel: &CancellationToken) -> Result<Value, FetchError>;
    async fn list(&self, query: &ListQuery) -> Result<Value, FetchError>;
    async fn compilation(&self, id: &str, page: u32) -> Result<Value, FetchError>;
    /// Resolves the Kinopoisk id of a title through the timeline-watch endpoint.
    async fn timeline(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError>;
    async fn franchise(
        &self,
        kinopoisk_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct VokinoClient {
    fetcher: Fetcher,
    base_url: String,
    token: Option<String>,
}

impl VokinoClient {
    pub fn new(fetcher: Fetcher, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = Fetcher::new(config.fetch)?;
        Ok(Self::new(fetcher, config.base_url.clone(), config.token.clone()))
    }

    /// Shared with image downloads so both use one connection pool.
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> String {
        let mut all: Vec<(&str, String)> = params.to_vec();
        if let Some(token) = &self.token {
            all.push(("token", token.clone()));
        }
        if all.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, encode_params(&all))
        }
    }
}

#[async_trait]
impl CatalogApi for VokinoClient {
    async fn search(&self, name: &str, page: u32, year: Option<&str>) -> Result<Value, FetchError> {
        let mut params = vec![("name", name.to_string()), ("page", page.to_string())];
        if let Some(year) = year {
            params.push(("year", year.to_string()));
        }
        self.fetcher.get_json(&self.url("/search", &params)).await
    }

    async fn view(&self, id: &str, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let path = format!("/view/{}", urlencoding::encode(id));
        self.fetcher
            .get_json_cancellable(&self.url(&path, &[]), cancel)
            .await
    }

    async fn list(&self, query: &ListQuery) -> Result<Value, FetchError> {
        self.fetcher
            .get_json(&self.url("/list", &query.params()))
            .await
    }

    async fn compilation(&self, id: &str, page: u32) -> Result<Value, FetchError> {
        let path = format!("/compilations/content/{}", urlencoding::encode(id));
        self.fetcher
            .get_json(&self.url(&path, &[("page", page.to_string())]))
            .await
    }

    async fn timeline(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FetchError> {
        let url = self.url("/timeline/watch", &[("ident", id.to_string())]);
        let body: Value = self.fetcher.get_json_cancellable(&url, cancel).await?;
        Ok(kinopoisk_id(&body))
    }

    async fn franchise(
        &self,
        kinopoisk_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let url = self.url("/franchise", &[("kinopoisk_id", kinopoisk_id.to_string())]);
        self.fetcher.get_json_cancellable(&url, cancel).await
    }
}

/// List-shaped bodies that fail to parse are treated as "no data": the
/// failure is logged and an empty body returned. Other errors pass through.
pub fn no_data_on_decode(
    result: Result<Value, FetchError>,
    what: &str,
) -> Result<Value, FetchError> {
    match result {
        Err(FetchError::Decode(reason)) => {
            warn!("Unparseable {} body treated as empty: {}", what, reason);
            Ok(Value::Null)
        }
        other => other,
    }
}

/// Kinopoisk id from a timeline or view payload, whichever key carries it.
pub fn kinopoisk_id(body: &Value) -> Option<String> {
    pick(
        body,
        &[
            "kinopoisk_id",
            "kp_id",
            "details.kinopoisk_id",
            "details.kp_id",
            "data.kinopoisk_id",
        ],
    )
    .and_then(scalar_string)
    .filter(|id| !id.is_empty() && id != "0")
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::RetryPolicy;
    use serde_json::json;

    fn client(token: Option<&str>) -> VokinoClient {
        VokinoClient::new(
            Fetcher::new(RetryPolicy::default()).unwrap(),
            "https://api.vokino.pro/v2/",
            token.map(str::to_string),
        )
    }

    #[test]
    fn builds_urls_with_token_and_encoding() {
        let c = client(Some("t0k"));
        assert_eq!(
            c.url("/search", &[("name", "матрица 2".to_string()), ("page", "1".to_string())]),
            "https://api.vokino.pro/v2/search?name=%D0%BC%D0%B0%D1%82%D1%80%D0%B8%D1%86%D0%B0%202&page=1&token=t0k"
        );
        assert_eq!(
            client(None).url("/view/1", &[]),
            "https://api.vokino.pro/v2/view/1"
        );
    }

    #[test]
    fn list_query_defaults_to_first_page() {
        let q = ListQuery::new(Some("popular"), Some("movie"), None);
        assert_eq!(q.path(), "/list?sort=popular&type=movie&page=1");
        assert_eq!(q.with_page(3).path(), "/list?sort=popular&type=movie&page=3");
    }

    #[test]
    fn decode_failures_read_as_no_data() {
        let decoded = no_data_on_decode(Err(FetchError::Decode("eof".into())), "list").unwrap();
        assert!(crate::models::parse_list(&decoded).is_empty());
        assert_eq!(
            no_data_on_decode(Err(FetchError::Timeout), "list"),
            Err(FetchError::Timeout)
        );
        assert_eq!(
            no_data_on_decode(Ok(json!([{"id": 1}])), "list").unwrap(),
            json!([{"id": 1}])
        );
    }

    #[test]
    fn kinopoisk_id_from_any_known_key() {
        assert_eq!(kinopoisk_id(&json!({"kinopoisk_id": 301})), Some("301".to_string()));
        assert_eq!(
            kinopoisk_id(&json!({"details": {"kp_id": "42"}})),
            Some("42".to_string())
        );
        assert_eq!(kinopoisk_id(&json!({"kinopoisk_id": 0})), None);
        assert_eq!(kinopoisk_id(&json!({})), None);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory catalog; anything not configured answers 404.
    #[derive(Default)]
    pub(crate) struct FakeCatalog {
        pub views: HashMap<String, Value>,
        pub timelines: HashMap<String, String>,
        pub franchises: HashMap<String, Value>,
        pub lists: HashMap<String, Value>,
        pub search_pages: HashMap<u32, Value>,
        pub failing_search_pages: Vec<u32>,
        pub block_franchise: bool,
        pub search_calls: Mutex<Vec<(String, u32, Option<String>)>>,
        pub franchise_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CatalogApi for FakeCatalog {
        async fn search(
            &self,
            name: &str,
            page: u32,
            year: Option<&str>,
        ) -> Result<Value, FetchError> {
            self.search_calls.lock().unwrap().push((
                name.to_string(),
                page,
                year.map(str::to_string),
            ));
            if self.failing_search_pages.contains(&page) {
                return Err(FetchError::Timeout);
            }
            self.search_pages
                .get(&page)
                .cloned()
                .ok_or(FetchError::Status(404))
        }

        async fn view(&self, id: &str, cancel: &CancellationToken) -> Result<Value, FetchError> {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            self.views.get(id).cloned().ok_or(FetchError::Status(404))
        }

        async fn list(&self, query: &ListQuery) -> Result<Value, FetchError> {
            self.lists
                .get(&query.path())
                .cloned()
                .ok_or(FetchError::Status(404))
        }

        async fn compilation(&self, id: &str, page: u32) -> Result<Value, FetchError> {
            self.lists
                .get(&format!("/compilations/content/{id}?page={page}"))
                .cloned()
                .ok_or(FetchError::Status(404))
        }

        async fn timeline(
            &self,
            id: &str,
            _cancel: &CancellationToken,
        ) -> Result<Option<String>, FetchError> {
            Ok(self.timelines.get(id).cloned())
        }

        async fn franchise(
            &self,
            kinopoisk_id: &str,
            cancel: &CancellationToken,
        ) -> Result<Value, FetchError> {
            self.franchise_calls
                .lock()
                .unwrap()
                .push(kinopoisk_id.to_string());
            if self.block_franchise {
                cancel.cancelled().await;
                return Err(FetchError::Cancelled);
            }
            self.franchises
                .get(kinopoisk_id)
                .cloned()
                .ok_or(FetchError::Status(404))
        }
    }
}
