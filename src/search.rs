use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::catalog::{no_data_on_decode, CatalogApi};
use crate::fetcher::FetchError;
use crate::models::{dedupe_by, item_id, list_items};

pub const SEARCH_FAILED_MESSAGE: &str = "Не удалось загрузить результаты.";
/// Pages fetched in parallel when a year filter is applied to page 1.
pub const YEAR_FANOUT_PAGES: u32 = 3;
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(220);

#[derive(Debug, Error, PartialEq)]
pub enum SearchError {
    #[error("q parameter is required")]
    MissingQuery,
    #[error(transparent)]
    Upstream(#[from] FetchError),
}

/// Query string of `/api/search`. Kept as raw strings so a malformed page
/// number falls back to 1 instead of rejecting the request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
}

impl SearchParams {
    pub fn new(q: &str, page: u32, year: Option<&str>) -> Self {
        Self {
            q: Some(q.to_string()),
            page: Some(page.to_string()),
            year: year.map(str::to_string),
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    pub fn page(&self) -> u32 {
        self.page
            .as_deref()
            .and_then(|p| p.trim().parse().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1)
    }

    pub fn year(&self) -> Option<&str> {
        self.year.as_deref().map(str::trim).filter(|y| !y.is_empty())
    }
}

/// Runs a search against the catalog and returns `{type, channels}` with
/// duplicate titles removed.
///
/// Upstream ignores the year filter on its own, so a year-filtered first page
/// is assembled from pages 1 to [`YEAR_FANOUT_PAGES`] fetched in parallel.
/// That request fails only when every page does.
pub async fn run_search(catalog: &dyn CatalogApi, params: &SearchParams) -> Result<Value, SearchError> {
    let q = params.query().ok_or(SearchError::MissingQuery)?;
    let page = params.page();
    let year = params.year();

    let items: Vec<Value> = match year {
        Some(year) if page == 1 => {
            debug!(q = %q, year = %year, "Fanning out year-filtered search");
            let results = join_all(
                (1..=YEAR_FANOUT_PAGES).map(|p| catalog.search(q, p, Some(year))),
            )
            .await;

            let mut items = Vec::new();
            let mut last_error = None;
            let mut succeeded = 0;
            for (index, result) in results.into_iter().enumerate() {
                match no_data_on_decode(result, "search") {
                    Ok(body) => {
                        succeeded += 1;
                        items.extend(list_items(&body).iter().cloned());
                    }
                    Err(e) => {
                        warn!("Search page {} for '{}' failed: {}", index + 1, q, e);
                        last_error = Some(e);
                    }
                }
            }
            if succeeded == 0 {
                if let Some(e) = last_error {
                    return Err(e.into());
                }
            }
            items
        }
        _ => {
            let body = no_data_on_decode(catalog.search(q, page, year).await, "search")?;
            list_items(&body).to_vec()
        }
    };

    let channels = dedupe_by(items, item_id);
    Ok(json!({ "type": "list", "channels": channels }))
}

/// Search-as-you-type debouncer: only the last query of a burst is emitted,
/// once input has been quiet for the configured delay.
pub struct SearchDebouncer {
    input: mpsc::UnboundedSender<String>,
}

impl SearchDebouncer {
    pub fn spawn(delay: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (input, mut incoming) = mpsc::unbounded_channel::<String>();
        let (output, settled) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut pending: Option<String> = None;
            loop {
                tokio::select! {
                    next = incoming.recv() => match next {
                        Some(query) => pending = Some(query),
                        None => break,
                    },
                    _ = tokio::time::sleep(delay), if pending.is_some() => {
                        if let Some(query) = pending.take() {
                            if output.send(query).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        (Self { input }, settled)
    }

    pub fn push(&self, query: impl Into<String>) -> bool {
        self.input.send(query.into()).is_ok()
    }
}
