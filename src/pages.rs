use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fetcher::FetchError;
use crate::models::TitleRecord;
use crate::overrides::OverrideCache;
use crate::source::PageSource;

pub const LOAD_ERROR_MESSAGE: &str = "Ошибка загрузки данных";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CachedPage {
    pub page: u32,
    pub data: Vec<TitleRecord>,
}

/// Pages fetched for one list, kept sorted by page number.
///
/// Pages may be fetched in any order (prefetching runs ahead of the user) but
/// are always read back in page order, de-duplicated by id with the first
/// occurrence winning. An empty page marks the end of the list.
pub struct PageBuffer {
    source: Arc<dyn PageSource>,
    overrides: OverrideCache,
    pages: Vec<CachedPage>,
    reached_end: bool,
    status: LoadStatus,
}

impl PageBuffer {
    pub fn new(source: Arc<dyn PageSource>, overrides: OverrideCache) -> Self {
        Self {
            source,
            overrides,
            pages: Vec::new(),
            reached_end: false,
            status: LoadStatus::Idle,
        }
    }

    pub fn path(&self) -> String {
        self.source.path()
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn has_more(&self) -> bool {
        !self.reached_end
    }

    pub fn pages(&self) -> &[CachedPage] {
        &self.pages
    }

    pub fn has_page(&self, page: u32) -> bool {
        self.pages.iter().any(|p| p.page == page)
    }

    /// Lowest page number not fetched yet.
    pub fn next_missing_page(&self) -> u32 {
        let mut page = 1;
        while self.has_page(page) {
            page += 1;
        }
        page
    }

    /// Fetches one page unless it is already present. Returns whether new
    /// unique titles became visible.
    pub async fn load_page(&mut self, page: u32) -> bool {
        if self.has_page(page) {
            return false;
        }
        let result = self.source.fetch_page(page).await;
        self.store(page, result).await
    }

    pub async fn load_next(&mut self) -> bool {
        if self.reached_end {
            return false;
        }
        let page = self.next_missing_page();
        self.load_page(page).await
    }

    /// Fetches the next `count` missing pages concurrently. Returns the number
    /// of pages that added titles.
    pub async fn prefetch(&mut self, count: u32) -> usize {
        if self.reached_end || count == 0 {
            return 0;
        }
        let mut wanted = Vec::new();
        let mut page = self.next_missing_page();
        while wanted.len() < count as usize {
            if !self.has_page(page) {
                wanted.push(page);
            }
            page += 1;
        }
        debug!(path = %self.source.path(), pages = ?wanted, "Prefetching pages");

        let results = join_all(wanted.into_iter().map(|page| {
            let source = self.source.clone();
            async move { (page, source.fetch_page(page).await) }
        }))
        .await;

        let mut added = 0;
        for (page, result) in results {
            if self.store(page, result).await {
                added += 1;
            }
        }
        added
    }

    async fn store(&mut self, page: u32, result: Result<Vec<TitleRecord>, FetchError>) -> bool {
        match result {
            Ok(mut data) => {
                if self.has_page(page) {
                    return false;
                }
                if data.is_empty() {
                    debug!(path = %self.source.path(), page, "Reached end of list");
                    self.reached_end = true;
                }
                self.overrides.patch_records(&mut data).await;
                let before = self.len();
                let at = self.pages.partition_point(|p| p.page < page);
                self.pages.insert(at, CachedPage { page, data });
                self.status = LoadStatus::Ready;
                self.len() > before
            }
            Err(err) if self.pages.is_empty() => {
                warn!("Failed to load {} page {}: {}", self.source.path(), page, err);
                self.status = LoadStatus::Failed(LOAD_ERROR_MESSAGE.to_string());
                false
            }
            Err(err) => {
                debug!(
                    "Ignoring failed page {} of {} with data present: {}",
                    page,
                    self.source.path(),
                    err
                );
                false
            }
        }
    }

    /// Unique titles of every page, grouped per page in page order.
    pub fn page_items(&self) -> Vec<Vec<TitleRecord>> {
        let mut seen = HashSet::new();
        self.pages
            .iter()
            .map(|p| {
                p.data
                    .iter()
                    .filter(|t| seen.insert(t.id.as_str()))
                    .cloned()
                    .collect()
            })
            .collect()
    }

    pub fn items(&self) -> Vec<TitleRecord> {
        self.page_items().into_iter().flatten().collect()
    }

    pub fn len(&self) -> usize {
        let mut seen = HashSet::new();
        self.pages
            .iter()
            .flat_map(|p| p.data.iter())
            .filter(|t| seen.insert(t.id.as_str()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.items().iter().position(|t| t.id == id)
    }
}
