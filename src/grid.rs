use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::detail::{DetailLoader, DetailView};
use crate::fetcher::FetchError;
use crate::models::TitleRecord;
use crate::overrides::OverrideCache;
use crate::pages::{LoadStatus, PageBuffer};
use crate::source::PageSource;

pub const CHUNK_SIZE: usize = 5;
pub const DEFAULT_PREFETCH_AHEAD: u32 = 2;
const ARROW_PATHS: [&str; 2] = ["/list?", "/compilations/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridOptions {
    pub arrow_mode: bool,
    /// Pages fetched ahead after the first load and whenever the last loaded
    /// chunk is reached (1 or 2).
    pub prefetch_ahead: u32,
}

impl GridOptions {
    /// Arrow mode is a desktop-only affordance for list and compilation pages.
    pub fn for_path(path: &str, desktop: bool) -> Self {
        Self {
            arrow_mode: desktop && ARROW_PATHS.iter().any(|p| path.contains(p)),
            prefetch_ahead: DEFAULT_PREFETCH_AHEAD,
        }
    }

    pub fn with_prefetch(self, pages: u32) -> Self {
        Self {
            prefetch_ahead: pages.clamp(1, 2),
            ..self
        }
    }
}

/// Inline info panel opened from a tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub id: String,
    pub detail: Option<DetailView>,
    pub error: Option<String>,
}

/// Detail fetch started by opening the overlay. Runs outside the grid so a
/// newer selection can cancel it while it is in flight.
pub struct DetailRequest {
    id: String,
    cancel: CancellationToken,
    loader: DetailLoader,
}

impl DetailRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(self) -> (String, Result<DetailView, FetchError>) {
        let result = self.loader.load(&self.id, &self.cancel).await;
        (self.id, result)
    }
}

pub struct MovieGrid {
    buffer: PageBuffer,
    options: GridOptions,
    chunk: usize,
    overlay: Option<Overlay>,
    overlay_cancel: Option<CancellationToken>,
    details: Option<DetailLoader>,
    detail_cache: HashMap<String, DetailView>,
}

impl MovieGrid {
    pub fn new(source: Arc<dyn PageSource>, overrides: OverrideCache, options: GridOptions) -> Self {
        Self {
            buffer: PageBuffer::new(source, overrides),
            options,
            chunk: 0,
            overlay: None,
            overlay_cancel: None,
            details: None,
            detail_cache: HashMap::new(),
        }
    }

    pub fn with_details(mut self, loader: DetailLoader) -> Self {
        self.details = Some(loader);
        self
    }

    pub fn options(&self) -> GridOptions {
        self.options
    }

    pub fn status(&self) -> &LoadStatus {
        self.buffer.status()
    }

    pub fn error_message(&self) -> Option<&str> {
        match self.buffer.status() {
            LoadStatus::Failed(message) => Some(message),
            _ => None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.buffer.has_more()
    }

    pub fn items(&self) -> Vec<TitleRecord> {
        self.buffer.items()
    }

    /// Loads page 1. In arrow mode the next pages are fetched right away so
    /// stepping across chunk boundaries never waits on the network.
    pub async fn load_initial(&mut self) -> bool {
        let loaded = self.buffer.load_page(1).await;
        if loaded && self.options.arrow_mode {
            self.buffer.prefetch(self.options.prefetch_ahead).await;
        }
        loaded
    }

    /// Appends the next page. No-op once an empty page has been seen.
    pub async fn load_more(&mut self) -> bool {
        self.buffer.load_next().await
    }

    pub async fn prefetch(&mut self, pages: u32) -> usize {
        self.buffer.prefetch(pages).await
    }

    /// Each page split into chunks of [`CHUNK_SIZE`], in page order.
    pub fn chunks(&self) -> Vec<Vec<TitleRecord>> {
        self.buffer
            .page_items()
            .iter()
            .flat_map(|page| page.chunks(CHUNK_SIZE).map(<[TitleRecord]>::to_vec))
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks().len()
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk
    }

    pub fn current_chunk(&self) -> Vec<TitleRecord> {
        self.chunks().into_iter().nth(self.chunk).unwrap_or_default()
    }

    pub async fn next_chunk(&mut self) -> bool {
        if !self.options.arrow_mode {
            return false;
        }
        while self.chunk + 1 >= self.chunk_count() {
            if !self.fetch_more().await {
                return false;
            }
        }
        self.chunk += 1;
        if self.chunk + 1 == self.chunk_count() && self.buffer.has_more() {
            let added = self.buffer.prefetch(self.options.prefetch_ahead).await;
            debug!(chunk = self.chunk, added, "Prefetched ahead of last chunk");
        }
        true
    }

    pub fn prev_chunk(&mut self) -> bool {
        if !self.options.arrow_mode || self.chunk == 0 {
            return false;
        }
        self.chunk -= 1;
        true
    }

    /// Loads pages until one adds data. False once the list is exhausted or a
    /// fetch fails.
    async fn fetch_more(&mut self) -> bool {
        while self.buffer.has_more() {
            let before = self.buffer.pages().len();
            if self.buffer.load_next().await {
                return true;
            }
            if self.buffer.pages().len() == before {
                return false;
            }
        }
        false
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    /// Opens the overlay on `id`, cancelling any detail fetch still running
    /// for the previous selection. Returns the fetch to run when details are
    /// not cached yet.
    pub fn select(&mut self, id: &str) -> Option<DetailRequest> {
        let position = self.buffer.position_of(id)?;
        self.follow_chunk(position);
        if let Some(token) = self.overlay_cancel.take() {
            token.cancel();
        }

        let cached = self.detail_cache.get(id).cloned();
        let needs_fetch = cached.is_none();
        self.overlay = Some(Overlay {
            id: id.to_string(),
            detail: cached,
            error: None,
        });

        let loader = self.details.clone().filter(|_| needs_fetch)?;
        let cancel = CancellationToken::new();
        self.overlay_cancel = Some(cancel.clone());
        Some(DetailRequest {
            id: id.to_string(),
            cancel,
            loader,
        })
    }

    /// Stores a finished detail fetch. Results for a selection that is no
    /// longer open are dropped.
    pub fn apply_detail(&mut self, id: &str, result: Result<DetailView, FetchError>) -> bool {
        let Some(overlay) = self.overlay.as_mut().filter(|o| o.id == id) else {
            debug!(id = %id, "Dropping detail for closed overlay");
            return false;
        };
        match result {
            Ok(detail) => {
                self.detail_cache.insert(id.to_string(), detail.clone());
                overlay.detail = Some(detail);
                overlay.error = None;
            }
            Err(FetchError::Cancelled) => return false,
            Err(err) => {
                warn!("Detail fetch failed for {}: {}", id, err);
                overlay.error = Some(err.to_string());
            }
        }
        self.overlay_cancel = None;
        true
    }

    /// `select` followed by the detail fetch, for callers that do not need to
    /// interleave other work.
    pub async fn open(&mut self, id: &str) -> bool {
        if let Some(request) = self.select(id) {
            let (id, result) = request.run().await;
            self.apply_detail(&id, result);
        }
        self.overlay.as_ref().is_some_and(|o| o.id == id)
    }

    /// Steps the overlay to the next title, crossing chunk and page
    /// boundaries. Loads the next page when the last loaded title is open.
    pub async fn overlay_next(&mut self) -> Option<DetailRequest> {
        let current = self.overlay.as_ref()?.id.clone();
        let position = self.buffer.position_of(&current)?;
        if position + 1 >= self.buffer.len() && !self.fetch_more().await {
            return None;
        }
        let next = self.buffer.items().get(position + 1)?.id.clone();
        self.select(&next)
    }

    pub fn overlay_prev(&mut self) -> Option<DetailRequest> {
        let current = self.overlay.as_ref()?.id.clone();
        let position = self.buffer.position_of(&current)?.checked_sub(1)?;
        let prev = self.buffer.items().get(position)?.id.clone();
        self.select(&prev)
    }

    pub fn close_overlay(&mut self) {
        if let Some(token) = self.overlay_cancel.take() {
            token.cancel();
        }
        self.overlay = None;
    }

    fn follow_chunk(&mut self, position: usize) {
        let mut start = 0;
        for (index, chunk) in self.chunks().iter().enumerate() {
            if position < start + chunk.len() {
                self.chunk = index;
                return;
            }
            start += chunk.len();
        }
    }
}
