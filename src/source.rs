use async_trait::async_trait;
use std::sync::Arc;

use crate::catalog::{no_data_on_decode, CatalogApi, ListQuery};
use crate::fetcher::FetchError;
use crate::models::{parse_list, TitleRecord};

/// One paginated upstream list, as consumed by grids and sliders.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Vec<TitleRecord>, FetchError>;
    /// Frontend-style path of the list, used to pick the interaction mode.
    fn path(&self) -> String;
}

pub struct ListSource {
    catalog: Arc<dyn CatalogApi>,
    query: ListQuery,
}

impl ListSource {
    pub fn new(catalog: Arc<dyn CatalogApi>, query: ListQuery) -> Self {
        Self { catalog, query }
    }
}

#[async_trait]
impl PageSource for ListSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<TitleRecord>, FetchError> {
        let body = no_data_on_decode(
            self.catalog.list(&self.query.with_page(page)).await,
            "list",
        )?;
        Ok(parse_list(&body))
    }

    fn path(&self) -> String {
        self.query.path()
    }
}

pub struct CompilationSource {
    catalog: Arc<dyn CatalogApi>,
    id: String,
}

impl CompilationSource {
    pub fn new(catalog: Arc<dyn CatalogApi>, id: impl Into<String>) -> Self {
        Self {
            catalog,
            id: id.into(),
        }
    }
}

#[async_trait]
impl PageSource for CompilationSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<TitleRecord>, FetchError> {
        let body = no_data_on_decode(
            self.catalog.compilation(&self.id, page).await,
            "compilation",
        )?;
        Ok(parse_list(&body))
    }

    fn path(&self) -> String {
        format!("/compilations/content/{}", self.id)
    }
}
