use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogApi, ListQuery};
use crate::fetcher::Fetcher;
use crate::models::{dedupe_by, TitleRecord};
use crate::overrides::OverrideCache;
use crate::pages::LoadStatus;
use crate::palette::{self, Palette, DEFAULT_PALETTE};
use crate::slider::{MovieSlider, SliderOptions};
use crate::source::ListSource;

pub const HERO_ROTATE_INTERVAL: Duration = Duration::from_secs(8);
pub const HERO_LIMIT: usize = 10;
const RAIL_AUTOPLAY: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Trending,
    Movies,
    Serials,
    Premieres,
    Uhd4k,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Trending,
        Category::Movies,
        Category::Serials,
        Category::Premieres,
        Category::Uhd4k,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Category::Trending => "В тренде",
            Category::Movies => "Фильмы",
            Category::Serials => "Сериалы",
            Category::Premieres => "Премьеры",
            Category::Uhd4k => "4K UHD",
        }
    }

    pub fn query(&self) -> ListQuery {
        match self {
            Category::Trending => ListQuery::new(Some("popular"), None, None),
            Category::Movies => ListQuery::new(Some("popular"), Some("movie"), None),
            Category::Serials => ListQuery::new(Some("popular"), Some("serial"), None),
            Category::Premieres => ListQuery::new(Some("new"), None, None),
            Category::Uhd4k => ListQuery::new(Some("popular"), None, Some("4k")),
        }
    }

    pub fn slider_options(&self) -> SliderOptions {
        SliderOptions {
            autoplay: matches!(self, Category::Trending).then_some(RAIL_AUTOPLAY),
            loop_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Rail {
    pub category: Category,
    pub title: &'static str,
    pub path: String,
    pub items: Vec<TitleRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeroSlide {
    pub id: String,
    pub name: String,
    pub backdrop: String,
}

/// Rotating hero backdrop, fed from titles that have a wide image.
#[derive(Debug, Clone, Default)]
pub struct HeroRotator {
    slides: Vec<HeroSlide>,
    index: usize,
}

impl HeroRotator {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a TitleRecord>) -> Self {
        let slides = items.into_iter().filter_map(|t| {
            t.backdrop.as_ref().map(|backdrop| HeroSlide {
                id: t.id.clone(),
                name: t.name.clone(),
                backdrop: backdrop.clone(),
            })
        });
        let mut slides = dedupe_by(slides, |s| Some(s.id.clone()));
        slides.truncate(HERO_LIMIT);
        Self { slides, index: 0 }
    }

    pub fn slides(&self) -> &[HeroSlide] {
        &self.slides
    }

    pub fn current(&self) -> Option<&HeroSlide> {
        self.slides.get(self.index)
    }

    pub fn advance(&mut self) -> Option<&HeroSlide> {
        if !self.slides.is_empty() {
            self.index = (self.index + 1) % self.slides.len();
        }
        self.current()
    }

    /// Points every slider at the current hero title.
    pub fn sync(&self, sliders: &mut [MovieSlider]) {
        if let Some(slide) = self.current() {
            for slider in sliders {
                slider.sync_active(&slide.id);
            }
        }
    }

    pub async fn current_palette(&self, fetcher: &Fetcher) -> Palette {
        match self.current() {
            Some(slide) => palette::extract_from_url(fetcher, &slide.backdrop).await,
            None => DEFAULT_PALETTE,
        }
    }
}

/// Advances the hero every `period` and points `sliders` at the new title
/// until `cancel` fires.
pub fn spawn_rotation(
    hero: Arc<Mutex<HeroRotator>>,
    sliders: Arc<Mutex<Vec<MovieSlider>>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Hero rotation stopped");
                    break;
                }
                _ = interval.tick() => {
                    let mut hero = hero.lock().await;
                    hero.advance();
                    hero.sync(&mut sliders.lock().await);
                }
            }
        }
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HomeFeed {
    pub rails: Vec<Rail>,
    pub hero: Vec<HeroSlide>,
}

impl HomeFeed {
    /// Loads the first page of every category rail concurrently. A failing
    /// rail is returned empty with its error message.
    pub async fn load(
        catalog: Arc<dyn CatalogApi>,
        overrides: OverrideCache,
        categories: &[Category],
    ) -> (Self, HeroRotator) {
        let mut sliders: Vec<(Category, MovieSlider)> = categories
            .iter()
            .map(|category| {
                let source = Arc::new(ListSource::new(catalog.clone(), category.query()));
                let slider = MovieSlider::new(source, overrides.clone(), category.slider_options());
                (*category, slider)
            })
            .collect();
        join_all(sliders.iter_mut().map(|(_, slider)| slider.load())).await;

        let rails: Vec<Rail> = sliders
            .iter()
            .map(|(category, slider)| {
                let error = match slider.status() {
                    LoadStatus::Failed(message) => {
                        warn!("Home rail {:?} failed to load", category);
                        Some(message.clone())
                    }
                    _ => None,
                };
                Rail {
                    category: *category,
                    title: category.title(),
                    path: category.query().path(),
                    items: slider.items(),
                    error,
                }
            })
            .collect();

        let rotator = HeroRotator::from_items(rails.iter().flat_map(|r| r.items.iter()));
        info!(
            rails = rails.len(),
            hero = rotator.slides().len(),
            "Loaded home feed"
        );
        let feed = Self {
            hero: rotator.slides().to_vec(),
            rails,
        };
        (feed, rotator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::FakeCatalog;
    use crate::overrides::MemoryOverrideStore;
    use crate::pages::LOAD_ERROR_MESSAGE;
    use crate::source::testing::{title, ScriptedSource};
    use serde_json::json;

    fn cache() -> OverrideCache {
        OverrideCache::new(Arc::new(MemoryOverrideStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn categories_map_to_list_queries() {
        assert_eq!(
            Category::Movies.query().path(),
            "/list?sort=popular&type=movie&page=1"
        );
        assert_eq!(
            Category::Uhd4k.query().path(),
            "/list?sort=popular&tag=4k&page=1"
        );
        assert_eq!(Category::Serials.title(), "Сериалы");
        assert!(Category::Trending.slider_options().autoplay.is_some());
    }

    #[test]
    fn hero_keeps_unique_backdrops_and_wraps() {
        let mut no_backdrop = title("x");
        no_backdrop.backdrop = None;
        let items = vec![title("a"), no_backdrop, title("b"), title("a")];
        let mut hero = HeroRotator::from_items(&items);

        let ids: Vec<&str> = hero.slides().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hero.current().unwrap().backdrop, "https://img/a-wide.jpg");
        assert_eq!(hero.advance().unwrap().id, "b");
        assert_eq!(hero.advance().unwrap().id, "a");
    }

    #[test]
    fn hero_is_capped() {
        let items: Vec<TitleRecord> = (0..15).map(|i| title(&i.to_string())).collect();
        assert_eq!(HeroRotator::from_items(&items).slides().len(), HERO_LIMIT);
    }

    #[tokio::test]
    async fn home_feed_loads_every_rail() {
        let mut catalog = FakeCatalog::default();
        catalog.lists.insert(
            Category::Trending.query().with_page(1).path(),
            json!({"type": "list", "channels": [
                {"id": "1", "name": "Один", "backdrop": "https://img/1.jpg"},
                {"id": "1", "name": "Один"},
                {"id": "2", "name": "Два"}
            ]}),
        );
        catalog.lists.insert(
            Category::Movies.query().with_page(1).path(),
            json!([{"id": "3", "name": "Три", "backdrop": "https://img/3.jpg"}]),
        );

        let (feed, mut hero) = HomeFeed::load(
            Arc::new(catalog),
            cache(),
            &[Category::Trending, Category::Movies, Category::Serials],
        )
        .await;

        assert_eq!(feed.rails.len(), 3);
        assert_eq!(feed.rails[0].items.len(), 2);
        assert_eq!(feed.rails[1].items[0].id, "3");
        assert_eq!(feed.rails[2].error.as_deref(), Some(LOAD_ERROR_MESSAGE));
        assert_eq!(feed.hero.len(), 2);
        assert_eq!(hero.advance().unwrap().id, "3");
    }

    #[tokio::test]
    async fn hero_sync_moves_sliders() {
        let mut catalog = FakeCatalog::default();
        catalog.lists.insert(
            Category::Trending.query().path(),
            json!([{"id": "1", "name": "Один"}, {"id": "2", "name": "Два", "backdrop": "b.jpg"}]),
        );
        let catalog: Arc<dyn CatalogApi> = Arc::new(catalog);
        let source = Arc::new(ListSource::new(catalog, Category::Trending.query()));
        let mut sliders = vec![MovieSlider::new(source, cache(), SliderOptions::default())];
        sliders[0].load().await;

        let hero = HeroRotator::from_items(&sliders[0].items());
        hero.sync(&mut sliders);
        assert_eq!(sliders[0].index(), 1);
    }

    #[tokio::test]
    async fn rotation_advances_hero_and_follows_with_sliders() {
        let ids: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let source = Arc::new(ScriptedSource::new(&[(1, &id_refs[..])]));
        let mut slider = MovieSlider::new(source, cache(), SliderOptions::default());
        slider.load().await;

        let hero = Arc::new(Mutex::new(HeroRotator::from_items(&slider.items())));
        let sliders = Arc::new(Mutex::new(vec![slider]));
        let cancel = CancellationToken::new();
        let task = spawn_rotation(
            hero.clone(),
            sliders.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        let current = hero.lock().await.current().unwrap().id.clone();
        assert_ne!(current, "0");
        let sliders = sliders.lock().await;
        assert_eq!(sliders[0].current().unwrap().id, current);
    }
}
