use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::TitleRecord;
use crate::overrides::OverrideCache;
use crate::pages::{LoadStatus, PageBuffer};
use crate::source::PageSource;

/// Minimum spacing between hover updates, one display frame.
pub const HOVER_THROTTLE: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliderOptions {
    pub autoplay: Option<Duration>,
    pub loop_mode: bool,
}

/// Carousel over one paginated list.
pub struct MovieSlider {
    buffer: PageBuffer,
    options: SliderOptions,
    index: usize,
    hovered: bool,
    dragging: bool,
    pending_active: Option<String>,
    hovered_item: Option<String>,
    last_hover_at: Option<Instant>,
}

impl MovieSlider {
    pub fn new(source: Arc<dyn PageSource>, overrides: OverrideCache, options: SliderOptions) -> Self {
        Self {
            buffer: PageBuffer::new(source, overrides),
            options,
            index: 0,
            hovered: false,
            dragging: false,
            pending_active: None,
            hovered_item: None,
            last_hover_at: None,
        }
    }

    pub fn options(&self) -> SliderOptions {
        self.options
    }

    pub fn status(&self) -> &LoadStatus {
        self.buffer.status()
    }

    pub fn items(&self) -> Vec<TitleRecord> {
        self.buffer.items()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<TitleRecord> {
        self.buffer.items().into_iter().nth(self.index)
    }

    pub async fn load(&mut self) -> bool {
        let loaded = self.buffer.load_page(1).await;
        self.apply_pending();
        loaded
    }

    pub async fn load_more(&mut self) -> bool {
        let loaded = self.buffer.load_next().await;
        self.apply_pending();
        loaded
    }

    pub fn is_paused(&self) -> bool {
        self.hovered || self.dragging
    }

    /// One autoplay step. Does nothing without autoplay or while paused.
    pub async fn tick(&mut self) -> bool {
        if self.options.autoplay.is_none() || self.is_paused() {
            return false;
        }
        self.next().await
    }

    pub async fn next(&mut self) -> bool {
        if self.index + 1 < self.len() {
            self.index += 1;
            return true;
        }
        if self.buffer.has_more() && self.load_more().await && self.index + 1 < self.len() {
            self.index += 1;
            return true;
        }
        if self.options.loop_mode && self.index > 0 {
            self.index = 0;
            return true;
        }
        false
    }

    pub fn prev(&mut self) -> bool {
        if self.index > 0 {
            self.index -= 1;
            return true;
        }
        if self.options.loop_mode && self.len() > 1 {
            self.index = self.len() - 1;
            return true;
        }
        false
    }

    pub fn set_hover(&mut self, hovered: bool) {
        self.hovered = hovered;
    }

    pub fn begin_drag(&mut self) {
        self.dragging = true;
    }

    pub fn end_drag(&mut self) {
        self.dragging = false;
        self.apply_pending();
    }

    /// Moves to `id` once it is loaded and the user is not dragging; until
    /// then the request stays pending.
    pub fn sync_active(&mut self, id: &str) -> bool {
        self.pending_active = Some(id.to_string());
        self.apply_pending()
    }

    pub fn pending_active(&self) -> Option<&str> {
        self.pending_active.as_deref()
    }

    fn apply_pending(&mut self) -> bool {
        if self.dragging {
            return false;
        }
        let Some(id) = self.pending_active.as_deref() else {
            return false;
        };
        match self.buffer.position_of(id) {
            Some(position) => {
                debug!(id = %id, position, "Syncing slider to active item");
                self.index = position;
                self.pending_active = None;
                true
            }
            None => false,
        }
    }

    /// Records the hovered tile, at most once per [`HOVER_THROTTLE`].
    pub fn hover_item(&mut self, id: &str, now: Instant) -> bool {
        if let Some(last) = self.last_hover_at {
            if now.saturating_duration_since(last) < HOVER_THROTTLE {
                return false;
            }
        }
        self.last_hover_at = Some(now);
        self.hovered_item = Some(id.to_string());
        true
    }

    pub fn hovered_item(&self) -> Option<&str> {
        self.hovered_item.as_deref()
    }
}

/// Drives autoplay until `cancel` fires. Returns `None` when the slider has
/// no autoplay interval.
pub async fn spawn_autoplay(
    slider: Arc<Mutex<MovieSlider>>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = slider.lock().await.options().autoplay?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Slider autoplay stopped");
                    break;
                }
                _ = interval.tick() => {
                    slider.lock().await.tick().await;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::MemoryOverrideStore;
    use crate::source::testing::ScriptedSource;

    fn cache() -> OverrideCache {
        OverrideCache::new(Arc::new(MemoryOverrideStore::new()), Duration::from_secs(60))
    }

    fn autoplay(loop_mode: bool) -> SliderOptions {
        SliderOptions {
            autoplay: Some(Duration::from_millis(10)),
            loop_mode,
        }
    }

    async fn loaded(pages: &[(u32, &[&str])], options: SliderOptions) -> MovieSlider {
        let source = Arc::new(ScriptedSource::new(pages));
        let mut slider = MovieSlider::new(source, cache(), options);
        slider.load().await;
        slider
    }

    #[tokio::test]
    async fn autoplay_pauses_on_hover_and_drag() {
        let mut slider = loaded(&[(1, &["a", "b", "c"])], autoplay(false)).await;
        assert!(slider.tick().await);
        assert_eq!(slider.index(), 1);

        slider.set_hover(true);
        assert!(!slider.tick().await);
        slider.set_hover(false);

        slider.begin_drag();
        assert!(!slider.tick().await);
        slider.end_drag();
        assert!(slider.tick().await);
        assert_eq!(slider.current().unwrap().id, "c");
    }

    #[tokio::test]
    async fn tick_without_autoplay_does_nothing() {
        let mut slider = loaded(&[(1, &["a", "b"])], SliderOptions::default()).await;
        assert!(!slider.tick().await);
        assert!(slider.next().await);
        assert_eq!(slider.index(), 1);
    }

    #[tokio::test]
    async fn loop_wraps_and_plain_mode_stops() {
        let mut looping = loaded(&[(1, &["a", "b"])], autoplay(true)).await;
        assert!(looping.next().await);
        assert!(looping.next().await);
        assert_eq!(looping.index(), 0);
        assert!(looping.prev());
        assert_eq!(looping.index(), 1);

        let mut plain = loaded(&[(1, &["a", "b"])], autoplay(false)).await;
        assert!(plain.next().await);
        assert!(!plain.next().await);
        assert_eq!(plain.index(), 1);
    }

    #[tokio::test]
    async fn advancing_past_loaded_items_fetches_next_page() {
        let mut slider = loaded(&[(1, &["a"]), (2, &["a", "b"])], autoplay(false)).await;
        assert!(slider.next().await);
        assert_eq!(slider.current().unwrap().id, "b");
        assert_eq!(slider.len(), 2);
    }

    #[tokio::test]
    async fn active_sync_waits_for_load_and_drag() {
        let source = Arc::new(ScriptedSource::new(&[(1, &["a", "b"]), (2, &["c", "d"])]));
        let mut slider = MovieSlider::new(source, cache(), SliderOptions::default());
        slider.load().await;

        assert!(!slider.sync_active("d"));
        assert_eq!(slider.pending_active(), Some("d"));
        slider.load_more().await;
        assert_eq!(slider.index(), 3);
        assert_eq!(slider.pending_active(), None);

        slider.begin_drag();
        assert!(!slider.sync_active("a"));
        assert_eq!(slider.index(), 3);
        slider.end_drag();
        assert_eq!(slider.index(), 0);
    }

    #[test]
    fn hover_updates_are_throttled_per_frame() {
        let source = Arc::new(ScriptedSource::new(&[]));
        let mut slider = MovieSlider::new(source, cache(), SliderOptions::default());
        let start = Instant::now();

        assert!(slider.hover_item("a", start));
        assert!(!slider.hover_item("b", start + Duration::from_millis(5)));
        assert_eq!(slider.hovered_item(), Some("a"));
        assert!(slider.hover_item("c", start + Duration::from_millis(20)));
        assert_eq!(slider.hovered_item(), Some("c"));
    }

    #[tokio::test]
    async fn autoplay_task_advances_until_cancelled() {
        let slider = Arc::new(Mutex::new(
            loaded(&[(1, &["a", "b", "c", "d"])], autoplay(false)).await,
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_autoplay(slider.clone(), cancel.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        handle.await.unwrap();

        let moved = slider.lock().await.index();
        assert!(moved > 0);
        slider.lock().await.prev();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(slider.lock().await.index(), moved - 1);
    }

    #[tokio::test]
    async fn no_autoplay_task_without_interval() {
        let slider = Arc::new(Mutex::new(
            loaded(&[(1, &["a"])], SliderOptions::default()).await,
        ));
        assert!(spawn_autoplay(slider, CancellationToken::new()).await.is_none());
    }
}
