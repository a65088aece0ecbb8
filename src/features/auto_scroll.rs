use crate::core::timers::TimerId;
use crate::core::{Feature, FeatureError, TrackId, VideoContext, VideoProcessor};
use crate::dom::{DomEvent, NodeId, Selector};
use crate::features::controls::require_media;
use std::collections::BTreeMap;
use tokio::time::Duration;
use tracing::debug;

pub const ID: &str = "auto_scroll";

pub const DEFAULT_DELAY_MS: u64 = 500;

/// Scrolls to the next video once the current one ends.
#[derive(Debug)]
pub struct AutoScroll {
    videos: Selector,
    pending: BTreeMap<TrackId, TimerId>,
}

impl AutoScroll {
    pub fn new(video_selector: Selector) -> Self {
        Self {
            videos: video_selector,
            pending: BTreeMap::new(),
        }
    }

    fn next_video(&self, ctx: &VideoContext<'_>) -> Option<NodeId> {
        let doc = ctx.doc();
        let all = doc.query_selector_all(doc.root(), &self.videos);
        let position = all.iter().position(|v| *v == ctx.video())?;
        all.get(position + 1).copied()
    }
}

impl Feature for AutoScroll {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for AutoScroll {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let video = ctx.video();
        ctx.listen(video, "ended")?;
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        if event.event_type != "ended" {
            return Ok(());
        }
        if let Some(previous) = self.pending.remove(&ctx.track_id()) {
            ctx.clear_timer(previous);
        }
        let delay = ctx
            .preference("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_DELAY_MS);
        let timer = ctx.set_timeout(Duration::from_millis(delay));
        self.pending.insert(ctx.track_id(), timer);
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut VideoContext<'_>, _timer: TimerId) -> Result<(), FeatureError> {
        self.pending.remove(&ctx.track_id());
        let Some(next) = self.next_video(ctx) else {
            debug!("No video after #{}", ctx.track_id());
            return Ok(());
        };
        ctx.doc_mut().scroll_into_view(next)?;
        if let Some(media) = ctx.doc_mut().media_mut(next) {
            media.paused = false;
        }
        ctx.doc_mut().dispatch_event(next, "play");
        Ok(())
    }

    fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        self.pending.remove(&ctx.track_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FeatureManager, FeatureOptions, SettingsSnapshot};
    use crate::dom::Document;
    use serde_json::json;
    use tokio::time::Instant;

    fn page(settings: &SettingsSnapshot) -> (Document, FeatureManager, NodeId, NodeId) {
        let mut doc = Document::new();
        let body = doc.body();
        let first = doc.create_element("video");
        let second = doc.create_element("video");
        doc.append_child(body, first).unwrap();
        doc.append_child(body, second).unwrap();

        let mut manager = FeatureManager::new();
        manager
            .register(ID, AutoScroll::new(Selector::parse("video").unwrap()), FeatureOptions::new(40))
            .unwrap();
        let now = Instant::now();
        manager.initialize(&mut doc, settings, now);
        manager.video_appeared(&mut doc, settings, first, now);
        manager.video_appeared(&mut doc, settings, second, now);
        (doc, manager, first, second)
    }

    fn deliver(doc: &mut Document, manager: &mut FeatureManager, settings: &SettingsSnapshot, now: Instant) {
        for event in doc.take_events() {
            manager.dispatch_dom_event(doc, settings, &event, now);
        }
    }

    #[test]
    fn test_ended_scrolls_after_delay() {
        let settings = SettingsSnapshot::default().with_preference("auto_scroll.delay_ms", json!(200));
        let (mut doc, mut manager, first, second) = page(&settings);
        let now = Instant::now();
        doc.dispatch_event(first, "ended");
        deliver(&mut doc, &mut manager, &settings, now);

        manager.fire_due_timers(&mut doc, &settings, now + Duration::from_millis(199));
        assert_eq!(doc.scroll_target(), None);
        manager.fire_due_timers(&mut doc, &settings, now + Duration::from_millis(200));
        assert_eq!(doc.scroll_target(), Some(second));
        assert!(!doc.media(second).unwrap().paused);
        assert_eq!(manager.next_timer_deadline(), None);
    }

    #[test]
    fn test_pending_scroll_is_cancelled_on_disable() {
        let settings = SettingsSnapshot::default();
        let (mut doc, mut manager, first, _) = page(&settings);
        let now = Instant::now();
        doc.dispatch_event(first, "ended");
        deliver(&mut doc, &mut manager, &settings, now);
        assert!(manager.next_timer_deadline().is_some());

        manager.set_feature_enabled(&mut doc, &settings, ID, false, now).unwrap();
        assert_eq!(manager.next_timer_deadline(), None);
        manager.fire_due_timers(&mut doc, &settings, now + Duration::from_secs(5));
        assert_eq!(doc.scroll_target(), None);
    }

    #[test]
    fn test_last_video_stays_put() {
        let settings = SettingsSnapshot::default();
        let (mut doc, mut manager, _, second) = page(&settings);
        let now = Instant::now();
        doc.dispatch_event(second, "ended");
        deliver(&mut doc, &mut manager, &settings, now);
        manager.fire_due_timers(&mut doc, &settings, now + Duration::from_millis(DEFAULT_DELAY_MS));
        assert_eq!(doc.scroll_target(), None);
    }
}
