use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::require_media;
use tracing::debug;

pub const ID: &str = "background_play";

/// Keeps a video playing while the tab is hidden. The page pauses media on
/// `visibilitychange`; the resulting `pause` is undone while hidden.
#[derive(Debug, Default)]
pub struct BackgroundPlay;

impl BackgroundPlay {
    pub fn new() -> Self {
        Self
    }
}

impl Feature for BackgroundPlay {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for BackgroundPlay {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let video = ctx.video();
        let marker = ctx.marker();
        ctx.set_attribute(video, &marker, "")?;
        ctx.listen(video, "pause")?;
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        if event.event_type != "pause" || !ctx.doc().is_hidden() {
            return Ok(());
        }
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            media.paused = false;
        }
        ctx.doc_mut().dispatch_event(video, "play");
        debug!("Resumed video #{} in the background", ctx.track_id());
        Ok(())
    }
}
