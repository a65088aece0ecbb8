use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::{control_element, mount_control, require_media, saved_control};
use crate::utils::format_duration;

pub const ID: &str = "duration_overlay";

const CONTROL: &str = "label";
const REFRESH_ON: [&str; 3] = ["timeupdate", "loadedmetadata", "durationchange"];

/// Shows `elapsed / total` next to the video.
#[derive(Debug, Default)]
pub struct DurationOverlay;

impl DurationOverlay {
    pub fn new() -> Self {
        Self
    }

    fn refresh(ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        let Some(label) = saved_control(ctx, CONTROL) else {
            return Ok(());
        };
        let text = match ctx.doc().media(ctx.video()) {
            Some(media) => format!(
                "{} / {}",
                format_duration(Some(media.current_time)),
                format_duration(media.duration)
            ),
            None => return Err(FeatureError::NotMedia),
        };
        ctx.doc_mut().set_text_content(label, &text)?;
        Ok(())
    }
}

impl Feature for DurationOverlay {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for DurationOverlay {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let label = control_element(ctx, "span", &[("aria-live", "off")])?;
        mount_control(ctx, CONTROL, label)?;
        let video = ctx.video();
        for event_type in REFRESH_ON {
            ctx.listen(video, event_type)?;
        }
        Self::refresh(ctx)
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        if REFRESH_ON.contains(&event.event_type.as_str()) {
            Self::refresh(ctx)?;
        }
        Ok(())
    }
}
