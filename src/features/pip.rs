use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::{control_element, mount_control, require_media, saved_control};

pub const ID: &str = "picture_in_picture";

const CONTROL: &str = "button";
const ENTERED: &str = "entered";

#[derive(Debug, Default)]
pub struct PictureInPicture;

impl PictureInPicture {
    pub fn new() -> Self {
        Self
    }

    fn set_active(ctx: &mut VideoContext<'_>, active: bool) -> Result<(), FeatureError> {
        let video = ctx.video();
        let media = ctx.doc_mut().media_mut(video).ok_or(FeatureError::NotMedia)?;
        if media.picture_in_picture == active {
            return Ok(());
        }
        media.picture_in_picture = active;
        let event_type = if active {
            "enterpictureinpicture"
        } else {
            "leavepictureinpicture"
        };
        ctx.doc_mut().dispatch_event(video, event_type);
        if let Some(button) = saved_control(ctx, CONTROL) {
            ctx.doc_mut()
                .set_attribute(button, "aria-pressed", if active { "true" } else { "false" })?;
        }
        if active {
            ctx.save(ENTERED, true);
        } else {
            ctx.take_saved(ENTERED);
        }
        Ok(())
    }
}

impl Feature for PictureInPicture {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for PictureInPicture {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let button = control_element(
            ctx,
            "button",
            &[("aria-label", "Picture in picture"), ("aria-pressed", "false")],
        )?;
        mount_control(ctx, CONTROL, button)?;
        ctx.listen(button, "click")?;
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        if event.event_type != "click" {
            return Ok(());
        }
        let active = ctx
            .doc()
            .media(ctx.video())
            .is_some_and(|m| m.picture_in_picture);
        Self::set_active(ctx, !active)
    }

    fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        if ctx.saved(ENTERED).is_some() {
            Self::set_active(ctx, false)?;
        }
        Ok(())
    }
}
