use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::{control_element, mount_control, require_media, saved_control};
use crate::utils::parse_number;

pub const ID: &str = "seekbar";

const CONTROL: &str = "bar";
/// Resolution of the bar's `value` and `aria-valuenow`.
pub const SEEKBAR_STEPS: f64 = 1000.0;

#[derive(Debug, Default)]
pub struct Seekbar;

impl Seekbar {
    pub fn new() -> Self {
        Self
    }

    fn sync(ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        let Some(bar) = saved_control(ctx, CONTROL) else {
            return Ok(());
        };
        let position = match ctx.doc().media(ctx.video()) {
            Some(media) => match media.duration.filter(|d| *d > 0.0 && d.is_finite()) {
                Some(duration) => (media.current_time / duration).clamp(0.0, 1.0),
                None => 0.0,
            },
            None => return Err(FeatureError::NotMedia),
        };
        let value = ((position * SEEKBAR_STEPS).round() as u32).to_string();
        ctx.doc_mut().set_attribute(bar, "aria-valuenow", &value)?;
        Ok(())
    }

    fn seek(ctx: &mut VideoContext<'_>, bar: crate::dom::NodeId) {
        let Some(step) = parse_number(ctx.doc().attribute(bar, "value")) else {
            return;
        };
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            if let Some(duration) = media.duration.filter(|d| *d > 0.0 && d.is_finite()) {
                media.current_time = duration * (step / SEEKBAR_STEPS).clamp(0.0, 1.0);
            }
        }
    }
}

impl Feature for Seekbar {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for Seekbar {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let bar = control_element(
            ctx,
            "div",
            &[
                ("role", "slider"),
                ("aria-valuemin", "0"),
                ("aria-valuemax", "1000"),
            ],
        )?;
        mount_control(ctx, CONTROL, bar)?;
        ctx.listen(bar, "input")?;
        let video = ctx.video();
        ctx.listen(video, "timeupdate")?;
        Self::sync(ctx)
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        match event.event_type.as_str() {
            "input" => {
                Self::seek(ctx, event.target);
                Self::sync(ctx)
            }
            "timeupdate" => Self::sync(ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::controls::testing::Page;

    #[test]
    fn test_input_seeks_video() {
        let mut page = Page::with_feature(ID, Seekbar::new(), 70);
        let bar = page.find("data-reel-seekbar").unwrap();
        assert_eq!(page.doc.attribute(bar, "aria-valuenow"), Some("0"));

        let video = page.video;
        page.doc.media_mut(video).unwrap().duration = Some(40.0);
        page.doc.set_attribute(bar, "value", "250").unwrap();
        page.dispatch(bar, "input");
        assert_eq!(page.doc.media(video).unwrap().current_time, 10.0);
        assert_eq!(page.doc.attribute(bar, "aria-valuenow"), Some("250"));
    }

    #[test]
    fn test_input_without_duration_is_ignored() {
        let mut page = Page::with_feature(ID, Seekbar::new(), 70);
        let bar = page.find("data-reel-seekbar").unwrap();
        page.doc.set_attribute(bar, "value", "500").unwrap();
        page.dispatch(bar, "input");
        assert_eq!(page.doc.media(page.video).unwrap().current_time, 0.0);
    }
}
