use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::{control_element, mount_control, require_media, saved_control};
use crate::utils::{clamp_unit, parse_number};
use serde_json::json;
use tracing::debug;

pub const ID: &str = "volume_control";

const CONTROL: &str = "slider";
const ORIGINAL_VOLUME: &str = "original_volume";
const ORIGINAL_MUTED: &str = "original_muted";

/// Volume slider bound to the `level` preference.
#[derive(Debug, Default)]
pub struct VolumeControl;

impl VolumeControl {
    pub fn new() -> Self {
        Self
    }

    fn apply(ctx: &mut VideoContext<'_>, level: f64) {
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            media.volume = level;
            media.muted = level == 0.0;
        }
        if let Some(slider) = saved_control(ctx, CONTROL) {
            if let Err(e) = ctx.doc_mut().set_attribute(slider, "value", &level.to_string()) {
                debug!("Could not sync volume slider: {}", e);
            }
        }
    }
}

impl Feature for VolumeControl {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for VolumeControl {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let video = ctx.video();
        let (volume, muted) = ctx
            .doc()
            .media(video)
            .map(|m| (m.volume, m.muted))
            .unwrap_or((1.0, false));
        ctx.save(ORIGINAL_VOLUME, volume);
        ctx.save(ORIGINAL_MUTED, muted);

        let slider = control_element(
            ctx,
            "input",
            &[
                ("type", "range"),
                ("min", "0"),
                ("max", "1"),
                ("step", "0.05"),
                ("aria-label", "Volume"),
            ],
        )?;
        mount_control(ctx, CONTROL, slider)?;
        ctx.listen(slider, "input")?;

        if ctx.preference("level").is_some() {
            let level = clamp_unit(ctx.preference_f64("level", volume));
            Self::apply(ctx, level);
        } else {
            ctx.doc_mut().set_attribute(slider, "value", &volume.to_string())?;
        }
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        if event.event_type != "input" {
            return Ok(());
        }
        if let Some(level) = parse_number(ctx.doc().attribute(event.target, "value")) {
            let level = clamp_unit(level);
            Self::apply(ctx, level);
            ctx.set_preference("level", json!(level));
        }
        Ok(())
    }

    fn on_preference_changed(&mut self, ctx: &mut VideoContext<'_>, _key: &str) -> Result<(), FeatureError> {
        if ctx.preference("level").is_some() {
            let level = clamp_unit(ctx.preference_f64("level", 1.0));
            Self::apply(ctx, level);
        }
        Ok(())
    }

    fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        let volume = parse_number(ctx.saved(ORIGINAL_VOLUME)).unwrap_or(1.0);
        let muted = ctx.saved(ORIGINAL_MUTED) == Some("true");
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            media.volume = volume;
            media.muted = muted;
        }
        Ok(())
    }
}
