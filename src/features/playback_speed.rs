use crate::core::{Feature, FeatureError, VideoContext, VideoProcessor};
use crate::dom::DomEvent;
use crate::features::controls::{control_element, mount_control, require_media, saved_control};
use crate::utils::{clamp_playback_rate, parse_number};
use serde_json::json;
use tracing::debug;

pub const ID: &str = "playback_speed";

const RATES: [f64; 7] = [0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0];
const CONTROL: &str = "select";
const ORIGINAL_RATE: &str = "original_rate";

/// Rate picker. The chosen rate is kept in the `rate` preference and
/// re-applied on every `play`, since the page resets it between reels.
#[derive(Debug, Default)]
pub struct PlaybackSpeed;

impl PlaybackSpeed {
    pub fn new() -> Self {
        Self
    }

    fn preferred_rate(ctx: &VideoContext<'_>) -> f64 {
        clamp_playback_rate(ctx.preference_f64("rate", 1.0))
    }

    fn apply(ctx: &mut VideoContext<'_>, rate: f64) {
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            media.playback_rate = rate;
        }
        if let Some(select) = saved_control(ctx, CONTROL) {
            if let Err(e) = ctx.doc_mut().set_attribute(select, "value", &format_rate(rate)) {
                debug!("Could not sync rate picker: {}", e);
            }
        }
    }
}

fn format_rate(rate: f64) -> String {
    format!("{}", rate)
}

impl Feature for PlaybackSpeed {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for PlaybackSpeed {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        require_media(ctx)?;
        let video = ctx.video();
        if let Some(original) = ctx.doc().media(video).map(|m| m.playback_rate) {
            ctx.save(ORIGINAL_RATE, original);
        }

        let rate = Self::preferred_rate(ctx);
        let select = control_element(ctx, "select", &[("aria-label", "Playback speed")])?;
        for option in RATES {
            let value = format_rate(option);
            let node = ctx.doc_mut().create_element("option");
            ctx.doc_mut().set_attribute(node, "value", &value)?;
            ctx.doc_mut().set_text_content(node, &format!("{}x", value))?;
            ctx.doc_mut().append_child(select, node)?;
        }
        mount_control(ctx, CONTROL, select)?;
        ctx.listen(select, "change")?;
        ctx.listen(video, "play")?;
        Self::apply(ctx, rate);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut VideoContext<'_>, event: &DomEvent) -> Result<(), FeatureError> {
        match event.event_type.as_str() {
            "change" => {
                let Some(rate) = parse_number(ctx.doc().attribute(event.target, "value")) else {
                    return Ok(());
                };
                let rate = clamp_playback_rate(rate);
                debug!("Video #{} playback rate set to {}", ctx.track_id(), rate);
                Self::apply(ctx, rate);
                ctx.set_preference("rate", json!(rate));
            }
            "play" => {
                let rate = Self::preferred_rate(ctx);
                Self::apply(ctx, rate);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_preference_changed(&mut self, ctx: &mut VideoContext<'_>, _key: &str) -> Result<(), FeatureError> {
        let rate = Self::preferred_rate(ctx);
        Self::apply(ctx, rate);
        Ok(())
    }

    fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        let original = parse_number(ctx.saved(ORIGINAL_RATE)).unwrap_or(1.0);
        let video = ctx.video();
        if let Some(media) = ctx.doc_mut().media_mut(video) {
            media.playback_rate = original;
        }
        Ok(())
    }
}
