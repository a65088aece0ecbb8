//! Built-in features and their registration.

pub mod auto_scroll;
pub mod background_play;
pub mod controls;
pub mod duration_overlay;
pub mod hide_distractions;
pub mod pip;
pub mod playback_speed;
pub mod seekbar;
pub mod volume;

use crate::config::Config;
use crate::core::{Feature, FeatureManager, FeatureOptions, RegistrationError};
use crate::dom::{DomError, Selector};
use thiserror::Error;
use tracing::debug;

pub use auto_scroll::AutoScroll;
pub use background_play::BackgroundPlay;
pub use duration_overlay::DurationOverlay;
pub use hide_distractions::HideDistractions;
pub use pip::PictureInPicture;
pub use playback_speed::PlaybackSpeed;
pub use seekbar::Seekbar;
pub use volume::VolumeControl;

/// Built-in ids with their default priority and enabled flag.
pub const BUILTIN: [(&str, i32, bool); 8] = [
    (playback_speed::ID, 100, true),
    (volume::ID, 90, true),
    (duration_overlay::ID, 80, true),
    (seekbar::ID, 70, true),
    (pip::ID, 60, true),
    (background_play::ID, 50, true),
    (auto_scroll::ID, 40, false),
    (hide_distractions::ID, 10, true),
];

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("invalid video selector: {0}")]
    Selector(#[from] DomError),
}

fn instantiate(id: &str, videos: &Selector) -> Option<Box<dyn Feature>> {
    let feature: Box<dyn Feature> = match id {
        playback_speed::ID => Box::new(PlaybackSpeed::new()),
        volume::ID => Box::new(VolumeControl::new()),
        duration_overlay::ID => Box::new(DurationOverlay::new()),
        seekbar::ID => Box::new(Seekbar::new()),
        pip::ID => Box::new(PictureInPicture::new()),
        background_play::ID => Box::new(BackgroundPlay::new()),
        auto_scroll::ID => Box::new(AutoScroll::new(videos.clone())),
        hide_distractions::ID => Box::new(HideDistractions::new()),
        _ => return None,
    };
    Some(feature)
}

/// Registers every built-in feature, applying the `[features.<id>]`
/// overrides from `config`.
pub fn register_builtin(manager: &mut FeatureManager, config: &Config) -> Result<(), BuiltinError> {
    let videos = Selector::parse(&config.video_selector)?;
    for (id, priority, default_enabled) in BUILTIN {
        let overrides = config.feature(id);
        if overrides.skip {
            debug!("Skipping built-in feature '{}'", id);
            continue;
        }
        let Some(feature) = instantiate(id, &videos) else {
            continue;
        };
        let options = FeatureOptions {
            priority: overrides.priority.unwrap_or(priority),
            default_enabled: overrides.default_enabled.unwrap_or(default_enabled),
        };
        manager.register_boxed(id, feature, options)?;
    }
    Ok(())
}
