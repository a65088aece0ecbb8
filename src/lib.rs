pub mod config;
pub mod core;
pub mod dom;
pub mod features;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::{
    Feature, FeatureManager, FeatureOptions, MemoryStore, PageContext, SettingsStore, VideoEvent,
    VideoObserver,
};
pub use crate::dom::{Document, NodeId};
pub use crate::features::register_builtin;
