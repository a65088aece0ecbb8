use crate::core::settings::KeyPrefixes;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Elements the video observer tracks.
    pub video_selector: String,
    /// Subtree to observe; the document body when nothing matches.
    pub root_selector: Option<String>,
    pub removal_debounce_ms: u64,
    pub rescan_interval_ms: u64,
    pub max_processing_failures: u32,
    pub feature_key_prefix: String,
    pub preference_key_prefix: String,
    /// Per-feature overrides of the built-in priority table and defaults.
    pub features: BTreeMap<String, FeatureConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureConfig {
    pub priority: Option<i32>,
    pub default_enabled: Option<bool>,
    /// Leave the feature out of the registry entirely.
    pub skip: bool,
}

impl Default for Config {
    fn default() -> Self {
        let prefixes = KeyPrefixes::default();
        Self {
            video_selector: "video".to_string(),
            root_selector: Some("main".to_string()),
            removal_debounce_ms: 50,
            rescan_interval_ms: 1000,
            max_processing_failures: 1,
            feature_key_prefix: prefixes.feature,
            preference_key_prefix: prefixes.preference,
            features: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads a TOML config, falling back to defaults when `path` is `None`
    /// or the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.video_selector.trim().is_empty() {
            anyhow::bail!("video_selector must not be empty");
        }
        if self.feature_key_prefix == self.preference_key_prefix {
            anyhow::bail!("feature and preference key prefixes must differ");
        }
        Ok(())
    }

    pub fn removal_debounce(&self) -> Duration {
        Duration::from_millis(self.removal_debounce_ms)
    }

    /// `None` turns the periodic rescan off.
    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }

    pub fn key_prefixes(&self) -> KeyPrefixes {
        KeyPrefixes {
            feature: self.feature_key_prefix.clone(),
            preference: self.preference_key_prefix.clone(),
        }
    }

    pub fn feature(&self, id: &str) -> FeatureConfig {
        self.features.get(id).cloned().unwrap_or_default()
    }
}
