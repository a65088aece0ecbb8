use crate::core::state::TrackId;
use crate::dom::DomError;
use thiserror::Error;

/// Failure reported by a feature hook.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeatureError {
    #[error("dom operation failed: {0}")]
    Dom(#[from] DomError),
    #[error("node is not a media element")]
    NotMedia,
    #[error("{0}")]
    Failed(String),
}

impl FeatureError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("feature '{0}' is already registered")]
    DuplicateId(String),
    #[error("invalid feature id '{0}': use lowercase letters, digits and underscores")]
    InvalidId(String),
    #[error("feature '{0}' registered after the manager was initialized")]
    AfterInitialize(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("unknown feature '{0}'")]
    UnknownFeature(String),
}

/// A contained fault recorded by the manager. None of these escape dispatch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("feature '{feature}' failed to initialize: {source}")]
    Initialization { feature: String, source: FeatureError },
    #[error("feature '{feature}' failed on video #{track}: {source}")]
    Processing {
        feature: String,
        track: TrackId,
        source: FeatureError,
    },
    #[error("feature '{feature}' failed while observing mutations: {source}")]
    Observation { feature: String, source: FeatureError },
    #[error("feature '{feature}' failed to apply a preference change: {source}")]
    Preference { feature: String, source: FeatureError },
    #[error("feature '{feature}' failed during cleanup: {source}")]
    Cleanup { feature: String, source: FeatureError },
}

impl LifecycleError {
    pub fn feature(&self) -> &str {
        match self {
            Self::Initialization { feature, .. }
            | Self::Processing { feature, .. }
            | Self::Observation { feature, .. }
            | Self::Preference { feature, .. }
            | Self::Cleanup { feature, .. } => feature,
        }
    }
}
