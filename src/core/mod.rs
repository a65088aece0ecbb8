pub mod error;
pub mod feature;
pub mod manager;
pub mod messaging;
pub mod observer;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod timers;

pub use error::{FeatureError, LifecycleError, ManagerError, RegistrationError};
pub use feature::{DomObserver, Feature, FeatureContext, GlobalEffect, VideoContext, VideoProcessor};
pub use manager::{FeatureManager, FeatureOptions, FeatureStatus};
pub use messaging::{MessageClient, MessageType, RuntimeMessage};
pub use observer::{VideoEvent, VideoObserver};
pub use runtime::{PageContext, RuntimeError};
pub use settings::{FileStore, MemoryStore, Settings, SettingsSnapshot, SettingsStore, StorageChange, StorageError};
pub use state::{TrackId, VideoStateMap, TRACK_ATTRIBUTE};
