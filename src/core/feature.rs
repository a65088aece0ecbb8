//! The contract every feature implements, and the contexts it runs in.
//!
//! A feature is a [`Feature`] plus any of three optional capabilities:
//! [`VideoProcessor`] for per-video work, [`GlobalEffect`] for page-wide
//! effects and [`DomObserver`] for reacting to page churn. The manager
//! dispatches by which capabilities are present.

use crate::core::error::FeatureError;
use crate::core::settings::SettingsSnapshot;
use crate::core::state::{Resources, TrackId};
use crate::core::timers::{TimerId, TimerOwner, TimerQueue};
use crate::dom::{DomError, DomEvent, Document, ListenerId, MutationRecord, NodeId};
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use tokio::time::{Duration, Instant};

/// A preference write requested by a feature, flushed to the store by the
/// page context after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceWrite {
    pub key: String,
    pub value: Value,
}

pub trait Feature {
    /// Called when the feature becomes active. Must tolerate being called
    /// again without an intervening [`Feature::cleanup`].
    fn initialize(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        Ok(())
    }

    /// Releases feature-global state. Anything still registered on the
    /// context's resources is released by the manager afterwards.
    fn cleanup(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        Ok(())
    }

    /// Events for listeners registered through a page-scoped context.
    fn on_event(&mut self, _ctx: &mut FeatureContext<'_>, _event: &DomEvent) -> Result<(), FeatureError> {
        Ok(())
    }

    /// Timers scheduled through a page-scoped context.
    fn on_timer(&mut self, _ctx: &mut FeatureContext<'_>, _timer: TimerId) -> Result<(), FeatureError> {
        Ok(())
    }

    /// A preference in this feature's namespace changed. Runs before the
    /// per-video hook of the same name.
    fn on_preference_changed(&mut self, _ctx: &mut FeatureContext<'_>, _key: &str) -> Result<(), FeatureError> {
        Ok(())
    }

    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        None
    }

    fn global_effect(&mut self) -> Option<&mut dyn GlobalEffect> {
        None
    }

    fn dom_observer(&mut self) -> Option<&mut dyn DomObserver> {
        None
    }
}

pub trait VideoProcessor {
    /// Attaches the feature to `ctx.video()`. The manager skips videos whose
    /// slot is already marked attached.
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError>;

    /// Per-video teardown, before the manager releases the slot's resources.
    fn on_cleanup(&mut self, _ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        Ok(())
    }

    fn on_event(&mut self, _ctx: &mut VideoContext<'_>, _event: &DomEvent) -> Result<(), FeatureError> {
        Ok(())
    }

    fn on_timer(&mut self, _ctx: &mut VideoContext<'_>, _timer: TimerId) -> Result<(), FeatureError> {
        Ok(())
    }

    /// A preference in this feature's namespace changed.
    fn on_preference_changed(&mut self, _ctx: &mut VideoContext<'_>, _key: &str) -> Result<(), FeatureError> {
        Ok(())
    }
}

pub trait GlobalEffect {
    fn apply(&mut self, ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError>;

    fn revert(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        Ok(())
    }
}

pub trait DomObserver {
    fn on_mutations(
        &mut self,
        ctx: &mut FeatureContext<'_>,
        records: &[MutationRecord],
    ) -> Result<(), FeatureError>;
}

/// Page access handed to a feature hook. Everything injected or registered
/// through it is recorded so teardown is complete.
pub struct FeatureContext<'a> {
    feature_id: &'a str,
    priority: i32,
    track: Option<TrackId>,
    doc: &'a mut Document,
    settings: &'a SettingsSnapshot,
    timers: &'a mut TimerQueue,
    writes: &'a mut Vec<PreferenceWrite>,
    resources: &'a mut Resources,
    now: Instant,
}

impl<'a> FeatureContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        feature_id: &'a str,
        priority: i32,
        track: Option<TrackId>,
        doc: &'a mut Document,
        settings: &'a SettingsSnapshot,
        timers: &'a mut TimerQueue,
        writes: &'a mut Vec<PreferenceWrite>,
        resources: &'a mut Resources,
        now: Instant,
    ) -> Self {
        Self {
            feature_id,
            priority,
            track,
            doc,
            settings,
            timers,
            writes,
            resources,
            now,
        }
    }

    pub fn feature_id(&self) -> &str {
        self.feature_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// The marker attribute this feature owns, e.g. `data-reel-playback-speed`.
    pub fn marker(&self) -> String {
        format!("data-reel-{}", self.feature_id.replace('_', "-"))
    }

    pub fn doc(&self) -> &Document {
        &*self.doc
    }

    /// Direct document access for reads and for changes the feature undoes
    /// itself (media state, text of its own nodes).
    pub fn doc_mut(&mut self) -> &mut Document {
        &mut *self.doc
    }

    pub fn resources(&self) -> &Resources {
        &*self.resources
    }

    /// Inserts `child` under `parent` before `reference` and records it.
    pub fn inject(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), DomError> {
        self.doc.insert_before(parent, child, reference)?;
        self.resources.push_node(child);
        Ok(())
    }

    /// Finds or creates a container shared between features under `parent`,
    /// identified by the `marker` attribute. It is detached once the last
    /// feature using it releases its children.
    pub fn shared_container(&mut self, parent: NodeId, tag: &str, marker: &str) -> Result<NodeId, DomError> {
        let existing = self
            .doc
            .children(parent)
            .iter()
            .copied()
            .find(|c| self.doc.has_attribute(*c, marker));
        let container = match existing {
            Some(container) => container,
            None => {
                let container = self.doc.create_element(tag);
                self.doc.set_attribute(container, marker, "")?;
                self.doc.append_child(parent, container)?;
                container
            }
        };
        self.resources.push_shared(container);
        Ok(container)
    }

    /// Detaches a node previously injected through this context.
    pub fn remove_injected(&mut self, node: NodeId) -> Result<(), DomError> {
        self.resources.forget_node(node);
        self.doc.remove(node)
    }

    /// Sets an attribute on any element, restoring the prior value on release.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let previous = self.doc.attribute(node, name).map(str::to_string);
        self.doc.set_attribute(node, name, value)?;
        self.resources.note_attribute(node, name, previous);
        Ok(())
    }

    pub fn listen(&mut self, target: NodeId, event_type: &str) -> Result<ListenerId, DomError> {
        let id = self.doc.add_event_listener(target, event_type)?;
        self.resources.push_listener(id);
        Ok(id)
    }

    pub fn set_timeout(&mut self, delay: Duration) -> TimerId {
        self.schedule(delay, None)
    }

    pub fn set_interval(&mut self, period: Duration) -> TimerId {
        self.schedule(period, Some(period))
    }

    fn schedule(&mut self, delay: Duration, period: Option<Duration>) -> TimerId {
        let owner = TimerOwner {
            feature: self.feature_id.to_string(),
            track: self.track,
        };
        let id = self.timers.schedule(owner, self.now + delay, period);
        self.resources.push_timer(id);
        id
    }

    /// Puts back every attribute written with [`FeatureContext::set_attribute`]
    /// in this scope.
    pub fn restore_attributes(&mut self) {
        self.resources.restore_attributes(self.doc);
    }

    pub fn clear_timer(&mut self, timer: TimerId) {
        self.timers.clear(timer);
        self.resources.forget_timer(timer);
    }

    /// Reads `<feature_id>.<key>` from the settings snapshot.
    pub fn preference(&self, key: &str) -> Option<&Value> {
        self.settings
            .preference(&format!("{}.{}", self.feature_id, key))
    }

    pub fn preference_f64(&self, key: &str, default: f64) -> f64 {
        self.preference(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Queues a write of `<feature_id>.<key>`. The snapshot picks it up when
    /// the store reports the change.
    pub fn set_preference(&mut self, key: &str, value: Value) {
        self.writes.push(PreferenceWrite {
            key: format!("{}.{}", self.feature_id, key),
            value,
        });
    }

    pub fn save(&mut self, key: &str, value: impl ToString) {
        self.resources.save(key, value.to_string());
    }

    pub fn saved(&self, key: &str) -> Option<&str> {
        self.resources.saved(key)
    }

    pub fn take_saved(&mut self, key: &str) -> Option<String> {
        self.resources.take_saved(key)
    }
}

/// A [`FeatureContext`] scoped to one tracked video.
pub struct VideoContext<'a> {
    inner: FeatureContext<'a>,
    video: NodeId,
    track_id: TrackId,
}

impl<'a> VideoContext<'a> {
    pub(crate) fn new(inner: FeatureContext<'a>, video: NodeId, track_id: TrackId) -> Self {
        Self {
            inner,
            video,
            track_id,
        }
    }

    pub fn video(&self) -> NodeId {
        self.video
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    /// The element holding the video, where controls are placed.
    pub fn container(&self) -> Result<NodeId, FeatureError> {
        self.inner
            .doc()
            .parent(self.video)
            .ok_or_else(|| FeatureError::failed("video has no container"))
    }
}

impl<'a> Deref for VideoContext<'a> {
    type Target = FeatureContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for VideoContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
