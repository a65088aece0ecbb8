//! Feature registry and lifecycle driver.
//!
//! The manager owns every registered feature, the per-video state arena and
//! the page timers. All calls into feature code go through here and every
//! failure is contained to the (feature, video) pair or feature it came from.

use crate::core::error::{FeatureError, LifecycleError, ManagerError, RegistrationError};
use crate::core::feature::{Feature, FeatureContext, PreferenceWrite, VideoContext, VideoProcessor};
use crate::core::observer::VideoEvent;
use crate::core::settings::SettingsSnapshot;
use crate::core::state::{Resources, TrackId, TrackedVideo, VideoStateMap};
use crate::core::timers::TimerQueue;
use crate::dom::{DomEvent, Document, MutationRecord, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ERROR_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureOptions {
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Used when the store holds no flag for the feature.
    pub default_enabled: bool,
}

impl FeatureOptions {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            default_enabled: true,
        }
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.default_enabled = false;
        self
    }
}

struct FeatureDescriptor {
    id: String,
    priority: i32,
    default_enabled: bool,
    uses_video_observer: bool,
    enabled: bool,
    active: bool,
    registration_index: usize,
    instance: Box<dyn Feature>,
    resources: Resources,
    last_error: Option<String>,
}

/// Snapshot of one feature, as reported to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub id: String,
    pub priority: i32,
    pub enabled: bool,
    pub active: bool,
    pub default_enabled: bool,
    pub uses_video_observer: bool,
    pub attached_videos: usize,
    pub last_error: Option<String>,
}

/// Borrowed page state threaded through one dispatch.
struct Scope<'a> {
    doc: &'a mut Document,
    settings: &'a SettingsSnapshot,
    timers: &'a mut TimerQueue,
    writes: &'a mut Vec<PreferenceWrite>,
    now: Instant,
}

impl Scope<'_> {
    fn context<'b>(
        &'b mut self,
        id: &'b str,
        priority: i32,
        track: Option<TrackId>,
        resources: &'b mut Resources,
    ) -> FeatureContext<'b> {
        FeatureContext::new(
            id,
            priority,
            track,
            &mut *self.doc,
            self.settings,
            &mut *self.timers,
            &mut *self.writes,
            resources,
            self.now,
        )
    }
}

pub struct FeatureManager {
    features: Vec<FeatureDescriptor>,
    order: Vec<usize>,
    videos: VideoStateMap,
    timers: TimerQueue,
    writes: Vec<PreferenceWrite>,
    errors: VecDeque<LifecycleError>,
    max_processing_failures: u32,
    initialized: bool,
}

impl Default for FeatureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureManager {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            order: Vec::new(),
            videos: VideoStateMap::new(),
            timers: TimerQueue::new(),
            writes: Vec::new(),
            errors: VecDeque::new(),
            max_processing_failures: 1,
            initialized: false,
        }
    }

    /// How many failed `process_video` attempts a (feature, video) pair gets
    /// before it is skipped for good.
    pub fn with_max_processing_failures(mut self, attempts: u32) -> Self {
        self.max_processing_failures = attempts.max(1);
        self
    }

    pub fn max_processing_failures(&self) -> u32 {
        self.max_processing_failures
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        feature: impl Feature + 'static,
        options: FeatureOptions,
    ) -> Result<&mut Self, RegistrationError> {
        self.register_boxed(id, Box::new(feature), options)
    }

    pub fn register_boxed(
        &mut self,
        id: impl Into<String>,
        mut instance: Box<dyn Feature>,
        options: FeatureOptions,
    ) -> Result<&mut Self, RegistrationError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(RegistrationError::InvalidId(id));
        }
        if self.features.iter().any(|f| f.id == id) {
            return Err(RegistrationError::DuplicateId(id));
        }
        if self.initialized {
            return Err(RegistrationError::AfterInitialize(id));
        }

        let uses_video_observer = instance.video_processor().is_some();
        debug!(
            "Registered feature '{}' (priority {}, video observer: {})",
            id, options.priority, uses_video_observer
        );
        self.features.push(FeatureDescriptor {
            id,
            priority: options.priority,
            default_enabled: options.default_enabled,
            uses_video_observer,
            enabled: false,
            active: false,
            registration_index: self.features.len(),
            instance,
            resources: Resources::default(),
            last_error: None,
        });
        self.rebuild_order();
        Ok(self)
    }

    fn rebuild_order(&mut self) {
        let mut order: Vec<usize> = (0..self.features.len()).collect();
        order.sort_by(|a, b| {
            let (a, b) = (&self.features[*a], &self.features[*b]);
            b.priority
                .cmp(&a.priority)
                .then(a.registration_index.cmp(&b.registration_index))
        });
        self.order = order;
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.features.iter().position(|f| f.id == id)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    /// Feature ids in dispatch order.
    pub fn feature_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|idx| self.features[*idx].id.clone())
            .collect()
    }

    /// Every id with its declared default, for loading the settings snapshot.
    pub fn defaults(&self) -> Vec<(String, bool)> {
        self.features
            .iter()
            .map(|f| (f.id.clone(), f.default_enabled))
            .collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.index_of(id).is_some_and(|idx| self.features[idx].enabled)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.index_of(id).is_some_and(|idx| self.features[idx].active)
    }

    pub fn videos(&self) -> &VideoStateMap {
        &self.videos
    }

    pub fn is_attached(&self, id: &str, video: NodeId) -> bool {
        self.videos
            .track_id(video)
            .and_then(|track| self.videos.get(track))
            .and_then(|entry| entry.slot(id))
            .is_some_and(|slot| slot.attached)
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &LifecycleError> {
        self.errors.iter()
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn take_preference_writes(&mut self) -> Vec<PreferenceWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Reads each feature's flag from the snapshot (declared default when
    /// absent) and initializes the enabled ones. A feature that fails to
    /// initialize stays inactive; the others are unaffected.
    pub fn initialize(&mut self, doc: &mut Document, settings: &SettingsSnapshot, now: Instant) {
        if self.initialized {
            debug!("Feature manager already initialized");
            return;
        }
        self.initialized = true;

        let FeatureManager {
            features,
            order,
            timers,
            writes,
            errors,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            desc.enabled = settings
                .feature_enabled(&desc.id)
                .unwrap_or(desc.default_enabled);
            if !desc.enabled {
                debug!("Feature '{}' is disabled", desc.id);
                continue;
            }
            if let Err(e) = activate(desc, &mut scope) {
                record(errors, desc, e);
            }
        }

        let active = features.iter().filter(|f| f.active).count();
        info!("Initialized {} of {} features", active, features.len());
    }

    pub fn handle_video_event(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        event: VideoEvent,
        now: Instant,
    ) {
        match event {
            VideoEvent::Appeared(node) => self.video_appeared(doc, settings, node, now),
            VideoEvent::Disappeared(node) => self.video_disappeared(doc, settings, node, now),
            VideoEvent::Moved { video, from } => self.video_moved(doc, video, from),
        }
    }

    /// Follows a video the page moved to another container: nodes features
    /// placed beside it in `from` move along, keeping their order.
    pub fn video_moved(&self, doc: &mut Document, node: NodeId, from: NodeId) {
        let Some(entry) = self.videos.track_id(node).and_then(|track| self.videos.get(track)) else {
            return;
        };
        let Some(container) = doc.parent(node) else {
            return;
        };
        let held = entry.held_nodes();
        let travelling: Vec<NodeId> = doc
            .children(from)
            .iter()
            .copied()
            .filter(|child| held.contains(child))
            .collect();
        for child in &travelling {
            if let Err(e) = doc.append_child(container, *child) {
                debug!("Could not move {:?} with video #{}: {}", child, entry.track_id, e);
            }
        }
        debug!("Video #{} moved, {} injected nodes followed", entry.track_id, travelling.len());
    }

    /// Nodes of tracked videos. They stay alive while detached until the
    /// removal is confirmed.
    pub fn held_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.videos.iter().map(|entry| entry.node)
    }

    /// Drops handles to nodes the document has reclaimed.
    pub fn forget_reclaimed(&mut self, doc: &Document) {
        for desc in &mut self.features {
            desc.resources.forget_reclaimed(doc);
        }
        for entry in self.videos.iter_mut() {
            entry.forget_reclaimed(doc);
        }
    }

    /// Dispatches a new video to every enabled video feature, highest
    /// priority first. Redelivery of a known video is a no-op per feature.
    pub fn video_appeared(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        node: NodeId,
        now: Instant,
    ) {
        if !doc.exists(node) {
            warn!("Ignoring appearance of unknown node {:?}", node);
            return;
        }

        let FeatureManager {
            features,
            order,
            videos,
            timers,
            writes,
            errors,
            max_processing_failures,
            ..
        } = self;
        let track = videos.track(doc, node);
        let Some(entry) = videos.get_mut(track) else {
            return;
        };
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            if !(desc.enabled && desc.active && desc.uses_video_observer) {
                continue;
            }
            match process_slot(desc, entry, &mut scope, *max_processing_failures) {
                Ok(true) => debug!("Feature '{}' attached to video #{}", desc.id, track),
                Ok(false) => {}
                Err(e) => record(errors, desc, e),
            }
        }
    }

    /// Runs per-video cleanup for every feature attached to `node` and
    /// drops its entry.
    pub fn video_disappeared(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        node: NodeId,
        now: Instant,
    ) {
        let FeatureManager {
            features,
            order,
            videos,
            timers,
            writes,
            errors,
            ..
        } = self;
        let Some(track) = videos.track_id(node) else {
            return;
        };
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        if let Some(entry) = videos.get_mut(track) {
            for idx in order.iter() {
                let desc = &mut features[*idx];
                if let Some(e) = release_slot(desc, entry, &mut scope) {
                    record(errors, desc, e);
                }
            }
        }
        videos.untrack(scope.doc, node);
        debug!("Released video #{}", track);
    }

    /// Applies a live flag change. Enabling initializes the feature and
    /// processes every tracked video once; disabling tears down everything
    /// the feature attached. Returns whether anything changed.
    pub fn set_feature_enabled(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        id: &str,
        enabled: bool,
        now: Instant,
    ) -> Result<bool, ManagerError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| ManagerError::UnknownFeature(id.to_string()))?;

        let FeatureManager {
            features,
            videos,
            timers,
            writes,
            errors,
            max_processing_failures,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };
        let desc = &mut features[idx];

        if enabled {
            if desc.enabled && desc.active {
                return Ok(false);
            }
            desc.enabled = true;
            if let Err(e) = activate(desc, &mut scope) {
                record(errors, desc, e);
                return Ok(true);
            }
            if desc.uses_video_observer {
                for track in videos.track_ids() {
                    let Some(entry) = videos.get_mut(track) else {
                        continue;
                    };
                    if !scope.doc.is_connected(entry.node) {
                        continue;
                    }
                    if let Err(e) = process_slot(desc, entry, &mut scope, *max_processing_failures) {
                        record(errors, desc, e);
                    }
                }
            }
            info!("Enabled feature '{}'", id);
        } else {
            if !desc.enabled && !desc.active {
                return Ok(false);
            }
            desc.enabled = false;
            for e in deactivate(desc, videos, &mut scope) {
                record(errors, desc, e);
            }
            info!("Disabled feature '{}'", id);
        }
        Ok(true)
    }

    /// Brings every feature in line with the snapshot, e.g. after a
    /// configuration reload.
    pub fn reconcile(&mut self, doc: &mut Document, settings: &SettingsSnapshot, now: Instant) {
        let desired: Vec<(String, bool)> = self
            .features
            .iter()
            .map(|f| {
                (
                    f.id.clone(),
                    settings.feature_enabled(&f.id).unwrap_or(f.default_enabled),
                )
            })
            .collect();
        for (id, enabled) in desired {
            if let Err(e) = self.set_feature_enabled(doc, settings, &id, enabled, now) {
                warn!("Could not reconcile '{}': {}", id, e);
            }
        }
    }

    /// Tells enabled features that a preference in their namespace
    /// (`<feature_id>.<key>`) changed: the page-scoped hook first, then
    /// every attached video.
    pub fn preference_changed(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        key: &str,
        now: Instant,
    ) {
        let FeatureManager {
            features,
            order,
            videos,
            timers,
            writes,
            errors,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            let in_namespace = key
                .strip_prefix(desc.id.as_str())
                .is_some_and(|rest| rest.starts_with('.'));
            if !(in_namespace && desc.enabled && desc.active) {
                continue;
            }
            let FeatureDescriptor {
                id,
                priority,
                instance,
                resources,
                ..
            } = &mut *desc;
            let result = {
                let mut ctx = scope.context(id, *priority, None, resources);
                instance.on_preference_changed(&mut ctx, key)
            };
            if let Err(source) = result {
                let e = LifecycleError::Preference {
                    feature: id.clone(),
                    source,
                };
                record(errors, desc, e);
            }
            for entry in videos.iter_mut() {
                let result = with_video_context(desc, entry, &mut scope, |processor, ctx| {
                    processor.on_preference_changed(ctx, key)
                });
                if let Some(Err(e)) = result {
                    record(errors, desc, e);
                }
            }
        }
    }

    /// Forwards a mutation batch to enabled features observing the DOM.
    pub fn dom_mutations(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        records: &[MutationRecord],
        now: Instant,
    ) {
        if records.is_empty() {
            return;
        }
        let FeatureManager {
            features,
            order,
            timers,
            writes,
            errors,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            if !(desc.enabled && desc.active) {
                continue;
            }
            let FeatureDescriptor {
                id,
                priority,
                instance,
                resources,
                ..
            } = &mut *desc;
            let Some(observer) = instance.dom_observer() else {
                continue;
            };
            let mut ctx = scope.context(id, *priority, None, resources);
            if let Err(source) = observer.on_mutations(&mut ctx, records) {
                let e = LifecycleError::Observation {
                    feature: id.clone(),
                    source,
                };
                record(errors, desc, e);
            }
        }
    }

    /// Routes a DOM event to the feature that registered its listener.
    /// Events for listeners removed since they were queued are dropped.
    pub fn dispatch_dom_event(
        &mut self,
        doc: &mut Document,
        settings: &SettingsSnapshot,
        event: &DomEvent,
        now: Instant,
    ) {
        if !doc.is_listener_live(event.listener) {
            return;
        }
        let FeatureManager {
            features,
            order,
            videos,
            timers,
            writes,
            errors,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            if !desc.resources.listeners().contains(&event.listener) {
                continue;
            }
            if desc.enabled && desc.active {
                let FeatureDescriptor {
                    id,
                    priority,
                    instance,
                    resources,
                    ..
                } = &mut *desc;
                let mut ctx = scope.context(id, *priority, None, resources);
                if let Err(source) = instance.on_event(&mut ctx, event) {
                    let e = LifecycleError::Observation {
                        feature: id.clone(),
                        source,
                    };
                    record(errors, desc, e);
                }
            }
            return;
        }

        for entry in videos.iter_mut() {
            for idx in order.iter() {
                let desc = &mut features[*idx];
                let owns = entry
                    .slot(&desc.id)
                    .is_some_and(|slot| slot.resources.listeners().contains(&event.listener));
                if !owns {
                    continue;
                }
                if desc.enabled && desc.active {
                    let result = with_video_context(desc, entry, &mut scope, |processor, ctx| {
                        processor.on_event(ctx, event)
                    });
                    if let Some(Err(e)) = result {
                        record(errors, desc, e);
                    }
                }
                return;
            }
        }
    }

    /// Fires due timers. A timer cleared before this point never reaches
    /// its feature, and neither does one whose owner was torn down.
    pub fn fire_due_timers(&mut self, doc: &mut Document, settings: &SettingsSnapshot, now: Instant) {
        let due = self.timers.take_due(now);
        if due.is_empty() {
            return;
        }

        let FeatureManager {
            features,
            videos,
            timers,
            writes,
            errors,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for (timer, owner) in due {
            let Some(desc) = features.iter_mut().find(|f| f.id == owner.feature) else {
                continue;
            };
            if !(desc.enabled && desc.active) {
                continue;
            }
            match owner.track {
                None => {
                    if !desc.resources.timers().contains(&timer) {
                        continue;
                    }
                    let FeatureDescriptor {
                        id,
                        priority,
                        instance,
                        resources,
                        ..
                    } = &mut *desc;
                    let result = {
                        let mut ctx = scope.context(id, *priority, None, resources);
                        instance.on_timer(&mut ctx, timer)
                    };
                    if !scope.timers.is_live(timer) {
                        resources.forget_timer(timer);
                    }
                    if let Err(source) = result {
                        let e = LifecycleError::Observation {
                            feature: id.clone(),
                            source,
                        };
                        record(errors, desc, e);
                    }
                }
                Some(track) => {
                    let Some(entry) = videos.get_mut(track) else {
                        continue;
                    };
                    let owns = entry
                        .slot(&desc.id)
                        .is_some_and(|slot| slot.resources.timers().contains(&timer));
                    if !owns {
                        continue;
                    }
                    let result = with_video_context(desc, entry, &mut scope, |processor, ctx| {
                        processor.on_timer(ctx, timer)
                    });
                    if !scope.timers.is_live(timer) {
                        if let Some(slot) = entry.slot_mut(&desc.id) {
                            slot.resources.forget_timer(timer);
                        }
                    }
                    if let Some(Err(e)) = result {
                        record(errors, desc, e);
                    }
                }
            }
        }
    }

    /// Page teardown: every feature is cleaned up, every video released.
    /// Failures are logged and never stop the remaining teardown.
    pub fn cleanup(&mut self, doc: &mut Document, settings: &SettingsSnapshot, now: Instant) {
        let FeatureManager {
            features,
            order,
            videos,
            timers,
            writes,
            errors,
            initialized,
            ..
        } = self;
        let mut scope = Scope {
            doc,
            settings,
            timers,
            writes,
            now,
        };

        for idx in order.iter() {
            let desc = &mut features[*idx];
            for e in deactivate(desc, videos, &mut scope) {
                record(errors, desc, e);
            }
        }

        let nodes: Vec<NodeId> = videos.iter().map(|entry| entry.node).collect();
        for node in nodes {
            videos.untrack(scope.doc, node);
        }
        scope.timers.clear_all();
        *initialized = false;
        info!("Feature manager cleaned up");
    }

    pub fn feature_states(&self) -> Vec<FeatureStatus> {
        self.order
            .iter()
            .map(|idx| {
                let f = &self.features[*idx];
                FeatureStatus {
                    id: f.id.clone(),
                    priority: f.priority,
                    enabled: f.enabled,
                    active: f.active,
                    default_enabled: f.default_enabled,
                    uses_video_observer: f.uses_video_observer,
                    attached_videos: self
                        .videos
                        .iter()
                        .filter(|entry| entry.slot(&f.id).is_some_and(|s| s.attached))
                        .count(),
                    last_error: f.last_error.clone(),
                }
            })
            .collect()
    }
}

fn record(errors: &mut VecDeque<LifecycleError>, desc: &mut FeatureDescriptor, error: LifecycleError) {
    warn!("{}", error);
    desc.last_error = Some(error.to_string());
    if errors.len() == ERROR_HISTORY {
        errors.pop_front();
    }
    errors.push_back(error);
}

fn activate(desc: &mut FeatureDescriptor, scope: &mut Scope<'_>) -> Result<(), LifecycleError> {
    if desc.active {
        return Ok(());
    }
    let FeatureDescriptor {
        id,
        priority,
        instance,
        resources,
        ..
    } = &mut *desc;

    let result = {
        let mut ctx = scope.context(id, *priority, None, resources);
        let mut result = instance.initialize(&mut ctx);
        if result.is_ok() {
            if let Some(effect) = instance.global_effect() {
                result = effect.apply(&mut ctx);
            }
        }
        result
    };

    match result {
        Ok(()) => {
            desc.active = true;
            debug!("Feature '{}' initialized", desc.id);
            Ok(())
        }
        Err(source) => {
            resources.release(scope.doc, scope.timers);
            Err(LifecycleError::Initialization {
                feature: id.clone(),
                source,
            })
        }
    }
}

fn deactivate(
    desc: &mut FeatureDescriptor,
    videos: &mut VideoStateMap,
    scope: &mut Scope<'_>,
) -> Vec<LifecycleError> {
    let mut errors = Vec::new();
    for entry in videos.iter_mut() {
        if let Some(e) = release_slot(desc, entry, scope) {
            errors.push(e);
        }
    }

    let FeatureDescriptor {
        id,
        priority,
        instance,
        resources,
        active,
        ..
    } = &mut *desc;
    if *active {
        let mut ctx = scope.context(id, *priority, None, resources);
        if let Some(effect) = instance.global_effect() {
            if let Err(source) = effect.revert(&mut ctx) {
                errors.push(LifecycleError::Cleanup {
                    feature: id.clone(),
                    source,
                });
            }
        }
        if let Err(source) = instance.cleanup(&mut ctx) {
            errors.push(LifecycleError::Cleanup {
                feature: id.clone(),
                source,
            });
        }
    }
    resources.release(scope.doc, scope.timers);
    *active = false;
    errors
}

/// Runs `process_video` for one (feature, video) pair. `Ok(true)` means the
/// feature newly attached; already-attached and suppressed pairs are `Ok(false)`.
fn process_slot(
    desc: &mut FeatureDescriptor,
    entry: &mut TrackedVideo,
    scope: &mut Scope<'_>,
    max_failures: u32,
) -> Result<bool, LifecycleError> {
    let FeatureDescriptor {
        id,
        priority,
        instance,
        ..
    } = &mut *desc;
    let Some(processor) = instance.video_processor() else {
        return Ok(false);
    };
    let (node, track) = (entry.node, entry.track_id);
    let slot = entry.slot_or_default(id);
    if slot.attached {
        return Ok(false);
    }
    if slot.failures >= max_failures {
        debug!("Skipping '{}' on video #{} after {} failures", id, track, slot.failures);
        return Ok(false);
    }

    let result = {
        let ctx = scope.context(id, *priority, Some(track), &mut slot.resources);
        let mut ctx = VideoContext::new(ctx, node, track);
        processor.process_video(&mut ctx)
    };

    match result {
        Ok(()) => {
            slot.attached = true;
            Ok(true)
        }
        Err(source) => {
            slot.failures += 1;
            slot.resources.release(scope.doc, scope.timers);
            Err(LifecycleError::Processing {
                feature: id.clone(),
                track,
                source,
            })
        }
    }
}

/// Runs the feature's `on_cleanup` for one video if it attached, then
/// releases and drops the slot.
fn release_slot(
    desc: &mut FeatureDescriptor,
    entry: &mut TrackedVideo,
    scope: &mut Scope<'_>,
) -> Option<LifecycleError> {
    let FeatureDescriptor {
        id,
        priority,
        instance,
        ..
    } = &mut *desc;
    let (node, track) = (entry.node, entry.track_id);
    let mut slot = entry.remove_slot(id)?;

    let mut error = None;
    if slot.attached {
        if let Some(processor) = instance.video_processor() {
            let ctx = scope.context(id, *priority, Some(track), &mut slot.resources);
            let mut ctx = VideoContext::new(ctx, node, track);
            if let Err(source) = processor.on_cleanup(&mut ctx) {
                error = Some(LifecycleError::Cleanup {
                    feature: id.clone(),
                    source,
                });
            }
        }
    }
    slot.resources.release(scope.doc, scope.timers);
    error
}

/// Calls `f` with the feature's processor and a context for an attached
/// video. `None` when the feature has no processor or never attached.
fn with_video_context<F>(
    desc: &mut FeatureDescriptor,
    entry: &mut TrackedVideo,
    scope: &mut Scope<'_>,
    f: F,
) -> Option<Result<(), LifecycleError>>
where
    F: FnOnce(&mut dyn VideoProcessor, &mut VideoContext<'_>) -> Result<(), FeatureError>,
{
    let FeatureDescriptor {
        id,
        priority,
        instance,
        ..
    } = &mut *desc;
    let processor = instance.video_processor()?;
    let (node, track) = (entry.node, entry.track_id);
    let slot = entry.slot_mut(id)?;
    if !slot.attached {
        return None;
    }
    let ctx = scope.context(id, *priority, Some(track), &mut slot.resources);
    let mut ctx = VideoContext::new(ctx, node, track);
    Some(f(processor, &mut ctx).map_err(|source| LifecycleError::Processing {
        feature: id.clone(),
        track,
        source,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Injects one marked node next to each video and logs every hook.
    struct Probe {
        name: &'static str,
        log: Log,
        fail_process: bool,
        fail_init: bool,
        fail_cleanup: bool,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Rc::clone(log),
                fail_process: false,
                fail_init: false,
                fail_cleanup: false,
            }
        }
    }

    impl Feature for Probe {
        fn initialize(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
            self.log.borrow_mut().push(format!("{}:init", self.name));
            if self.fail_init {
                return Err(FeatureError::failed("init exploded"));
            }
            Ok(())
        }

        fn cleanup(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
            self.log.borrow_mut().push(format!("{}:cleanup", self.name));
            if self.fail_cleanup {
                return Err(FeatureError::failed("cleanup exploded"));
            }
            Ok(())
        }

        fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
            Some(self)
        }
    }

    impl VideoProcessor for Probe {
        fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
            self.log
                .borrow_mut()
                .push(format!("{}:process:{}", self.name, ctx.track_id()));
            let marker = ctx.marker();
            let node = ctx.doc_mut().create_element("span");
            ctx.doc_mut().set_attribute(node, &marker, "")?;
            let container = ctx.container()?;
            ctx.inject(container, node, None)?;
            let video = ctx.video();
            ctx.listen(video, "play")?;
            if self.fail_process {
                return Err(FeatureError::failed("process exploded"));
            }
            Ok(())
        }

        fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
            self.log
                .borrow_mut()
                .push(format!("{}:video_cleanup:{}", self.name, ctx.track_id()));
            if self.fail_cleanup {
                return Err(FeatureError::failed("video cleanup exploded"));
            }
            Ok(())
        }
    }

    fn page() -> (Document, NodeId) {
        let mut doc = Document::new();
        let body = doc.body();
        let video = doc.create_element("video");
        doc.append_child(body, video).unwrap();
        (doc, video)
    }

    #[test]
    fn test_registration_errors() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("a", Probe::new("a", &log), FeatureOptions::new(1)).unwrap();
        assert_eq!(
            manager
                .register("a", Probe::new("a", &log), FeatureOptions::new(2))
                .err(),
            Some(RegistrationError::DuplicateId("a".to_string()))
        );
        assert!(matches!(
            manager.register("Bad-Id", Probe::new("b", &log), FeatureOptions::new(1)),
            Err(RegistrationError::InvalidId(_))
        ));

        let (mut doc, _) = page();
        manager.initialize(&mut doc, &SettingsSnapshot::default(), Instant::now());
        assert!(matches!(
            manager.register("late", Probe::new("late", &log), FeatureOptions::new(1)),
            Err(RegistrationError::AfterInitialize(_))
        ));
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("first", Probe::new("first", &log), FeatureOptions::new(5)).unwrap();
        manager.register("top", Probe::new("top", &log), FeatureOptions::new(9)).unwrap();
        manager.register("second", Probe::new("second", &log), FeatureOptions::new(5)).unwrap();
        assert_eq!(manager.feature_ids(), vec!["top", "first", "second"]);
    }

    #[test]
    fn test_repeated_appearance_is_idempotent() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("a", Probe::new("a", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);

        manager.video_appeared(&mut doc, &settings, video, now);
        manager.video_appeared(&mut doc, &settings, video, now);
        let processed = log.borrow().iter().filter(|l| l.contains(":process:")).count();
        assert_eq!(processed, 1);
        assert_eq!(doc.children(doc.body()).len(), 2);
        assert!(manager.is_attached("a", video));
    }

    #[test]
    fn test_failure_is_isolated_and_not_retried() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        let mut broken = Probe::new("broken", &log);
        broken.fail_process = true;
        manager.register("broken", broken, FeatureOptions::new(2)).unwrap();
        manager.register("fine", Probe::new("fine", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);

        manager.video_appeared(&mut doc, &settings, video, now);
        manager.video_appeared(&mut doc, &settings, video, now);

        assert!(manager.is_attached("fine", video));
        assert!(!manager.is_attached("broken", video));
        assert!(!doc.has_attribute(doc.children(doc.body())[1], "data-reel-broken"));
        assert_eq!(doc.listener_count(), 1);
        let attempts = log.borrow().iter().filter(|l| l.starts_with("broken:process")).count();
        assert_eq!(attempts, 1);
        assert_eq!(manager.recent_errors().count(), 1);
        let states = manager.feature_states();
        assert!(states[0].last_error.as_deref().is_some_and(|e| e.contains("process exploded")));
    }

    #[test]
    fn test_failed_initialization_leaves_others_running() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        let mut broken = Probe::new("broken", &log);
        broken.fail_init = true;
        manager.register("broken", broken, FeatureOptions::new(2)).unwrap();
        manager.register("fine", Probe::new("fine", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        manager.video_appeared(&mut doc, &settings, video, now);

        assert!(!manager.is_active("broken"));
        assert!(manager.is_active("fine"));
        assert!(manager.is_attached("fine", video));
        assert!(matches!(
            manager.recent_errors().next(),
            Some(LifecycleError::Initialization { .. })
        ));
    }

    #[test]
    fn test_disable_runs_video_cleanup_before_feature_cleanup() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("a", Probe::new("a", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        manager.video_appeared(&mut doc, &settings, video, now);
        log.borrow_mut().clear();

        assert!(manager.set_feature_enabled(&mut doc, &settings, "a", false, now).unwrap());
        assert!(!manager.set_feature_enabled(&mut doc, &settings, "a", false, now).unwrap());
        assert_eq!(*log.borrow(), vec!["a:video_cleanup:1", "a:cleanup"]);
        assert_eq!(doc.children(doc.body()), &[video]);
        assert_eq!(doc.listener_count(), 0);
        assert!(matches!(
            manager.set_feature_enabled(&mut doc, &settings, "missing", true, now),
            Err(ManagerError::UnknownFeature(_))
        ));
    }

    #[test]
    fn test_disappearance_drops_entry() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("a", Probe::new("a", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        manager.video_appeared(&mut doc, &settings, video, now);
        assert_eq!(doc.attribute(video, crate::core::state::TRACK_ATTRIBUTE), Some("1"));

        doc.remove(video).unwrap();
        manager.video_disappeared(&mut doc, &settings, video, now);
        assert!(manager.videos().is_empty());
        assert!(!doc.has_attribute(video, crate::core::state::TRACK_ATTRIBUTE));
        assert!(log.borrow().contains(&"a:video_cleanup:1".to_string()));
    }

    #[test]
    fn test_failure_cap_allows_that_many_attempts() {
        let log = Log::default();
        let mut manager = FeatureManager::new().with_max_processing_failures(3);
        let mut broken = Probe::new("broken", &log);
        broken.fail_process = true;
        manager.register("broken", broken, FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);

        for _ in 0..5 {
            manager.video_appeared(&mut doc, &settings, video, now);
        }
        let attempts = log.borrow().iter().filter(|l| l.starts_with("broken:process")).count();
        assert_eq!(attempts, 3);
        assert_eq!(manager.max_processing_failures(), 3);
        assert_eq!(doc.children(doc.body()), &[video]);
        assert_eq!(doc.listener_count(), 0);
        assert_eq!(FeatureManager::new().with_max_processing_failures(0).max_processing_failures(), 1);
    }

    #[test]
    fn test_failing_teardown_does_not_stop_the_rest() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        let mut stubborn = Probe::new("stubborn", &log);
        stubborn.fail_cleanup = true;
        manager.register("stubborn", stubborn, FeatureOptions::new(2)).unwrap();
        manager.register("fine", Probe::new("fine", &log), FeatureOptions::new(1)).unwrap();
        let (mut doc, video) = page();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        manager.video_appeared(&mut doc, &settings, video, now);
        assert_eq!(doc.children(doc.body()).len(), 3);
        assert_eq!(doc.listener_count(), 2);

        assert!(manager.set_feature_enabled(&mut doc, &settings, "stubborn", false, now).unwrap());
        assert!(!manager.is_active("stubborn"));
        assert_eq!(doc.children(doc.body()).len(), 2);
        assert_eq!(doc.listener_count(), 1);
        let cleanup_errors = manager
            .recent_errors()
            .filter(|e| matches!(e, LifecycleError::Cleanup { .. }))
            .count();
        assert_eq!(cleanup_errors, 2);

        manager.set_feature_enabled(&mut doc, &settings, "stubborn", true, now).unwrap();
        manager.cleanup(&mut doc, &settings, now);
        assert_eq!(doc.children(doc.body()), &[video]);
        assert_eq!(doc.listener_count(), 0);
        assert!(manager.videos().is_empty());
        assert!(log.borrow().contains(&"fine:video_cleanup:1".to_string()));
        assert!(log.borrow().contains(&"fine:cleanup".to_string()));
        let cleanup_errors = manager
            .recent_errors()
            .filter(|e| matches!(e, LifecycleError::Cleanup { feature, .. } if feature == "stubborn"))
            .count();
        assert_eq!(cleanup_errors, 4);
    }

    #[test]
    fn test_moved_video_takes_its_nodes_along() {
        let log = Log::default();
        let mut manager = FeatureManager::new();
        manager.register("a", Probe::new("a", &log), FeatureOptions::new(1)).unwrap();
        let mut doc = Document::new();
        let body = doc.body();
        let first = doc.create_element("div");
        let second = doc.create_element("div");
        let video = doc.create_element("video");
        doc.append_child(body, first).unwrap();
        doc.append_child(body, second).unwrap();
        doc.append_child(first, video).unwrap();
        let settings = SettingsSnapshot::default();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        manager.video_appeared(&mut doc, &settings, video, now);
        let injected = doc.children(first)[1];

        doc.append_child(second, video).unwrap();
        manager.handle_video_event(&mut doc, &settings, VideoEvent::Moved { video, from: first }, now);
        assert!(doc.children(first).is_empty());
        assert_eq!(doc.children(second), &[video, injected]);
    }
}
