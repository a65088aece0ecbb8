//! Per-video bookkeeping.
//!
//! Every tracked video gets a synthetic [`TrackId`], written to the node as
//! [`TRACK_ATTRIBUTE`], and an arena entry holding one [`FeatureSlot`] per
//! feature that touched it. The arena stores plain [`NodeId`] handles and
//! never owns DOM nodes; entries are dropped once removal is confirmed.

use crate::core::timers::{TimerId, TimerQueue};
use crate::dom::{Document, ListenerId, NodeId};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub type TrackId = u64;

pub const TRACK_ATTRIBUTE: &str = "data-reel-track";

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttributeRestore {
    node: NodeId,
    name: String,
    previous: Option<String>,
}

/// Everything a feature attached in one scope (a video or the page).
#[derive(Debug, Default)]
pub struct Resources {
    nodes: Vec<NodeId>,
    shared: Vec<NodeId>,
    listeners: Vec<ListenerId>,
    timers: Vec<TimerId>,
    attributes: Vec<AttributeRestore>,
    saved: BTreeMap<String, String>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.listeners.is_empty()
            && self.timers.is_empty()
            && self.attributes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn shared(&self) -> &[NodeId] {
        &self.shared
    }

    pub fn listeners(&self) -> &[ListenerId] {
        &self.listeners
    }

    pub fn timers(&self) -> &[TimerId] {
        &self.timers
    }

    pub(crate) fn push_node(&mut self, node: NodeId) {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    pub(crate) fn push_shared(&mut self, node: NodeId) {
        if !self.shared.contains(&node) {
            self.shared.push(node);
        }
    }

    pub(crate) fn push_listener(&mut self, listener: ListenerId) {
        self.listeners.push(listener);
    }

    pub(crate) fn push_timer(&mut self, timer: TimerId) {
        self.timers.push(timer);
    }

    pub(crate) fn forget_timer(&mut self, timer: TimerId) {
        self.timers.retain(|t| *t != timer);
    }

    pub(crate) fn forget_node(&mut self, node: NodeId) {
        self.nodes.retain(|n| *n != node);
    }

    /// Remembers the value an attribute had before the first write through
    /// this scope, so release can put it back.
    pub(crate) fn note_attribute(&mut self, node: NodeId, name: &str, previous: Option<String>) {
        if !self
            .attributes
            .iter()
            .any(|a| a.node == node && a.name == name)
        {
            self.attributes.push(AttributeRestore {
                node,
                name: name.to_string(),
                previous,
            });
        }
    }

    pub fn saved(&self, key: &str) -> Option<&str> {
        self.saved.get(key).map(String::as_str)
    }

    pub(crate) fn save(&mut self, key: &str, value: String) {
        self.saved.insert(key.to_string(), value);
    }

    pub(crate) fn take_saved(&mut self, key: &str) -> Option<String> {
        self.saved.remove(key)
    }

    /// Puts back every attribute written through this scope, newest first.
    pub fn restore_attributes(&mut self, doc: &mut Document) {
        for restore in self.attributes.drain(..).rev() {
            let result = match &restore.previous {
                Some(value) => doc.set_attribute(restore.node, &restore.name, value),
                None => doc.remove_attribute(restore.node, &restore.name),
            };
            if let Err(e) = result {
                debug!("Could not restore attribute '{}': {}", restore.name, e);
            }
        }
    }

    /// Drops handles to nodes the document has reclaimed.
    pub fn forget_reclaimed(&mut self, doc: &Document) {
        self.nodes.retain(|node| doc.exists(*node));
        self.shared.retain(|node| doc.exists(*node));
        self.attributes.retain(|restore| doc.exists(restore.node));
    }

    /// Releases everything still registered: injected nodes are detached,
    /// listeners removed, timers cleared and attributes restored. Shared
    /// containers are detached once they have no children left.
    pub fn release(&mut self, doc: &mut Document, timers: &mut TimerQueue) {
        for timer in self.timers.drain(..) {
            timers.clear(timer);
        }
        for listener in self.listeners.drain(..) {
            doc.remove_event_listener(listener);
        }
        for node in self.nodes.drain(..).rev() {
            if let Err(e) = doc.remove(node) {
                debug!("Injected node already gone: {}", e);
            }
        }
        self.restore_attributes(doc);
        for container in self.shared.drain(..) {
            if doc.exists(container) && doc.children(container).is_empty() {
                if let Err(e) = doc.remove(container) {
                    debug!("Shared container already gone: {}", e);
                }
            }
        }
        self.saved.clear();
    }
}

/// State one feature keeps for one video.
#[derive(Debug, Default)]
pub struct FeatureSlot {
    /// Set once `process_video` succeeded; repeated delivery is a no-op.
    pub attached: bool,
    pub failures: u32,
    pub resources: Resources,
}

#[derive(Debug)]
pub struct TrackedVideo {
    pub node: NodeId,
    pub track_id: TrackId,
    slots: BTreeMap<String, FeatureSlot>,
}

impl TrackedVideo {
    pub fn slot(&self, feature: &str) -> Option<&FeatureSlot> {
        self.slots.get(feature)
    }

    pub fn slot_mut(&mut self, feature: &str) -> Option<&mut FeatureSlot> {
        self.slots.get_mut(feature)
    }

    pub fn slot_or_default(&mut self, feature: &str) -> &mut FeatureSlot {
        self.slots.entry(feature.to_string()).or_default()
    }

    pub fn remove_slot(&mut self, feature: &str) -> Option<FeatureSlot> {
        self.slots.remove(feature)
    }

    /// Nodes the video's slots injected or share, without duplicates.
    pub fn held_nodes(&self) -> Vec<NodeId> {
        let mut held: Vec<NodeId> = Vec::new();
        for slot in self.slots.values() {
            for node in slot.resources.nodes().iter().chain(slot.resources.shared()) {
                if !held.contains(node) {
                    held.push(*node);
                }
            }
        }
        held
    }

    pub fn forget_reclaimed(&mut self, doc: &Document) {
        for slot in self.slots.values_mut() {
            slot.resources.forget_reclaimed(doc);
        }
    }

    pub fn attached_features(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .filter(|(_, s)| s.attached)
            .map(|(id, _)| id.as_str())
    }
}

#[derive(Debug, Default)]
pub struct VideoStateMap {
    entries: BTreeMap<TrackId, TrackedVideo>,
    by_node: HashMap<NodeId, TrackId>,
    next_id: TrackId,
}

impl VideoStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the video's track id, creating the entry on first sight.
    pub fn track(&mut self, doc: &mut Document, node: NodeId) -> TrackId {
        if let Some(id) = self.by_node.get(&node) {
            return *id;
        }
        self.next_id += 1;
        let track_id = self.next_id;
        if let Err(e) = doc.set_attribute(node, TRACK_ATTRIBUTE, &track_id.to_string()) {
            debug!("Could not mark video #{}: {}", track_id, e);
        }
        self.by_node.insert(node, track_id);
        self.entries.insert(
            track_id,
            TrackedVideo {
                node,
                track_id,
                slots: BTreeMap::new(),
            },
        );
        track_id
    }

    pub fn track_id(&self, node: NodeId) -> Option<TrackId> {
        self.by_node.get(&node).copied()
    }

    pub fn get(&self, track_id: TrackId) -> Option<&TrackedVideo> {
        self.entries.get(&track_id)
    }

    pub fn get_mut(&mut self, track_id: TrackId) -> Option<&mut TrackedVideo> {
        self.entries.get_mut(&track_id)
    }

    pub fn untrack(&mut self, doc: &mut Document, node: NodeId) -> Option<TrackedVideo> {
        let track_id = self.by_node.remove(&node)?;
        if let Err(e) = doc.remove_attribute(node, TRACK_ATTRIBUTE) {
            debug!("Could not unmark video #{}: {}", track_id, e);
        }
        self.entries.remove(&track_id)
    }

    /// Track ids in first-seen order.
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedVideo> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedVideo> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
