//! In-process model of the host page.
//!
//! The document is an arena of nodes addressed by [`NodeId`]. A node's
//! identity is stable while it is alive, even after it leaves the tree.
//! Detached subtrees nothing holds are reclaimed with
//! [`Document::reclaim_detached`]; their slots are reused under a new
//! generation, so a stale id never resolves to a different node.
//! Structural and attribute changes are journaled as [`MutationRecord`]s and
//! listener dispatches as [`DomEvent`]s; both are drained by the page context.

pub mod selector;

pub use selector::Selector;

use selector::Compound;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Rebuilds an id from [`NodeId::raw`]. Host adapters use this when
    /// relaying records; a value the document never handed out is unknown.
    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    pub fn raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("node {0:?} is not an element")]
    NotAnElement(NodeId),
    #[error("node {child:?} is not a child of {parent:?}")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("inserting {child:?} into {parent:?} would create a cycle")]
    HierarchyRequest { parent: NodeId, child: NodeId },
    #[error("unsupported selector: {0}")]
    UnsupportedSelector(String),
}

/// Playback state carried by `<video>` and `<audio>` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    pub playback_rate: f64,
    pub volume: f64,
    pub muted: bool,
    pub paused: bool,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub picture_in_picture: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            playback_rate: 1.0,
            volume: 1.0,
            muted: false,
            paused: true,
            current_time: 0.0,
            duration: None,
            picture_in_picture: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Element {
    tag_name: String,
    attrs: BTreeMap<String, String>,
    media: Option<MediaState>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    ChildList {
        target: NodeId,
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    Attributes {
        target: NodeId,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomEvent {
    pub target: NodeId,
    pub event_type: String,
    pub listener: ListenerId,
}

#[derive(Debug, Clone)]
struct Listener {
    target: NodeId,
    event_type: String,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Roots of subtrees without a parent, candidates for reclamation.
    detached: BTreeSet<NodeId>,
    pinned: BTreeSet<NodeId>,
    root: NodeId,
    body: NodeId,
    records: Vec<MutationRecord>,
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener: u64,
    events: VecDeque<DomEvent>,
    hidden: bool,
    scroll_target: Option<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Document,
        };
        let root_id = NodeId {
            index: 0,
            generation: 0,
        };
        let mut doc = Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(root),
            }],
            free: Vec::new(),
            detached: BTreeSet::new(),
            pinned: BTreeSet::new(),
            root: root_id,
            body: root_id,
            records: Vec::new(),
            listeners: BTreeMap::new(),
            next_listener: 1,
            events: VecDeque::new(),
            hidden: false,
            scroll_target: None,
        };
        let body = doc.alloc(NodeKind::Element(Element {
            tag_name: "body".to_string(),
            attrs: BTreeMap::new(),
            media: None,
        }));
        if let Some(node) = doc.slot_node_mut(body) {
            node.parent = Some(root_id);
        }
        if let Some(node) = doc.slot_node_mut(root_id) {
            node.children.push(body);
        }
        doc.detached.remove(&body);
        doc.body = body;
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let node = Node {
            parent: None,
            children: Vec::new(),
            kind,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.detached.insert(id);
        id
    }

    fn slot_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn node(&self, id: NodeId) -> Result<&Node, DomError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(DomError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, DomError> {
        self.slot_node_mut(id).ok_or(DomError::UnknownNode(id))
    }

    fn element(&self, id: NodeId) -> Result<&Element, DomError> {
        match &self.node(id)?.kind {
            NodeKind::Element(element) => Ok(element),
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Result<&mut Element, DomError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Element(element) => Ok(element),
            _ => Err(DomError::NotAnElement(id)),
        }
    }

    /// Creates a detached element. Media tags get a default [`MediaState`].
    pub fn create_element(&mut self, tag_name: &str) -> NodeId {
        let tag_name = tag_name.to_ascii_lowercase();
        let media = matches!(tag_name.as_str(), "video" | "audio").then(MediaState::default);
        self.alloc(NodeKind::Element(Element {
            tag_name,
            attrs: BTreeMap::new(),
            media,
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeKind::Text(text.to_string()))
    }

    pub fn exists(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    /// Live nodes, attached or not.
    pub fn node_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Slots allocated so far, free ones included.
    pub fn arena_len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_ok()
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).ok().map(|e| e.tag_name.as_str())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// True when `node` is `ancestor` or lies beneath it.
    pub fn is_inclusive_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.exists(id) && self.is_inclusive_descendant(id, self.root)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.insert_before(parent, child, None)
    }

    /// Inserts `child` under `parent` before `reference`, or last when
    /// `reference` is `None`. A child that already has a parent is moved.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), DomError> {
        self.node(parent)?;
        self.node(child)?;
        if matches!(self.node(parent)?.kind, NodeKind::Text(_)) {
            return Err(DomError::NotAnElement(parent));
        }
        if child == self.root || self.is_inclusive_descendant(parent, child) {
            return Err(DomError::HierarchyRequest { parent, child });
        }
        if let Some(reference) = reference {
            if self.parent(reference) != Some(parent) {
                return Err(DomError::NotAChild {
                    parent,
                    child: reference,
                });
            }
        }

        if let Some(old_parent) = self.parent(child) {
            self.remove_child(old_parent, child)?;
        }

        let siblings = &mut self.node_mut(parent)?.children;
        let position = reference
            .and_then(|r| siblings.iter().position(|c| *c == r))
            .unwrap_or(siblings.len());
        siblings.insert(position, child);
        self.node_mut(child)?.parent = Some(parent);
        self.detached.remove(&child);
        self.records.push(MutationRecord::ChildList {
            target: parent,
            added: vec![child],
            removed: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let siblings = &mut self.node_mut(parent)?.children;
        let position = siblings
            .iter()
            .position(|c| *c == child)
            .ok_or(DomError::NotAChild { parent, child })?;
        siblings.remove(position);
        self.node_mut(child)?.parent = None;
        self.detached.insert(child);
        self.records.push(MutationRecord::ChildList {
            target: parent,
            added: Vec::new(),
            removed: vec![child],
        });
        Ok(())
    }

    /// Detaches `id` from its parent. Detached nodes are left untouched.
    pub fn remove(&mut self, id: NodeId) -> Result<(), DomError> {
        self.node(id)?;
        match self.parent(id) {
            Some(parent) => self.remove_child(parent, id),
            None => Ok(()),
        }
    }

    /// Removes every child of `id`, as assigning `innerHTML = ""` would.
    pub fn clear_children(&mut self, id: NodeId) -> Result<(), DomError> {
        let children = self.node(id)?.children.clone();
        for child in children {
            self.remove_child(id, child)?;
        }
        Ok(())
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)
            .ok()
            .and_then(|e| e.attrs.get(name))
            .map(String::as_str)
    }

    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.attribute(id, name).is_some()
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let name = name.to_ascii_lowercase();
        let element = self.element_mut(id)?;
        if element.attrs.get(&name).map(String::as_str) == Some(value) {
            return Ok(());
        }
        element.attrs.insert(name.clone(), value.to_string());
        self.records
            .push(MutationRecord::Attributes { target: id, name });
        Ok(())
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Result<(), DomError> {
        let name = name.to_ascii_lowercase();
        if self.element_mut(id)?.attrs.remove(&name).is_some() {
            self.records
                .push(MutationRecord::Attributes { target: id, name });
        }
        Ok(())
    }

    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        if let Ok(node) = self.node(id) {
            match &node.kind {
                NodeKind::Text(text) => out.push_str(text),
                _ => {
                    for child in &node.children {
                        self.collect_text(*child, out);
                    }
                }
            }
        }
    }

    /// Replaces the children of `id` with a single text node. A lone text
    /// child is rewritten in place.
    pub fn set_text_content(&mut self, id: NodeId, text: &str) -> Result<(), DomError> {
        let lone = match self.node(id)?.children.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        if let Some(only) = lone {
            if let NodeKind::Text(existing) = &mut self.node_mut(only)?.kind {
                if existing != text {
                    existing.clear();
                    existing.push_str(text);
                }
                return Ok(());
            }
        }
        self.clear_children(id)?;
        if text.is_empty() {
            return Ok(());
        }
        let text_node = self.create_text(text);
        self.append_child(id, text_node)
    }

    /// `id` and everything beneath it, in document order.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// Keeps `id` and any detached subtree containing it from being
    /// reclaimed until [`Document::unpin`].
    pub fn pin(&mut self, id: NodeId) -> Result<(), DomError> {
        self.node(id)?;
        self.pinned.insert(id);
        Ok(())
    }

    pub fn unpin(&mut self, id: NodeId) -> bool {
        self.pinned.remove(&id)
    }

    /// Frees every detached subtree that holds no node in `retained`, no
    /// pinned node and no listener target. Returns how many nodes were freed.
    pub fn reclaim_detached(&mut self, retained: &BTreeSet<NodeId>) -> usize {
        let listened: BTreeSet<NodeId> = self
            .listeners
            .values()
            .map(|l| l.target)
            .chain(self.pinned.iter().copied())
            .collect();
        let roots: Vec<NodeId> = self.detached.iter().copied().collect();
        let mut freed = 0;
        for root in roots {
            if !self.exists(root) || self.parent(root).is_some() {
                self.detached.remove(&root);
                continue;
            }
            let subtree = self.subtree(root);
            if subtree
                .iter()
                .any(|node| retained.contains(node) || listened.contains(node))
            {
                continue;
            }
            for node in subtree {
                self.free_slot(node);
                freed += 1;
            }
            self.detached.remove(&root);
        }
        if self.scroll_target.is_some_and(|target| !self.exists(target)) {
            self.scroll_target = None;
        }
        freed
    }

    fn free_slot(&mut self, id: NodeId) {
        let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
        else {
            return;
        };
        if slot.node.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
    }

    pub fn media(&self, id: NodeId) -> Option<&MediaState> {
        self.element(id).ok().and_then(|e| e.media.as_ref())
    }

    pub fn media_mut(&mut self, id: NodeId) -> Option<&mut MediaState> {
        self.element_mut(id).ok().and_then(|e| e.media.as_mut())
    }

    pub fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        selector
            .groups()
            .iter()
            .any(|chain| self.matches_chain(id, chain))
    }

    fn matches_chain(&self, id: NodeId, chain: &[Compound]) -> bool {
        let Some((last, rest)) = chain.split_last() else {
            return false;
        };
        if !self.matches_compound(id, last) {
            return false;
        }
        let mut remaining = rest;
        let mut ancestor = self.parent(id);
        while let Some((step, before)) = remaining.split_last() {
            loop {
                let Some(candidate) = ancestor else {
                    return false;
                };
                ancestor = self.parent(candidate);
                if self.matches_compound(candidate, step) {
                    break;
                }
            }
            remaining = before;
        }
        true
    }

    fn matches_compound(&self, id: NodeId, compound: &Compound) -> bool {
        let Ok(element) = self.element(id) else {
            return false;
        };
        if let Some(tag) = &compound.tag {
            if &element.tag_name != tag {
                return false;
            }
        }
        if let Some(expected) = &compound.id {
            if element.attrs.get("id") != Some(expected) {
                return false;
            }
        }
        if !compound.classes.is_empty() {
            let classes: Vec<&str> = element
                .attrs
                .get("class")
                .map(|c| c.split_whitespace().collect())
                .unwrap_or_default();
            if !compound.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }
        compound
            .attrs
            .iter()
            .all(|cond| cond.matches(element.attrs.get(&cond.name).map(String::as_str)))
    }

    /// Matching elements beneath `scope`, in document order, `scope` excluded.
    pub fn query_selector_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let mut out = Vec::new();
        for child in self.children(scope) {
            self.collect_matches(*child, selector, &mut out);
        }
        out
    }

    /// Like [`Document::query_selector_all`] but `scope` itself may match.
    pub fn select_inclusive(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_matches(scope, selector, &mut out);
        out
    }

    pub fn query_selector(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.query_selector_all(scope, selector).into_iter().next()
    }

    fn collect_matches(&self, id: NodeId, selector: &Selector, out: &mut Vec<NodeId>) {
        if self.matches(id, selector) {
            out.push(id);
        }
        for child in self.children(id) {
            self.collect_matches(*child, selector, out);
        }
    }

    pub fn add_event_listener(&mut self, target: NodeId, event_type: &str) -> Result<ListenerId, DomError> {
        self.node(target)?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(
            id,
            Listener {
                target,
                event_type: event_type.to_string(),
            },
        );
        Ok(id)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn listeners_on(&self, target: NodeId) -> usize {
        self.listeners.values().filter(|l| l.target == target).count()
    }

    /// Queues one [`DomEvent`] per listener registered for `event_type` on
    /// `target`. Returns how many listeners were notified.
    pub fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> usize {
        let matching: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|(_, l)| l.target == target && l.event_type == event_type)
            .map(|(id, _)| *id)
            .collect();
        let count = matching.len();
        for listener in matching {
            self.events.push_back(DomEvent {
                target,
                event_type: event_type.to_string(),
                listener,
            });
        }
        count
    }

    pub fn is_listener_live(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(&id)
    }

    pub fn has_pending_records(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn take_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }

    /// Appends a record supplied by a host adapter rather than produced by a
    /// local mutation.
    pub fn queue_record(&mut self, record: MutationRecord) {
        self.records.push(record);
    }

    pub fn take_events(&mut self) -> Vec<DomEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Toggles page visibility the way a tab switch does: the page pauses
    /// every playing media element when it becomes hidden.
    pub fn set_hidden(&mut self, hidden: bool) {
        if self.hidden == hidden {
            return;
        }
        self.hidden = hidden;
        self.dispatch_event(self.root, "visibilitychange");
        if hidden {
            let media: Vec<NodeId> = self
                .subtree(self.root)
                .into_iter()
                .filter(|id| self.media(*id).is_some_and(|m| !m.paused))
                .collect();
            for id in media {
                if let Some(state) = self.media_mut(id) {
                    state.paused = true;
                }
                self.dispatch_event(id, "pause");
            }
        }
    }

    pub fn scroll_into_view(&mut self, id: NodeId) -> Result<(), DomError> {
        self.node(id)?;
        self.scroll_target = Some(id);
        Ok(())
    }

    pub fn scroll_target(&self) -> Option<NodeId> {
        self.scroll_target
    }
}
