use crate::dom::{DomError, Document, MutationRecord, NodeId, Selector};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_REMOVAL_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    Appeared(NodeId),
    Disappeared(NodeId),
    /// A tracked video came back within the debounce window under a
    /// different parent than `from`.
    Moved { video: NodeId, from: NodeId },
}

#[derive(Debug, Clone, Copy)]
struct PendingRemoval {
    deadline: Instant,
    /// The video's parent when it left.
    from: Option<NodeId>,
}

/// Turns mutation records into a deduplicated stream of video
/// appearances and disappearances under one root.
///
/// Removals are only confirmed after the debounce window so a video the
/// page moves (remove + re-insert) within the window keeps its identity;
/// only a change of parent is reported, as [`VideoEvent::Moved`].
#[derive(Debug)]
pub struct VideoObserver {
    selector: Selector,
    removal_debounce: Duration,
    root: Option<NodeId>,
    tracked: BTreeSet<NodeId>,
    pending_removal: BTreeMap<NodeId, PendingRemoval>,
}

impl VideoObserver {
    pub fn new(selector: &str, removal_debounce: Duration) -> Result<Self, DomError> {
        Ok(Self {
            selector: Selector::parse(selector)?,
            removal_debounce,
            root: None,
            tracked: BTreeSet::new(),
            pending_removal: BTreeMap::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn is_tracking(&self, node: NodeId) -> bool {
        self.tracked.contains(&node)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Nodes the observer still refers to: tracked videos and the parents
    /// pending removals left.
    pub fn held_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.tracked
            .iter()
            .copied()
            .chain(self.pending_removal.values().filter_map(|p| p.from))
    }

    /// Starts observing `root`, reporting videos that already exist.
    /// Calling it while running only reports videos not yet seen.
    pub fn start(&mut self, doc: &Document, root: NodeId) -> Result<Vec<VideoEvent>, DomError> {
        if !doc.exists(root) {
            return Err(DomError::UnknownNode(root));
        }
        if self.root.is_some_and(|current| current != root) {
            self.stop();
        }
        self.root = Some(root);

        let mut events = Vec::new();
        for video in doc.select_inclusive(root, &self.selector) {
            if self.tracked.insert(video) {
                events.push(VideoEvent::Appeared(video));
            }
        }
        debug!("Video observer started with {} existing videos", events.len());
        Ok(events)
    }

    /// Stops observing. Safe to call repeatedly; no events follow.
    pub fn stop(&mut self) {
        if self.root.take().is_some() {
            debug!("Video observer stopped ({} tracked)", self.tracked.len());
        }
        self.tracked.clear();
        self.pending_removal.clear();
    }

    fn is_observed(&self, doc: &Document, node: NodeId) -> bool {
        match self.root {
            Some(root) => doc.is_connected(node) && doc.is_inclusive_descendant(node, root),
            None => false,
        }
    }

    pub fn process_records(
        &mut self,
        doc: &Document,
        records: &[MutationRecord],
        now: Instant,
    ) -> Vec<VideoEvent> {
        if self.root.is_none() {
            return Vec::new();
        }

        let mut events = Vec::new();
        for record in records {
            let MutationRecord::ChildList {
                target,
                added,
                removed,
            } = record
            else {
                continue;
            };
            if !doc.exists(*target) {
                warn!("Skipping mutation record for unknown target {:?}", target);
                continue;
            }

            for node in removed {
                if !doc.exists(*node) {
                    warn!("Skipping removed node {:?} unknown to the document", node);
                    continue;
                }
                self.note_removed_subtree(doc, *target, *node, now);
            }

            for node in added {
                if !doc.exists(*node) {
                    warn!("Skipping added node {:?} unknown to the document", node);
                    continue;
                }
                if !doc.is_element(*node) || !self.is_observed(doc, *node) {
                    continue;
                }
                for video in doc.select_inclusive(*node, &self.selector) {
                    if let Some(pending) = self.pending_removal.remove(&video) {
                        if self.tracked.contains(&video) {
                            events.extend(moved(doc, video, pending));
                            continue;
                        }
                    }
                    if self.tracked.insert(video) {
                        events.push(VideoEvent::Appeared(video));
                    }
                }
            }
        }
        events
    }

    /// `node` was removed from `parent`; every tracked video inside it
    /// starts its removal window.
    fn note_removed_subtree(&mut self, doc: &Document, parent: NodeId, node: NodeId, now: Instant) {
        let deadline = now + self.removal_debounce;
        let candidates: Vec<NodeId> = self
            .tracked
            .iter()
            .copied()
            .filter(|video| doc.is_inclusive_descendant(*video, node))
            .collect();
        for video in candidates {
            let from = if video == node {
                Some(parent)
            } else {
                doc.parent(video)
            };
            self.pending_removal
                .entry(video)
                .or_insert(PendingRemoval { deadline, from });
        }
    }

    /// Confirms removals whose window has elapsed.
    pub fn flush(&mut self, doc: &Document, now: Instant) -> Vec<VideoEvent> {
        let due: Vec<NodeId> = self
            .pending_removal
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(node, _)| *node)
            .collect();

        let mut events = Vec::new();
        for video in due {
            let Some(pending) = self.pending_removal.remove(&video) else {
                continue;
            };
            if self.is_observed(doc, video) {
                events.extend(moved(doc, video, pending));
                continue;
            }
            if self.tracked.remove(&video) {
                events.push(VideoEvent::Disappeared(video));
            }
        }
        events
    }

    /// Full re-scan of the root: reports videos the records never mentioned
    /// and queues tracked videos that left without a record.
    pub fn rescan(&mut self, doc: &Document, now: Instant) -> Vec<VideoEvent> {
        let Some(root) = self.root else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if doc.is_connected(root) {
            for video in doc.select_inclusive(root, &self.selector) {
                if self.tracked.insert(video) {
                    events.push(VideoEvent::Appeared(video));
                }
            }
        }

        let deadline = now + self.removal_debounce;
        let lost: Vec<NodeId> = self
            .tracked
            .iter()
            .copied()
            .filter(|video| !self.is_observed(doc, *video))
            .collect();
        for video in lost {
            let from = doc.parent(video);
            self.pending_removal
                .entry(video)
                .or_insert(PendingRemoval { deadline, from });
        }
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_removal.values().map(|p| p.deadline).min()
    }
}

fn moved(doc: &Document, video: NodeId, pending: PendingRemoval) -> Option<VideoEvent> {
    let from = pending.from?;
    (doc.parent(video) != Some(from)).then_some(VideoEvent::Moved { video, from })
}
