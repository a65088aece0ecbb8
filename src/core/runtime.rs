//! The page-context entry point.
//!
//! A [`PageContext`] owns the document, the video observer, the feature
//! manager and the settings snapshot. The embedder mutates the document and
//! calls [`PageContext::pump`], which plays the role of the mutation-observer
//! callback: it folds in settings changes and runtime messages, feeds
//! mutation records to the observer and features, fires due timers,
//! confirms removals and reclaims detached nodes nothing holds any more.
//! A detached node the embedder wants to keep across a pump must be pinned
//! with [`Document::pin`].

use crate::config::Config;
use crate::core::manager::FeatureManager;
use crate::core::messaging::{
    MessageReceiver, MessageRequest, MessageType, RuntimeMessage, SetFeatureStatePayload,
};
use crate::core::observer::{VideoEvent, VideoObserver};
use crate::core::settings::{Settings, SettingsEvent, SettingsStore, StorageChange};
use crate::dom::{DomError, Document, NodeId, Selector};
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Bound on record/event settling rounds per pump, so features reacting to
/// their own mutations cannot spin forever.
const MAX_SETTLE_ROUNDS: usize = 8;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("dom error: {0}")]
    Dom(#[from] DomError),
    #[error("page context already started")]
    AlreadyStarted,
    #[error("invalid page location: {0}")]
    Location(#[from] url::ParseError),
}

pub struct PageContext {
    config: Config,
    document: Document,
    observer: VideoObserver,
    manager: FeatureManager,
    settings: Settings,
    changes: broadcast::Receiver<StorageChange>,
    messages: Option<MessageReceiver>,
    location: Option<Url>,
    next_rescan: Option<Instant>,
    resync: bool,
    started: bool,
}

enum Wake {
    Shutdown,
    Change(Result<StorageChange, RecvError>),
    Message(Option<MessageRequest>),
    Deadline,
}

impl PageContext {
    pub fn new(
        config: Config,
        document: Document,
        manager: FeatureManager,
        store: Arc<dyn SettingsStore>,
    ) -> Result<Self, RuntimeError> {
        let observer = VideoObserver::new(&config.video_selector, config.removal_debounce())?;
        let manager = manager.with_max_processing_failures(config.max_processing_failures);
        let settings = Settings::new(store, config.key_prefixes());
        let changes = settings.subscribe();
        Ok(Self {
            config,
            document,
            observer,
            manager,
            settings,
            changes,
            messages: None,
            location: None,
            next_rescan: None,
            resync: false,
            started: false,
        })
    }

    pub fn with_messages(mut self, messages: MessageReceiver) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn manager(&self) -> &FeatureManager {
        &self.manager
    }

    pub fn observer(&self) -> &VideoObserver {
        &self.observer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn observed_root(&self) -> NodeId {
        let configured = self.config.root_selector.as_deref().and_then(|raw| {
            match Selector::parse(raw) {
                Ok(selector) => self.document.query_selector(self.document.root(), &selector),
                Err(e) => {
                    warn!("Ignoring root selector '{}': {}", raw, e);
                    None
                }
            }
        });
        configured.unwrap_or_else(|| self.document.body())
    }

    /// Loads settings, initializes enabled features and starts observing,
    /// dispatching videos that are already on the page.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.started {
            return Err(RuntimeError::AlreadyStarted);
        }
        self.settings.load(&self.manager.defaults()).await;

        let now = Instant::now();
        self.manager
            .initialize(&mut self.document, self.settings.snapshot(), now);

        let root = self.observed_root();
        self.document.take_records();
        let events = self.observer.start(&self.document, root)?;
        self.dispatch(events, now);

        self.next_rescan = self.config.rescan_interval().map(|interval| now + interval);
        self.started = true;
        self.flush_writes().await;
        info!("Page context started ({} videos)", self.manager.videos().len());
        Ok(())
    }

    fn dispatch(&mut self, events: Vec<VideoEvent>, now: Instant) {
        for event in events {
            self.manager
                .handle_video_event(&mut self.document, self.settings.snapshot(), event, now);
        }
    }

    /// One turn of the page loop.
    pub async fn pump(&mut self) {
        if !self.started {
            return;
        }
        let now = Instant::now();

        self.drain_settings_changes(now);
        if self.resync {
            self.resync = false;
            self.reload_features().await;
        }
        self.drain_messages().await;

        self.settle(now);
        self.manager
            .fire_due_timers(&mut self.document, self.settings.snapshot(), now);
        let gone = self.observer.flush(&self.document, now);
        self.dispatch(gone, now);
        if self.next_rescan.is_some_and(|at| at <= now) {
            let found = self.observer.rescan(&self.document, now);
            self.dispatch(found, now);
            self.next_rescan = self.config.rescan_interval().map(|interval| now + interval);
        }
        self.settle(now);

        self.flush_writes().await;
        self.reclaim();
    }

    /// Frees detached subtrees that neither the observer nor the manager
    /// refers to. Skipped while records are pending so none names a freed node.
    fn reclaim(&mut self) {
        if self.document.has_pending_records() {
            return;
        }
        let retained: BTreeSet<NodeId> = self
            .observer
            .held_nodes()
            .chain(self.manager.held_nodes())
            .collect();
        let freed = self.document.reclaim_detached(&retained);
        if freed > 0 {
            self.manager.forget_reclaimed(&self.document);
            debug!("Reclaimed {} detached nodes", freed);
        }
    }

    /// Feeds pending mutation records and DOM events through the observer
    /// and the features until the page is quiet.
    fn settle(&mut self, now: Instant) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let records = self.document.take_records();
            let events = self.document.take_events();
            if records.is_empty() && events.is_empty() {
                return;
            }

            let video_events = self.observer.process_records(&self.document, &records, now);
            self.dispatch(video_events, now);
            self.manager
                .dom_mutations(&mut self.document, self.settings.snapshot(), &records, now);
            for event in &events {
                self.manager
                    .dispatch_dom_event(&mut self.document, self.settings.snapshot(), event, now);
            }
        }
        debug!("Page did not settle within {} rounds", MAX_SETTLE_ROUNDS);
    }

    fn drain_settings_changes(&mut self, now: Instant) {
        loop {
            match self.changes.try_recv() {
                Ok(change) => self.apply_change(&change, now),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Missed {} settings changes, reloading", missed);
                    self.resync = true;
                }
            }
        }
    }

    fn apply_change(&mut self, change: &StorageChange, now: Instant) {
        match self.settings.apply_change(change) {
            Some(SettingsEvent::FeatureToggled { id, enabled }) => {
                let result = self.manager.set_feature_enabled(
                    &mut self.document,
                    self.settings.snapshot(),
                    &id,
                    enabled,
                    now,
                );
                if let Err(e) = result {
                    debug!("Ignoring flag change: {}", e);
                }
            }
            Some(SettingsEvent::PreferenceChanged { key }) => {
                self.manager
                    .preference_changed(&mut self.document, self.settings.snapshot(), &key, now);
            }
            None => {}
        }
    }

    /// Re-reads every flag and preference and reconciles the features.
    pub async fn reload_features(&mut self) {
        self.settings.load(&self.manager.defaults()).await;
        let now = Instant::now();
        self.manager
            .reconcile(&mut self.document, self.settings.snapshot(), now);
        info!("Reloaded feature configuration");
    }

    async fn drain_messages(&mut self) {
        let mut requests = Vec::new();
        if let Some(rx) = self.messages.as_mut() {
            while let Ok(request) = rx.try_recv() {
                requests.push(request);
            }
        }
        for request in requests {
            self.answer(request).await;
        }
    }

    async fn answer(&mut self, request: MessageRequest) {
        let response = self.handle_message(request.message).await;
        if request.reply.send(response).is_err() {
            debug!("Message sender went away before the reply");
        }
    }

    pub async fn handle_message(&mut self, message: RuntimeMessage) -> RuntimeMessage {
        debug!("Handling {:?} message", message.kind);
        match message.kind {
            MessageType::Ping => RuntimeMessage::new(MessageType::Pong, json!(null)),
            MessageType::ReloadFeatures => {
                self.reload_features().await;
                self.settle(Instant::now());
                RuntimeMessage::new(MessageType::Ack, self.state_report())
            }
            MessageType::GetFeatureStates => {
                RuntimeMessage::new(MessageType::FeatureStates, self.state_report())
            }
            MessageType::SetFeatureState => {
                let payload: SetFeatureStatePayload = match serde_json::from_value(message.payload) {
                    Ok(payload) => payload,
                    Err(e) => return RuntimeMessage::error(format!("invalid payload: {}", e)),
                };
                if !self.manager.is_registered(&payload.id) {
                    return RuntimeMessage::error(format!("unknown feature '{}'", payload.id));
                }
                if let Err(e) = self
                    .settings
                    .set_feature_state(&payload.id, payload.enabled)
                    .await
                {
                    warn!("Could not persist flag for '{}': {}", payload.id, e);
                    return RuntimeMessage::error(e.to_string());
                }
                let now = Instant::now();
                self.drain_settings_changes(now);
                self.settle(now);
                RuntimeMessage::new(MessageType::Ack, self.state_report())
            }
            other => RuntimeMessage::error(format!("unsupported message type {:?}", other)),
        }
    }

    pub fn state_report(&self) -> serde_json::Value {
        json!({
            "features": self.manager.feature_states(),
            "tracked_videos": self.manager.videos().len(),
            "location": self.location.as_ref().map(Url::as_str),
        })
    }

    async fn flush_writes(&mut self) {
        for write in self.manager.take_preference_writes() {
            if let Err(e) = self
                .settings
                .set_user_preference(&write.key, write.value)
                .await
            {
                warn!("Could not persist preference '{}': {}", write.key, e);
            }
        }
    }

    /// Records a single-page navigation. The observed root is re-resolved;
    /// videos outside the new root are released and new ones dispatched.
    pub async fn navigate(&mut self, location: &str) -> Result<(), RuntimeError> {
        let url = Url::parse(location)?;
        info!("Navigated to {}", url);
        self.location = Some(url);
        if !self.started {
            return Ok(());
        }

        let now = Instant::now();
        self.settle(now);
        let root = self.observed_root();
        if self.observer.root() != Some(root) {
            let previous: Vec<NodeId> = self.manager.videos().iter().map(|v| v.node).collect();
            self.document.take_records();
            let appeared = self.observer.start(&self.document, root)?;
            let gone = previous
                .into_iter()
                .filter(|node| !self.observer.is_tracking(*node))
                .map(VideoEvent::Disappeared)
                .collect();
            self.dispatch(gone, now);
            self.dispatch(appeared, now);
        } else {
            let found = self.observer.rescan(&self.document, now);
            self.dispatch(found, now);
        }
        self.settle(now);
        self.flush_writes().await;
        Ok(())
    }

    /// Earliest instant at which [`PageContext::pump`] has timed work.
    pub fn next_wakeup(&self) -> Option<Instant> {
        [
            self.observer.next_deadline(),
            self.manager.next_timer_deadline(),
            self.next_rescan,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Page teardown: every feature cleaned up, observation stopped.
    pub async fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        let now = Instant::now();
        self.manager
            .cleanup(&mut self.document, self.settings.snapshot(), now);
        self.observer.stop();
        self.document.take_records();
        self.document.take_events();
        self.flush_writes().await;
        self.started = false;
        info!("Page context shut down");
    }

    /// Drives the page until `shutdown` resolves, waking for settings
    /// changes, messages and timed work. Host mutations made between wakeups
    /// are picked up by the periodic rescan.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Self, RuntimeError>
    where
        F: Future<Output = ()>,
    {
        if !self.started {
            self.start().await?;
        }
        tokio::pin!(shutdown);
        let mut changes_open = true;

        loop {
            let deadline = self.next_wakeup();
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                change = self.changes.recv(), if changes_open => Wake::Change(change),
                request = next_request(&mut self.messages) => Wake::Message(request),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            let now = Instant::now();
            match wake {
                Wake::Shutdown => break,
                Wake::Change(Ok(change)) => self.apply_change(&change, now),
                Wake::Change(Err(RecvError::Lagged(missed))) => {
                    warn!("Missed {} settings changes, reloading", missed);
                    self.resync = true;
                }
                Wake::Change(Err(RecvError::Closed)) => {
                    debug!("Settings store closed its change channel");
                    changes_open = false;
                }
                Wake::Message(Some(request)) => self.answer(request).await,
                Wake::Message(None) => self.messages = None,
                Wake::Deadline => {}
            }
            self.pump().await;
        }

        self.shutdown().await;
        Ok(self)
    }
}

async fn next_request(messages: &mut Option<MessageReceiver>) -> Option<MessageRequest> {
    match messages {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
