use anyhow::Result;
use reel_enhancer::core::messaging;
use reel_enhancer::core::{
    Feature, FeatureError, FeatureManager, FeatureOptions, FileStore, MemoryStore, MessageType,
    PageContext, RuntimeError, SettingsStore, VideoContext, VideoProcessor,
};
use reel_enhancer::dom::{Document, NodeId, Selector};
use reel_enhancer::{register_builtin, Config};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::time::{advance, Duration};

#[derive(Clone, Default)]
struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.0.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Tags each video's container with a `data-probe` span and journals hooks.
struct Marker {
    name: &'static str,
    journal: Journal,
    fail: bool,
}

impl Marker {
    fn new(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            journal: journal.clone(),
            fail: false,
        }
    }

    fn failing(name: &'static str, journal: &Journal) -> Self {
        Self {
            fail: true,
            ..Self::new(name, journal)
        }
    }
}

impl Feature for Marker {
    fn video_processor(&mut self) -> Option<&mut dyn VideoProcessor> {
        Some(self)
    }
}

impl VideoProcessor for Marker {
    fn process_video(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        self.journal
            .push(format!("{}:process:{}", self.name, ctx.track_id()));
        if self.fail {
            return Err(FeatureError::failed("marker refused"));
        }
        let marker = ctx.marker();
        let span = ctx.doc_mut().create_element("span");
        ctx.doc_mut().set_attribute(span, "data-probe", self.name)?;
        ctx.doc_mut().set_attribute(span, &marker, "")?;
        let container = ctx.container()?;
        ctx.inject(container, span, None)?;
        let video = ctx.video();
        ctx.listen(video, "play")?;
        Ok(())
    }

    fn on_cleanup(&mut self, ctx: &mut VideoContext<'_>) -> Result<(), FeatureError> {
        self.journal
            .push(format!("{}:cleanup:{}", self.name, ctx.track_id()));
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn quiet_config() -> Config {
    Config {
        rescan_interval_ms: 0,
        ..Config::default()
    }
}

async fn started(manager: FeatureManager, store: Arc<MemoryStore>) -> Result<PageContext> {
    init_tracing();
    let mut page = PageContext::new(quiet_config(), Document::new(), manager, store)?;
    page.start().await?;
    Ok(page)
}

/// Appends `<div><video></div>` to the body.
fn mount_reel(page: &mut PageContext) -> Result<(NodeId, NodeId)> {
    let doc = page.document_mut();
    let body = doc.body();
    let reel = doc.create_element("div");
    let video = doc.create_element("video");
    doc.append_child(reel, video)?;
    doc.append_child(body, reel)?;
    Ok((reel, video))
}

fn probes(doc: &Document, reel: NodeId) -> Vec<String> {
    doc.children(reel)
        .iter()
        .filter_map(|c| doc.attribute(*c, "data-probe"))
        .map(str::to_string)
        .collect()
}

fn count_matches(doc: &Document, selector: &str) -> usize {
    let selector = Selector::parse(selector).expect("valid selector");
    doc.query_selector_all(doc.root(), &selector).len()
}

#[tokio::test(start_paused = true)]
async fn test_appear_and_disappear_exactly_once() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("marker", Marker::new("marker", &journal), FeatureOptions::new(1))?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;

    let mut reels = Vec::new();
    for _ in 0..5 {
        reels.push(mount_reel(&mut page)?);
    }
    page.pump().await;
    page.pump().await;
    assert_eq!(journal.count("marker:process"), 5);

    for (reel, _) in &reels[..3] {
        page.document_mut().remove(*reel)?;
    }
    page.pump().await;
    assert_eq!(journal.count("marker:cleanup"), 0);

    advance(Duration::from_millis(60)).await;
    page.pump().await;
    page.pump().await;
    assert_eq!(journal.count("marker:process"), 5);
    assert_eq!(journal.count("marker:cleanup"), 3);
    assert_eq!(page.manager().videos().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_move_within_debounce_window_keeps_state() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("marker", Marker::new("marker", &journal), FeatureOptions::new(1))?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;

    let (reel, video) = mount_reel(&mut page)?;
    page.pump().await;

    let doc = page.document_mut();
    let body = doc.body();
    let elsewhere = doc.create_element("section");
    doc.append_child(body, elsewhere)?;
    doc.remove(reel)?;
    doc.append_child(elsewhere, reel)?;
    page.pump().await;
    advance(Duration::from_millis(200)).await;
    page.pump().await;

    assert_eq!(journal.entries(), vec!["marker:process:1"]);
    assert!(page.manager().is_attached("marker", video));
    Ok(())
}

#[tokio::test]
async fn test_dispatch_follows_descending_priority() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    for (name, priority) in [("p3", 3), ("p1", 1), ("p5", 5), ("p2", 2), ("p4", 4)] {
        manager.register(name, Marker::new(name, &journal), FeatureOptions::new(priority))?;
    }
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;
    let (reel, _) = mount_reel(&mut page)?;
    page.pump().await;

    assert_eq!(probes(page.document(), reel), vec!["p5", "p4", "p3", "p2", "p1"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scenario_high_and_low_priority() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("b", Marker::new("b", &journal), FeatureOptions::new(1))?;
    manager.register("a", Marker::new("a", &journal), FeatureOptions::new(10))?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;

    let (reel, video) = mount_reel(&mut page)?;
    page.pump().await;
    assert_eq!(probes(page.document(), reel), vec!["a", "b"]);

    page.document_mut().remove(reel)?;
    page.pump().await;
    advance(Duration::from_millis(50)).await;
    page.pump().await;

    assert_eq!(
        journal.entries(),
        vec!["a:process:1", "b:process:1", "a:cleanup:1", "b:cleanup:1"]
    );
    assert!(page.manager().videos().track_id(video).is_none());
    assert!(page.document().attribute(video, "data-reel-track").is_none());
    Ok(())
}

#[tokio::test]
async fn test_failing_feature_is_isolated() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("broken", Marker::failing("broken", &journal), FeatureOptions::new(5))?;
    manager.register("fine", Marker::new("fine", &journal), FeatureOptions::new(1))?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;

    let (first, _) = mount_reel(&mut page)?;
    page.pump().await;
    let (second, _) = mount_reel(&mut page)?;
    page.pump().await;

    assert_eq!(probes(page.document(), first), vec!["fine"]);
    assert_eq!(probes(page.document(), second), vec!["fine"]);
    assert_eq!(journal.count("broken:process"), 2);
    assert_eq!(page.manager().recent_errors().count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_disabled_at_startup_processes_each_video_once_on_enable() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("late", Marker::new("late", &journal), FeatureOptions::new(1))?;
    let store = Arc::new(MemoryStore::with_values([(
        "feature:late".to_string(),
        json!(false),
    )]));
    let mut page = started(manager, Arc::clone(&store)).await?;

    for _ in 0..3 {
        mount_reel(&mut page)?;
    }
    page.pump().await;
    assert_eq!(journal.count("late:process"), 0);
    assert_eq!(page.manager().videos().len(), 3);

    store.set("feature:late", json!(true)).await?;
    page.pump().await;
    page.pump().await;
    assert_eq!(
        journal.entries(),
        vec!["late:process:1", "late:process:2", "late:process:3"]
    );
    Ok(())
}

#[tokio::test]
async fn test_toggle_round_trip_leaves_no_trace() -> Result<()> {
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let store = Arc::new(MemoryStore::with_values([(
        "feature:auto_scroll".to_string(),
        json!(true),
    )]));
    let mut page = started(manager, Arc::clone(&store)).await?;
    let before_listeners = page.document().listener_count();
    let (reel, video) = mount_reel(&mut page)?;
    page.pump().await;

    assert_eq!(count_matches(page.document(), "[data-reel-controls]"), 1);
    assert!(page.document().has_attribute(video, "data-reel-background-play"));
    assert!(page.document().listener_count() > before_listeners);

    for id in page.manager().feature_ids() {
        store.set(&format!("feature:{}", id), json!(false)).await?;
    }
    page.pump().await;

    for marker in [
        "[data-reel-controls]",
        "[data-reel-playback-speed]",
        "[data-reel-volume-control]",
        "[data-reel-duration-overlay]",
        "[data-reel-seekbar]",
        "[data-reel-picture-in-picture]",
        "[data-reel-background-play]",
        "[data-reel-hide-distractions]",
    ] {
        assert_eq!(count_matches(page.document(), marker), 0, "{} left behind", marker);
    }
    assert_eq!(page.document().children(reel), &[video]);
    assert_eq!(page.document().listener_count(), 0);

    for id in page.manager().feature_ids() {
        store.set(&format!("feature:{}", id), json!(true)).await?;
    }
    page.pump().await;
    assert_eq!(count_matches(page.document(), "[data-reel-controls]"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auto_scroll_timer_dies_with_feature() -> Result<()> {
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let store = Arc::new(MemoryStore::with_values([(
        "feature:auto_scroll".to_string(),
        json!(true),
    )]));
    let mut page = started(manager, Arc::clone(&store)).await?;
    let (_, first) = mount_reel(&mut page)?;
    let (_, second) = mount_reel(&mut page)?;
    page.pump().await;

    page.document_mut().dispatch_event(first, "ended");
    page.pump().await;
    advance(Duration::from_millis(500)).await;
    page.pump().await;
    assert_eq!(page.document().scroll_target(), Some(second));

    page.document_mut().dispatch_event(second, "ended");
    page.pump().await;
    assert!(page.next_wakeup().is_some());
    store.set("feature:auto_scroll", json!(false)).await?;
    page.pump().await;
    assert_eq!(page.manager().next_timer_deadline(), None);
    Ok(())
}

#[tokio::test]
async fn test_control_preference_is_persisted() -> Result<()> {
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let store = Arc::new(MemoryStore::new());
    let mut page = started(manager, Arc::clone(&store)).await?;
    let (_, video) = mount_reel(&mut page)?;
    page.pump().await;

    let select = Selector::parse("select[data-reel-playback-speed]")?;
    let doc = page.document_mut();
    let control = doc.query_selector(doc.root(), &select).expect("speed control");
    doc.set_attribute(control, "value", "1.75")?;
    doc.dispatch_event(control, "change");
    page.pump().await;

    assert_eq!(store.get("pref:playback_speed.rate").await?, Some(json!(1.75)));
    page.pump().await;
    assert_eq!(page.settings().snapshot().preference("playback_speed.rate"), Some(&json!(1.75)));
    assert_eq!(page.document().media(video).map(|m| m.playback_rate), Some(1.75));
    Ok(())
}

#[tokio::test]
async fn test_navigate_moves_observation_root() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("marker", Marker::new("marker", &journal), FeatureOptions::new(1))?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;
    let (_, outside) = mount_reel(&mut page)?;
    page.pump().await;

    let doc = page.document_mut();
    let body = doc.body();
    let main = doc.create_element("main");
    let video = doc.create_element("video");
    doc.append_child(main, video)?;
    doc.append_child(body, main)?;
    page.navigate("https://www.instagram.com/reels/C0ffee/").await?;

    assert_eq!(page.location().map(|u| u.path()), Some("/reels/C0ffee/"));
    assert_eq!(page.observer().root(), Some(main));
    assert!(page.manager().videos().track_id(outside).is_none());
    assert!(page.manager().is_attached("marker", video));
    assert_eq!(journal.count("marker:process"), 2);

    assert!(matches!(
        page.navigate("not a url").await,
        Err(RuntimeError::Location(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_messages_report_and_toggle_features() -> Result<()> {
    let journal = Journal::default();
    let mut manager = FeatureManager::new();
    manager.register("marker", Marker::new("marker", &journal), FeatureOptions::new(1))?;
    let (client, receiver) = messaging::channel(8);
    let page = PageContext::new(quiet_config(), Document::new(), manager, Arc::new(MemoryStore::new()))?
        .with_messages(receiver);
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let dashboard = async move {
        let pong = client.send(MessageType::Ping, Value::Null).await?;
        assert_eq!(pong.kind, MessageType::Pong);

        let off = client
            .send(MessageType::SetFeatureState, json!({ "id": "marker", "enabled": false }))
            .await?;
        assert_eq!(off.kind, MessageType::Ack);
        assert_eq!(off.payload["features"][0]["enabled"], json!(false));

        let unknown = client
            .send(MessageType::SetFeatureState, json!({ "id": "nope", "enabled": true }))
            .await?;
        assert_eq!(unknown.kind, MessageType::Error);

        let states = client.send(MessageType::GetFeatureStates, Value::Null).await?;
        assert_eq!(states.kind, MessageType::FeatureStates);
        let _ = stop.send(());
        Ok::<_, anyhow::Error>(())
    };
    let shutdown = async {
        let _ = stopped.await;
    };

    let (page, dashboard) = tokio::join!(page.run(shutdown), dashboard);
    dashboard?;
    let page = page?;
    assert!(!page.is_started());
    assert!(!page.manager().is_enabled("marker"));
    Ok(())
}

#[tokio::test]
async fn test_file_store_keeps_flags_across_pages() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.json");

    {
        let store = Arc::new(FileStore::open(&path).await?);
        let mut manager = FeatureManager::new();
        register_builtin(&mut manager, &Config::default())?;
        let mut page = PageContext::new(quiet_config(), Document::new(), manager, store)?;
        page.start().await?;
        let reply = page
            .handle_message(reel_enhancer::core::RuntimeMessage::new(
                MessageType::SetFeatureState,
                json!({ "id": "seekbar", "enabled": false }),
            ))
            .await;
        assert_eq!(reply.kind, MessageType::Ack);
        page.shutdown().await;
    }

    let store = Arc::new(FileStore::open(&path).await?);
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let mut page = PageContext::new(quiet_config(), Document::new(), manager, store)?;
    page.start().await?;
    assert!(!page.manager().is_enabled("seekbar"));
    assert!(page.manager().is_enabled("playback_speed"));
    assert!(!page.manager().is_enabled("auto_scroll"));
    Ok(())
}

#[tokio::test]
async fn test_start_twice_is_rejected() -> Result<()> {
    let mut page = started(FeatureManager::new(), Arc::new(MemoryStore::new())).await?;
    assert!(matches!(page.start().await, Err(RuntimeError::AlreadyStarted)));
    page.shutdown().await;
    page.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_page_model_stays_bounded() -> Result<()> {
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;
    let baseline = page.document().node_count();
    let (reel, video) = mount_reel(&mut page)?;
    page.pump().await;
    let arena = page.document().arena_len();

    for second in 0..1000 {
        let doc = page.document_mut();
        if let Some(media) = doc.media_mut(video) {
            media.current_time = f64::from(second);
            media.duration = Some(1000.0);
        }
        doc.dispatch_event(video, "timeupdate");
        page.pump().await;
    }
    assert_eq!(page.document().arena_len(), arena);
    assert_eq!(count_matches(page.document(), "[data-reel-duration-overlay]"), 1);

    page.document_mut().remove(reel)?;
    page.pump().await;
    advance(Duration::from_millis(60)).await;
    page.pump().await;
    assert!(page.manager().videos().is_empty());
    assert!(!page.document().exists(video));
    assert_eq!(page.document().node_count(), baseline);

    mount_reel(&mut page)?;
    page.pump().await;
    assert_eq!(page.document().arena_len(), arena);
    Ok(())
}

#[tokio::test]
async fn test_distraction_selectors_apply_live() -> Result<()> {
    init_tracing();
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let store = Arc::new(MemoryStore::new());
    let mut doc = Document::new();
    let body = doc.body();
    let banner = doc.create_element("div");
    doc.set_attribute(banner, "class", "banner")?;
    doc.append_child(body, banner)?;
    let mut page = PageContext::new(quiet_config(), doc, manager, store.clone())?;
    page.start().await?;
    assert!(!page.document().has_attribute(banner, "hidden"));

    store
        .set("pref:hide_distractions.selectors", json!([".banner"]))
        .await?;
    page.pump().await;
    assert!(page.document().has_attribute(banner, "hidden"));

    store.set("feature:hide_distractions", json!(false)).await?;
    page.pump().await;
    assert!(!page.document().has_attribute(banner, "hidden"));
    Ok(())
}

#[tokio::test]
async fn test_failure_cap_comes_from_config() -> Result<()> {
    let config = Config {
        max_processing_failures: 3,
        ..quiet_config()
    };
    let page = PageContext::new(
        config,
        Document::new(),
        FeatureManager::new(),
        Arc::new(MemoryStore::new()),
    )?;
    assert_eq!(page.manager().max_processing_failures(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_controls_follow_a_moved_video() -> Result<()> {
    let mut manager = FeatureManager::new();
    register_builtin(&mut manager, &Config::default())?;
    let mut page = started(manager, Arc::new(MemoryStore::new())).await?;
    let (reel, video) = mount_reel(&mut page)?;
    page.pump().await;
    let strip_selector = Selector::parse("[data-reel-controls]")?;
    let strip = page
        .document()
        .query_selector(reel, &strip_selector)
        .expect("control strip");

    let doc = page.document_mut();
    let body = doc.body();
    let next = doc.create_element("div");
    doc.append_child(body, next)?;
    doc.append_child(next, video)?;
    page.pump().await;
    advance(Duration::from_millis(60)).await;
    page.pump().await;

    assert_eq!(page.document().parent(strip), Some(next));
    assert!(page.document().children(reel).is_empty());
    assert!(page.manager().is_attached("playback_speed", video));
    assert_eq!(count_matches(page.document(), "[data-reel-controls]"), 1);
    Ok(())
}
