use crate::core::{DomObserver, Feature, FeatureContext, FeatureError, GlobalEffect};
use crate::dom::{MutationRecord, NodeId, Selector};
use serde_json::Value;
use tracing::{debug, warn};

pub const ID: &str = "hide_distractions";

const SELECTORS: &str = "selectors";

pub const DEFAULT_SELECTORS: &[&str] = &[
    "a[href^=\"/explore/\"]",
    "[data-testid=\"suggested-users\"]",
    "[aria-label=\"Threads\"]",
];

/// Hides page furniture around the reels and keeps it hidden as the page
/// re-renders. Everything it touches is restored on disable.
#[derive(Debug, Default)]
pub struct HideDistractions {
    selectors: Vec<Selector>,
}

impl HideDistractions {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_selectors(ctx: &FeatureContext<'_>) -> Vec<Selector> {
        let configured: Vec<String> = match ctx.preference(SELECTORS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Some(other) => {
                warn!("Ignoring malformed hide_distractions.selectors: {}", other);
                DEFAULT_SELECTORS.iter().map(|s| s.to_string()).collect()
            }
            None => DEFAULT_SELECTORS.iter().map(|s| s.to_string()).collect(),
        };
        configured
            .iter()
            .filter_map(|raw| match Selector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(e) => {
                    warn!("Skipping distraction selector '{}': {}", raw, e);
                    None
                }
            })
            .collect()
    }

    fn hide_within(&self, ctx: &mut FeatureContext<'_>, scope: NodeId) -> Result<usize, FeatureError> {
        let marker = ctx.marker();
        let mut targets: Vec<NodeId> = Vec::new();
        for selector in &self.selectors {
            for node in ctx.doc().select_inclusive(scope, selector) {
                if !ctx.doc().has_attribute(node, &marker) && !targets.contains(&node) {
                    targets.push(node);
                }
            }
        }
        for node in &targets {
            ctx.set_attribute(*node, &marker, "")?;
            ctx.set_attribute(*node, "hidden", "")?;
        }
        Ok(targets.len())
    }
}

impl Feature for HideDistractions {
    fn initialize(&mut self, ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        self.selectors = Self::load_selectors(ctx);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        self.selectors.clear();
        Ok(())
    }

    /// A new selector list takes effect at once: everything hidden under
    /// the old list is shown again before the new list is applied.
    fn on_preference_changed(&mut self, ctx: &mut FeatureContext<'_>, key: &str) -> Result<(), FeatureError> {
        if key.strip_prefix(ID).and_then(|rest| rest.strip_prefix('.')) != Some(SELECTORS) {
            return Ok(());
        }
        self.selectors = Self::load_selectors(ctx);
        self.revert(ctx)?;
        self.apply(ctx)
    }

    fn global_effect(&mut self) -> Option<&mut dyn GlobalEffect> {
        Some(self)
    }

    fn dom_observer(&mut self) -> Option<&mut dyn DomObserver> {
        Some(self)
    }
}

impl GlobalEffect for HideDistractions {
    fn apply(&mut self, ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        let root = ctx.doc().root();
        let hidden = self.hide_within(ctx, root)?;
        debug!("Hid {} distractions", hidden);
        Ok(())
    }

    fn revert(&mut self, ctx: &mut FeatureContext<'_>) -> Result<(), FeatureError> {
        ctx.restore_attributes();
        Ok(())
    }
}

impl DomObserver for HideDistractions {
    fn on_mutations(
        &mut self,
        ctx: &mut FeatureContext<'_>,
        records: &[MutationRecord],
    ) -> Result<(), FeatureError> {
        for record in records {
            let MutationRecord::ChildList { added, .. } = record else {
                continue;
            };
            for node in added {
                if ctx.doc().is_element(*node) && ctx.doc().is_connected(*node) {
                    self.hide_within(ctx, *node)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FeatureManager, FeatureOptions, SettingsSnapshot};
    use crate::dom::Document;
    use serde_json::json;
    use tokio::time::Instant;

    fn link(doc: &mut Document, href: &str) -> NodeId {
        let a = doc.create_element("a");
        doc.set_attribute(a, "href", href).unwrap();
        let body = doc.body();
        doc.append_child(body, a).unwrap();
        a
    }

    #[test]
    fn test_hides_existing_and_new_nodes() {
        let mut doc = Document::new();
        let explore = link(&mut doc, "/explore/tags");
        let profile = link(&mut doc, "/someone/");
        doc.take_records();
        let settings = SettingsSnapshot::default();

        let mut manager = FeatureManager::new();
        manager.register(ID, HideDistractions::new(), FeatureOptions::new(10)).unwrap();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        assert!(doc.has_attribute(explore, "hidden"));
        assert!(!doc.has_attribute(profile, "hidden"));
        doc.take_records();

        let late = link(&mut doc, "/explore/");
        let records = doc.take_records();
        manager.dom_mutations(&mut doc, &settings, &records, now);
        assert!(doc.has_attribute(late, "data-reel-hide-distractions"));

        manager.set_feature_enabled(&mut doc, &settings, ID, false, now).unwrap();
        assert!(!doc.has_attribute(explore, "hidden"));
        assert!(!doc.has_attribute(late, "data-reel-hide-distractions"));
    }

    #[test]
    fn test_selectors_preference_and_prior_attribute() {
        let mut doc = Document::new();
        let body = doc.body();
        let banner = doc.create_element("div");
        doc.set_attribute(banner, "class", "banner").unwrap();
        doc.set_attribute(banner, "hidden", "until-found").unwrap();
        doc.append_child(body, banner).unwrap();
        let settings = SettingsSnapshot::default()
            .with_preference("hide_distractions.selectors", json!([".banner", "div[["]));

        let mut manager = FeatureManager::new();
        manager.register(ID, HideDistractions::new(), FeatureOptions::new(10)).unwrap();
        let now = Instant::now();
        manager.initialize(&mut doc, &settings, now);
        assert_eq!(doc.attribute(banner, "hidden"), Some(""));

        manager.cleanup(&mut doc, &settings, now);
        assert_eq!(doc.attribute(banner, "hidden"), Some("until-found"));
    }

    #[test]
    fn test_selector_change_applies_live() {
        let mut doc = Document::new();
        let explore = link(&mut doc, "/explore/");
        let banner = doc.create_element("div");
        doc.set_attribute(banner, "class", "banner").unwrap();
        let body = doc.body();
        doc.append_child(body, banner).unwrap();

        let mut manager = FeatureManager::new();
        manager.register(ID, HideDistractions::new(), FeatureOptions::new(10)).unwrap();
        let now = Instant::now();
        manager.initialize(&mut doc, &SettingsSnapshot::default(), now);
        assert!(doc.has_attribute(explore, "hidden"));
        assert!(!doc.has_attribute(banner, "hidden"));

        let settings = SettingsSnapshot::default()
            .with_preference("hide_distractions.selectors", json!([".banner"]));
        manager.preference_changed(&mut doc, &settings, "hide_distractions.selectors", now);
        assert!(doc.has_attribute(banner, "hidden"));
        assert!(!doc.has_attribute(explore, "hidden"));
        assert!(!doc.has_attribute(explore, "data-reel-hide-distractions"));

        manager.preference_changed(&mut doc, &settings, "hide_distractions.unrelated", now);
        manager.preference_changed(&mut doc, &settings, "hide_distractionsx.selectors", now);
        assert!(doc.has_attribute(banner, "hidden"));
        assert_eq!(manager.recent_errors().count(), 0);

        manager.set_feature_enabled(&mut doc, &settings, ID, false, now).unwrap();
        assert!(!doc.has_attribute(banner, "hidden"));
    }
}
