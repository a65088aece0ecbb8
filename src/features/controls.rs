//! The control strip per-video features share under a video's container.

use crate::core::{FeatureError, VideoContext};
use crate::dom::{DomError, NodeId};

pub const CONTROLS_MARKER: &str = "data-reel-controls";
pub const ORDER_ATTRIBUTE: &str = "data-reel-order";

/// Creates a detached element carrying the feature's marker attribute.
pub fn control_element(
    ctx: &mut VideoContext<'_>,
    tag: &str,
    attributes: &[(&str, &str)],
) -> Result<NodeId, DomError> {
    let marker = ctx.marker();
    let doc = ctx.doc_mut();
    let node = doc.create_element(tag);
    doc.set_attribute(node, &marker, "")?;
    for (name, value) in attributes {
        doc.set_attribute(node, name, value)?;
    }
    Ok(node)
}

/// Places `control` in the strip, before the first control of lower
/// priority, and remembers it under `key`.
pub fn mount_control(ctx: &mut VideoContext<'_>, key: &str, control: NodeId) -> Result<NodeId, FeatureError> {
    let container = ctx.container()?;
    let strip = ctx.shared_container(container, "div", CONTROLS_MARKER)?;
    let priority = ctx.priority();
    ctx.doc_mut()
        .set_attribute(control, ORDER_ATTRIBUTE, &priority.to_string())?;

    let reference = ctx.doc().children(strip).iter().copied().find(|sibling| {
        ctx.doc()
            .attribute(*sibling, ORDER_ATTRIBUTE)
            .and_then(|raw| raw.parse::<i32>().ok())
            .is_some_and(|order| order < priority)
    });
    ctx.inject(strip, control, reference)?;
    ctx.save(key, control.raw());
    Ok(strip)
}

/// A node remembered with [`mount_control`].
pub fn saved_control(ctx: &VideoContext<'_>, key: &str) -> Option<NodeId> {
    ctx.saved(key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(NodeId::from_raw)
        .filter(|node| ctx.doc().exists(*node))
}

pub fn require_media(ctx: &VideoContext<'_>) -> Result<(), FeatureError> {
    if ctx.doc().media(ctx.video()).is_none() {
        return Err(FeatureError::NotMedia);
    }
    Ok(())
}
