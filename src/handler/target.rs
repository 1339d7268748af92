use fnv::FnvHashMap;
use serde_json::Value;

use nutbot_relay_types::{methods, AttachedToTarget, DetachedFromTarget, TargetInfo, TargetInfoEvent};

use crate::handler::session::{ChildSession, ConnectedTarget};

/// How an extension event changed the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetChange {
    /// `evicted` is the session that held the same target before
    Attached {
        session_id: String,
        evicted: Option<ConnectedTarget>,
    },
    Detached(String),
    ChildAttached(String),
    ChildDetached(String),
    InfoChanged(String),
}

/// Keeps track of all sessions the extension currently holds.
///
/// A session id maps to at most one target and a target has at most one
/// session; inserting a second session for an already known target evicts the
/// older session.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    /// Used to loop over all targets in attach order
    session_ids: Vec<String>,
    /// The attached top level targets, keyed by session id
    targets: FnvHashMap<String, ConnectedTarget>,
    /// Sessions of sub targets, keyed by their own session id
    children: FnvHashMap<String, ChildSession>,
}

impl TargetRegistry {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, session_id: &str) -> Option<&ConnectedTarget> {
        self.targets.get(session_id)
    }

    pub fn by_target_id(&self, target_id: &str) -> Option<&ConnectedTarget> {
        self.targets().find(|t| t.target_id() == target_id)
    }

    pub fn child(&self, session_id: &str) -> Option<&ChildSession> {
        self.children.get(session_id)
    }

    /// Whether commands addressed to `session_id` can be routed
    pub fn contains_session(&self, session_id: &str) -> bool {
        self.targets.contains_key(session_id) || self.children.contains_key(session_id)
    }

    /// Iterator over all attached targets in the order they were attached
    pub fn targets(&self) -> impl Iterator<Item = &ConnectedTarget> + '_ {
        self.session_ids.iter().filter_map(|id| self.targets.get(id))
    }

    /// Registers the target, returns the session that previously owned the
    /// same target if any.
    pub fn insert(&mut self, target: ConnectedTarget) -> Option<ConnectedTarget> {
        let stale = self
            .targets()
            .find(|t| t.target_id() == target.target_id() && t.session_id() != target.session_id())
            .map(|t| t.session_id().to_string());
        let evicted = stale.and_then(|id| self.remove(&id));
        if let Some(ref evicted) = evicted {
            tracing::warn!(
                target_id = %target.target_id(),
                stale = %evicted.session_id(),
                session = %target.session_id(),
                "target re-attached under a new session"
            );
        }

        let session_id = target.session_id().to_string();
        if self.targets.insert(session_id.clone(), target).is_none() {
            self.session_ids.push(session_id);
        }
        evicted
    }

    /// Removes the session and all of its child sessions
    pub fn remove(&mut self, session_id: &str) -> Option<ConnectedTarget> {
        let target = self.targets.remove(session_id)?;
        self.session_ids.retain(|id| id != session_id);
        self.children
            .retain(|_, child| child.parent_session_id != session_id);
        Some(target)
    }

    pub fn insert_child(&mut self, session_id: impl Into<String>, child: ChildSession) {
        self.children.insert(session_id.into(), child);
    }

    pub fn remove_child(&mut self, session_id: &str) -> Option<ChildSession> {
        self.children.remove(session_id)
    }

    /// Replaces the metadata of the target with the same id
    pub fn update_info(&mut self, info: TargetInfo) -> Option<&ConnectedTarget> {
        let session_id = self.by_target_id(&info.target_id)?.session_id().to_string();
        let target = self.targets.get_mut(&session_id)?;
        target.set_info(info);
        Some(target)
    }

    /// Drops everything, returns the removed targets in attach order
    pub fn clear(&mut self) -> Vec<ConnectedTarget> {
        let ids = std::mem::take(&mut self.session_ids);
        let removed = ids
            .iter()
            .filter_map(|id| self.targets.remove(id))
            .collect();
        self.targets.clear();
        self.children.clear();
        removed
    }

    /// Bookkeeping for an event forwarded by the extension.
    ///
    /// `session_id` is the session the event was emitted in, `None` for
    /// browser level events.
    pub fn on_event(
        &mut self,
        method: &str,
        session_id: Option<&str>,
        params: &Value,
    ) -> Option<TargetChange> {
        match method {
            methods::ATTACHED_TO_TARGET => {
                let ev: AttachedToTarget = parse_params(method, params)?;
                match session_id {
                    Some(parent) => {
                        self.insert_child(
                            ev.session_id.clone(),
                            ChildSession {
                                parent_session_id: parent.to_string(),
                                target_id: ev.target_info.target_id,
                            },
                        );
                        Some(TargetChange::ChildAttached(ev.session_id))
                    }
                    None if ev.target_info.is_page() => {
                        let evicted =
                            self.insert(ConnectedTarget::new(ev.session_id.clone(), ev.target_info));
                        Some(TargetChange::Attached {
                            session_id: ev.session_id,
                            evicted,
                        })
                    }
                    None => None,
                }
            }
            methods::DETACHED_FROM_TARGET => {
                let ev: DetachedFromTarget = parse_params(method, params)?;
                if self.remove(&ev.session_id).is_some() {
                    Some(TargetChange::Detached(ev.session_id))
                } else if self.remove_child(&ev.session_id).is_some() {
                    Some(TargetChange::ChildDetached(ev.session_id))
                } else {
                    None
                }
            }
            methods::TARGET_INFO_CHANGED => {
                let ev: TargetInfoEvent = parse_params(method, params)?;
                self.update_info(ev.target_info)
                    .map(|t| TargetChange::InfoChanged(t.session_id().to_string()))
            }
            _ => None,
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: &Value) -> Option<T> {
    match serde_json::from_value(params.clone()) {
        Ok(ev) => Some(ev),
        Err(err) => {
            tracing::warn!(%method, %err, "failed to parse target event");
            None
        }
    }
}
