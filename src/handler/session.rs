use nutbot_relay_types::TargetInfo;

/// A tab the extension attached to, as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedTarget {
    /// Identifier for this session, minted by the extension.
    session_id: String,
    /// The identifier of the target this session is attached to.
    target_id: String,
    /// Latest metadata reported for the target.
    info: TargetInfo,
}

impl ConnectedTarget {
    pub fn new(session_id: impl Into<String>, info: TargetInfo) -> Self {
        Self {
            session_id: session_id.into(),
            target_id: info.target_id.clone(),
            info,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn info(&self) -> &TargetInfo {
        &self.info
    }

    /// The metadata with `attached` set, as handed out to control clients.
    pub fn attached_info(&self) -> TargetInfo {
        TargetInfo {
            attached: true,
            ..self.info.clone()
        }
    }

    pub(crate) fn set_info(&mut self, info: TargetInfo) {
        self.info = info;
    }
}

/// A sub target (iframe, worker) auto-attached inside a connected target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSession {
    /// Session of the tab this child was discovered in.
    pub parent_session_id: String,
    pub target_id: String,
}
