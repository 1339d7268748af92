#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};

use nutbot_relay::extension::{
    DebuggeeId, Debugger, DebuggerError, DebuggerEvent, ExtensionPeer, PeerEvent, TabId, TabInfo,
};

/// An in-memory browser
pub struct MockBrowser {
    state: Mutex<BrowserState>,
    events: UnboundedSender<DebuggerEvent>,
}

#[derive(Debug, Default)]
pub struct BrowserState {
    pub tabs: BTreeMap<TabId, TabInfo>,
    pub attached: BTreeSet<TabId>,
    pub next_tab: i64,
    pub commands: Vec<(DebuggeeId, String)>,
    pub notifications: Vec<(String, String)>,
    pub closed_windows: Vec<TabId>,
    pub attach_delay: Option<Duration>,
    pub fail_attach: Option<String>,
}

impl MockBrowser {
    pub fn new() -> (Arc<Self>, BoxStream<'static, DebuggerEvent>) {
        let (tx, rx) = unbounded();
        let browser = Arc::new(Self {
            state: Mutex::new(BrowserState::default()),
            events: tx,
        });
        (browser, rx.boxed())
    }

    pub fn state(&self) -> MutexGuard<'_, BrowserState> {
        self.state.lock().unwrap()
    }

    pub fn open_tab(&self, url: &str) -> TabId {
        let mut state = self.state();
        state.next_tab += 1;
        let tab_id = TabId(state.next_tab);
        state.tabs.insert(
            tab_id,
            TabInfo {
                url: url.to_string(),
                title: String::new(),
            },
        );
        tab_id
    }

    /// Removes the tab without telling anyone
    pub fn forget_tab(&self, tab_id: TabId) {
        let mut state = self.state();
        state.tabs.remove(&tab_id);
        state.attached.remove(&tab_id);
    }

    pub fn emit(&self, event: DebuggerEvent) {
        self.events.unbounded_send(event).unwrap();
    }

    fn remove_tab(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        let existed = {
            let mut state = self.state();
            state.attached.remove(&tab_id);
            state.tabs.remove(&tab_id).is_some()
        };
        if !existed {
            return Err(DebuggerError::Native(format!("No tab with id: {}.", tab_id)));
        }
        let _ = self.events.unbounded_send(DebuggerEvent::TabRemoved { tab_id });
        Ok(())
    }
}

#[async_trait]
impl Debugger for MockBrowser {
    async fn tab(&self, tab_id: TabId) -> Result<Option<TabInfo>, DebuggerError> {
        Ok(self.state().tabs.get(&tab_id).cloned())
    }

    async fn attach(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        let delay = self.state().attach_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(err) = state.fail_attach.clone() {
            return Err(DebuggerError::Native(err));
        }
        if !state.tabs.contains_key(&tab_id) {
            return Err(DebuggerError::Native(format!("No tab with given id {}.", tab_id)));
        }
        if !state.attached.insert(tab_id) {
            return Err(DebuggerError::Native(format!(
                "Another debugger is already attached to the tab with id: {}.",
                tab_id
            )));
        }
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        if self.state().attached.remove(&tab_id) {
            Ok(())
        } else {
            Err(DebuggerError::Native(format!(
                "Debugger is not attached to the tab with id: {}.",
                tab_id
            )))
        }
    }

    async fn send_command(
        &self,
        target: DebuggeeId,
        method: &str,
        _params: Value,
    ) -> Result<Value, DebuggerError> {
        let info = {
            let mut state = self.state();
            if !state.attached.contains(&target.tab_id) {
                return Err(DebuggerError::Native(format!(
                    "Debugger is not attached to the tab with id: {}.",
                    target.tab_id
                )));
            }
            state.commands.push((target.clone(), method.to_string()));
            state.tabs.get(&target.tab_id).cloned().unwrap_or_default()
        };
        match method {
            "Target.getTargetInfo" => Ok(json!({
                "targetInfo": {
                    "targetId": format!("T{}", target.tab_id),
                    "type": "page",
                    "title": info.title,
                    "url": info.url,
                    "attached": true
                }
            })),
            "Runtime.evaluate" => Ok(json!({"result": {"type": "number", "value": 2}})),
            "Slow.method" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }

    async fn create_tab(&self, url: &str) -> Result<TabId, DebuggerError> {
        Ok(self.open_tab(url))
    }

    async fn close_tab(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        self.remove_tab(tab_id)
    }

    async fn close_window(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        self.state().closed_windows.push(tab_id);
        self.remove_tab(tab_id)
    }

    async fn show_notification(&self, title: &str, message: &str) -> Result<(), DebuggerError> {
        self.state()
            .notifications
            .push((title.to_string(), message.to_string()));
        Ok(())
    }
}

/// Polls the peer until `fut` resolves, then until it goes quiet
pub async fn run<F: Future>(peer: &mut ExtensionPeer, fut: F) -> (F::Output, Vec<PeerEvent>) {
    tokio::pin!(fut);
    let mut events = Vec::new();
    let out = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            tokio::select! {
                out = &mut fut => break out,
                Some(event) = peer.next() => events.push(event),
            }
        }
    })
    .await
    .expect("timed out");
    events.extend(drain(peer).await);
    (out, events)
}

/// Polls the peer until nothing happened for a while
pub async fn drain(peer: &mut ExtensionPeer) -> Vec<PeerEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), peer.next()).await
    {
        events.push(event);
    }
    events
}

/// The messages the peer wants to send to the relay, as json
pub fn sent(events: &[PeerEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event {
            PeerEvent::Send(msg) => Some(serde_json::from_str(&msg.to_json()).unwrap()),
            PeerEvent::TabState(_) => None,
        })
        .collect()
}
