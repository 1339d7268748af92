use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Fuse, FuturesUnordered, Stream, StreamExt};
use futures::task::{Context, Poll};
use futures::{FutureExt, SinkExt};
use serde::Serialize;
use serde_json::{json, Value};

use nutbot_relay_types::extension::{CdpForward, FromExtension, FromRelay, ProtocolError};
use nutbot_relay_types::{methods, AttachedToTarget, CallId, TargetInfo};

use crate::config::PeerConfig;
use crate::extension::{
    is_restricted_url, DebuggeeId, Debugger, DebuggerError, DebuggerEvent, TabId, TabInfo,
};

const HANDLE_CHANNEL_CAPACITY: usize = 64;

/// Attachment state of a single tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TabState {
    Idle,
    Connecting,
    Connected,
    Error,
}

/// A tab as presented to the user facing layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSnapshot {
    pub tab_id: TabId,
    pub state: TabState,
    pub session_id: Option<String>,
    pub target_info: Option<TargetInfo>,
    /// Why the last attach failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachedTab {
    pub session_id: String,
    pub target_info: TargetInfo,
}

/// Output of the [`ExtensionPeer`] stream
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A message that must be written to the relay
    Send(FromExtension),
    /// A tab changed its attachment state
    TabState(TabSnapshot),
}

#[derive(Debug)]
enum PeerMessage {
    Attach {
        tab_id: TabId,
        ack: oneshot::Sender<Result<AttachedTab, DebuggerError>>,
    },
    Detach {
        tab_id: TabId,
        ack: oneshot::Sender<()>,
    },
    Dispatch {
        session_id: String,
        method: String,
        params: Value,
        ack: oneshot::Sender<Result<Value, DebuggerError>>,
    },
    Tabs(oneshot::Sender<Vec<TabSnapshot>>),
}

/// Where the result of a native call goes
#[derive(Debug)]
enum Reply {
    /// Answer a relay request received while the link was at `epoch`
    Relay { id: CallId, epoch: u64 },
    Handle(oneshot::Sender<Result<Value, DebuggerError>>),
}

/// Why a tab is being attached
#[derive(Debug)]
enum AttachOrigin {
    Handle(oneshot::Sender<Result<AttachedTab, DebuggerError>>),
    /// `createInitialTab`, the attach is folded into the response
    InitialTab { id: CallId, epoch: u64 },
    /// `Target.createTarget` forwarded by the relay
    CreateTarget { id: CallId, epoch: u64 },
    /// The tab was connected before the relay link dropped
    Reattach,
}

/// A finished native call, applied back inside the actor
#[derive(Debug)]
enum Completion {
    Attached {
        tab_id: TabId,
        attempt: u64,
        origin: AttachOrigin,
        result: Result<TargetInfo, DebuggerError>,
    },
    TabCreated {
        origin: AttachOrigin,
        result: Result<TabId, DebuggerError>,
    },
    Command {
        reply: Reply,
        result: Result<Value, DebuggerError>,
    },
    Done,
}

#[derive(Debug, Clone)]
struct TabEntry {
    state: TabState,
    /// Identifies the attach in progress, completions of older attempts are
    /// ignored
    attempt: u64,
    session_id: Option<String>,
    info: Option<TargetInfo>,
    error: Option<String>,
    /// Lost its session when the relay link dropped, re-attached once the link
    /// is back
    awaiting_relay: bool,
}

impl TabEntry {
    fn new() -> Self {
        Self {
            state: TabState::Idle,
            attempt: 0,
            session_id: None,
            info: None,
            error: None,
            awaiting_relay: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ChildSession {
    tab_id: TabId,
    target_id: String,
}

/// The extension side state machine.
///
/// Owns every debugger attachment. Native calls run as in-flight futures
/// whose results are applied when the stream is polled; everything destined
/// for the relay is yielded as [`PeerEvent::Send`].
#[must_use = "streams do nothing unless polled"]
pub struct ExtensionPeer {
    config: PeerConfig,
    debugger: Arc<dyn Debugger>,
    from_handles: Fuse<Receiver<PeerMessage>>,
    native_events: Fuse<BoxStream<'static, DebuggerEvent>>,
    tabs: FnvHashMap<TabId, TabEntry>,
    /// Relay visible session id to the tab it belongs to
    sessions: FnvHashMap<String, TabId>,
    children: FnvHashMap<String, ChildSession>,
    next_session: u64,
    next_attempt: u64,
    /// Incremented with every new relay link
    epoch: u64,
    relay_connected: bool,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    events: VecDeque<PeerEvent>,
}

impl fmt::Debug for ExtensionPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPeer")
            .field("tabs", &self.tabs)
            .field("sessions", &self.sessions)
            .field("epoch", &self.epoch)
            .field("relay_connected", &self.relay_connected)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl ExtensionPeer {
    pub fn new(
        config: PeerConfig,
        debugger: Arc<dyn Debugger>,
        native_events: BoxStream<'static, DebuggerEvent>,
    ) -> (Self, PeerHandle) {
        let (tx, rx) = channel(HANDLE_CHANNEL_CAPACITY);
        let peer = Self {
            config,
            debugger,
            from_handles: rx.fuse(),
            native_events: native_events.fuse(),
            tabs: Default::default(),
            sessions: Default::default(),
            children: Default::default(),
            next_session: 0,
            next_attempt: 0,
            epoch: 0,
            relay_connected: false,
            in_flight: FuturesUnordered::new(),
            events: Default::default(),
        };
        (peer, PeerHandle { sender: tx })
    }

    pub fn tab_state(&self, tab_id: TabId) -> TabState {
        self.tabs
            .get(&tab_id)
            .map(|entry| entry.state)
            .unwrap_or(TabState::Idle)
    }

    pub fn tabs(&self) -> Vec<TabSnapshot> {
        let mut ids: Vec<TabId> = self.tabs.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.snapshot(id)).collect()
    }

    fn snapshot(&self, tab_id: TabId) -> Option<TabSnapshot> {
        self.tabs.get(&tab_id).map(|entry| TabSnapshot {
            tab_id,
            state: entry.state,
            session_id: entry.session_id.clone(),
            target_info: entry.info.clone(),
            error: entry.error.clone(),
        })
    }

    fn push_state(&mut self, tab_id: TabId) {
        if let Some(snapshot) = self.snapshot(tab_id) {
            self.events.push_back(PeerEvent::TabState(snapshot));
        }
    }

    fn mint_session_id(&mut self) -> String {
        self.next_session += 1;
        format!("{}{}", self.config.session_prefix, self.next_session)
    }

    fn next_attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }

    /// Queues a message for the relay, dropped while there is no link
    fn send(&mut self, msg: FromExtension) {
        if self.relay_connected {
            self.events.push_back(PeerEvent::Send(msg));
        } else {
            tracing::trace!(?msg, "relay not connected, dropping message");
        }
    }

    fn send_event(&mut self, method: &str, session_id: Option<String>, params: Value) {
        self.send(FromExtension::ForwardCdpEvent(CdpForward {
            method: method.to_string(),
            session_id,
            params,
        }));
    }

    fn detach_in_background(&mut self, tab_id: TabId) {
        let debugger = Arc::clone(&self.debugger);
        self.in_flight.push(
            async move {
                if let Err(err) = debugger.detach(tab_id).await {
                    tracing::debug!(%tab_id, %err, "detach failed");
                }
                Completion::Done
            }
            .boxed(),
        );
    }

    /// The relay link is up. Tabs that lost their session with the previous
    /// link are re-validated and re-attached.
    pub fn relay_connected(&mut self) {
        self.relay_connected = true;
        self.epoch += 1;
        let awaiting: Vec<TabId> = self
            .tabs
            .iter()
            .filter(|(_, entry)| entry.awaiting_relay)
            .map(|(tab_id, _)| *tab_id)
            .collect();
        for tab_id in awaiting {
            tracing::info!(%tab_id, "re-attaching tab");
            self.start_attach(tab_id, AttachOrigin::Reattach);
        }
    }

    /// The relay link dropped. Connected tabs go back to connecting and are
    /// detached without telling the relay, which is gone anyway.
    pub fn relay_disconnected(&mut self) {
        if !self.relay_connected {
            return;
        }
        self.relay_connected = false;
        self.events
            .retain(|event| !matches!(event, PeerEvent::Send(_)));
        self.sessions.clear();
        self.children.clear();

        let connected: Vec<TabId> = self
            .tabs
            .iter()
            .filter(|(_, entry)| entry.state == TabState::Connected)
            .map(|(tab_id, _)| *tab_id)
            .collect();
        for tab_id in connected {
            let attempt = self.next_attempt();
            if let Some(entry) = self.tabs.get_mut(&tab_id) {
                entry.state = TabState::Connecting;
                entry.attempt = attempt;
                entry.session_id = None;
                entry.awaiting_relay = true;
            }
            self.detach_in_background(tab_id);
            self.push_state(tab_id);
        }
    }

    pub fn on_relay_message(&mut self, msg: FromRelay) {
        match msg {
            FromRelay::Ping => self.send(FromExtension::Pong),
            FromRelay::Pong => {}
            FromRelay::ForwardCdpCommand { id, command } => self.on_forwarded_command(id, command),
            FromRelay::CreateInitialTab { id } => {
                let origin = AttachOrigin::InitialTab {
                    id,
                    epoch: self.epoch,
                };
                self.create_tab("about:blank".to_string(), origin);
            }
            FromRelay::ShowNotification(params) => {
                let debugger = Arc::clone(&self.debugger);
                self.in_flight.push(
                    async move {
                        if let Err(err) = debugger
                            .show_notification(&params.title, &params.message)
                            .await
                        {
                            tracing::warn!(%err, "failed to show notification");
                        }
                        Completion::Done
                    }
                    .boxed(),
                );
            }
        }
    }

    /// A relay frame that could not be parsed, answered if it expects a
    /// response
    pub fn on_protocol_error(&mut self, err: ProtocolError) {
        match &err {
            ProtocolError::UnknownMethod { id: Some(id), .. } => {
                let id = *id;
                self.send(FromExtension::Response {
                    id,
                    outcome: Err(err.to_string()),
                });
            }
            _ => tracing::warn!(%err, "invalid message from relay"),
        }
    }

    fn on_forwarded_command(&mut self, id: CallId, command: CdpForward) {
        let reply = Reply::Relay {
            id,
            epoch: self.epoch,
        };
        let CdpForward {
            method,
            session_id,
            params,
        } = command;
        match (method.as_str(), session_id) {
            (methods::CREATE_TARGET, None) => {
                let url = params
                    .get("url")
                    .and_then(Value::as_str)
                    .filter(|url| !url.is_empty())
                    .unwrap_or("about:blank")
                    .to_string();
                let origin = AttachOrigin::CreateTarget {
                    id,
                    epoch: self.epoch,
                };
                self.create_tab(url, origin);
            }
            (methods::CLOSE_TARGET, None) => self.close_target(&params, reply),
            (_, Some(session_id)) => self.dispatch(session_id, method, params, reply),
            (_, None) => self.finish(reply, Err(DebuggerError::MissingSession(method))),
        }
    }

    fn on_handle_message(&mut self, msg: PeerMessage) {
        match msg {
            PeerMessage::Attach { tab_id, ack } => self.attach(tab_id, ack),
            PeerMessage::Detach { tab_id, ack } => self.detach(tab_id, ack),
            PeerMessage::Dispatch {
                session_id,
                method,
                params,
                ack,
            } => self.dispatch(session_id, method, params, Reply::Handle(ack)),
            PeerMessage::Tabs(ack) => {
                let _ = ack.send(self.tabs());
            }
        }
    }

    fn attach(&mut self, tab_id: TabId, ack: oneshot::Sender<Result<AttachedTab, DebuggerError>>) {
        match self.tabs.get(&tab_id) {
            Some(entry) if entry.state == TabState::Connected => {
                let attached = entry
                    .session_id
                    .clone()
                    .zip(entry.info.clone())
                    .map(|(session_id, target_info)| AttachedTab {
                        session_id,
                        target_info,
                    })
                    .ok_or(DebuggerError::TabNotFound(tab_id));
                let _ = ack.send(attached);
            }
            Some(entry) if entry.state == TabState::Connecting => {
                let _ = ack.send(Err(DebuggerError::AlreadyConnecting(tab_id)));
            }
            _ if !self.relay_connected => {
                let _ = ack.send(Err(DebuggerError::RelayNotConnected));
            }
            _ => self.start_attach(tab_id, AttachOrigin::Handle(ack)),
        }
    }

    fn start_attach(&mut self, tab_id: TabId, origin: AttachOrigin) {
        let attempt = self.next_attempt();
        let entry = self.tabs.entry(tab_id).or_insert_with(TabEntry::new);
        entry.state = TabState::Connecting;
        entry.attempt = attempt;
        entry.session_id = None;
        entry.info = None;
        entry.error = None;
        entry.awaiting_relay = false;
        self.push_state(tab_id);

        let debugger = Arc::clone(&self.debugger);
        let timeout = self.config.request_timeout;
        self.in_flight.push(
            async move {
                let what = format!("attach to tab {}", tab_id);
                let result = with_timeout(timeout, what, attach_tab(debugger, tab_id)).await;
                Completion::Attached {
                    tab_id,
                    attempt,
                    origin,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn on_attached(
        &mut self,
        tab_id: TabId,
        attempt: u64,
        origin: AttachOrigin,
        result: Result<TargetInfo, DebuggerError>,
    ) {
        let current = self.tabs.get(&tab_id).map_or(false, |entry| {
            entry.state == TabState::Connecting && entry.attempt == attempt
        });
        if !current {
            tracing::debug!(%tab_id, "discarding outdated attach");
            if result.is_ok() {
                self.detach_in_background(tab_id);
            }
            self.fail_origin(origin, DebuggerError::TabNotFound(tab_id));
            return;
        }

        let info = match result {
            Ok(info) => info,
            Err(err) => {
                if matches!(err, DebuggerError::Timeout(_)) {
                    self.detach_in_background(tab_id);
                }
                if let AttachOrigin::Reattach = origin {
                    tracing::info!(%tab_id, %err, "discarding tab that could not be re-attached");
                    if let Some(entry) = self.tabs.remove(&tab_id) {
                        self.events.push_back(PeerEvent::TabState(TabSnapshot {
                            tab_id,
                            state: TabState::Idle,
                            session_id: None,
                            target_info: entry.info,
                            error: Some(err.to_string()),
                        }));
                    }
                    return;
                }
                tracing::warn!(%tab_id, %err, "attach failed");
                if let Some(entry) = self.tabs.get_mut(&tab_id) {
                    entry.state = TabState::Error;
                    entry.error = Some(err.to_string());
                }
                self.push_state(tab_id);
                self.fail_origin(origin, err);
                return;
            }
        };

        if !self.relay_connected {
            // no session without a relay, try again once the link is back
            if let Some(entry) = self.tabs.get_mut(&tab_id) {
                entry.awaiting_relay = true;
                entry.info = Some(info);
            }
            self.detach_in_background(tab_id);
            self.push_state(tab_id);
            self.fail_origin(origin, DebuggerError::RelayNotConnected);
            return;
        }

        let session_id = self.mint_session_id();
        let target_info = TargetInfo {
            attached: true,
            ..info
        };
        if let Some(entry) = self.tabs.get_mut(&tab_id) {
            entry.state = TabState::Connected;
            entry.session_id = Some(session_id.clone());
            entry.info = Some(target_info.clone());
        }
        self.sessions.insert(session_id.clone(), tab_id);
        tracing::info!(%tab_id, session = %session_id, "tab connected");
        self.push_state(tab_id);

        let attached = AttachedTab {
            session_id,
            target_info,
        };
        match origin {
            AttachOrigin::InitialTab { id, epoch } if epoch == self.epoch => {
                self.send(FromExtension::Response {
                    id,
                    outcome: Ok(json!({
                        "success": true,
                        "sessionId": attached.session_id,
                        "targetInfo": attached.target_info,
                    })),
                });
            }
            AttachOrigin::CreateTarget { id, epoch } if epoch == self.epoch => {
                self.announce(&attached);
                self.send(FromExtension::Response {
                    id,
                    outcome: Ok(json!({ "targetId": attached.target_info.target_id })),
                });
            }
            AttachOrigin::Handle(ack) => {
                self.announce(&attached);
                let _ = ack.send(Ok(attached));
            }
            _ => self.announce(&attached),
        }
    }

    fn announce(&mut self, attached: &AttachedTab) {
        self.send_event(
            methods::ATTACHED_TO_TARGET,
            None,
            json!({
                "sessionId": attached.session_id,
                "targetInfo": attached.target_info,
                "waitingForDebugger": false,
            }),
        );
    }

    fn fail_origin(&mut self, origin: AttachOrigin, err: DebuggerError) {
        match origin {
            AttachOrigin::Handle(ack) => {
                let _ = ack.send(Err(err));
            }
            AttachOrigin::InitialTab { id, epoch } if epoch == self.epoch => {
                self.send(FromExtension::Response {
                    id,
                    outcome: Ok(json!({ "success": false, "error": err.to_string() })),
                });
            }
            AttachOrigin::CreateTarget { id, epoch } if epoch == self.epoch => {
                self.send(FromExtension::Response {
                    id,
                    outcome: Err(err.to_string()),
                });
            }
            _ => {}
        }
    }

    fn create_tab(&mut self, url: String, origin: AttachOrigin) {
        let debugger = Arc::clone(&self.debugger);
        let timeout = self.config.request_timeout;
        self.in_flight.push(
            async move {
                let result =
                    with_timeout(timeout, "create tab".to_string(), debugger.create_tab(&url))
                        .await;
                Completion::TabCreated { origin, result }
            }
            .boxed(),
        );
    }

    fn close_target(&mut self, params: &Value, reply: Reply) {
        let Some(target_id) = params.get("targetId").and_then(Value::as_str) else {
            return self.finish(
                reply,
                Err(DebuggerError::Native("targetId is required".to_string())),
            );
        };
        let tab_id = self
            .tabs
            .iter()
            .find(|(_, entry)| {
                entry
                    .info
                    .as_ref()
                    .map_or(false, |info| info.target_id == target_id)
            })
            .map(|(tab_id, _)| *tab_id);
        let Some(tab_id) = tab_id else {
            return self.finish(
                reply,
                Err(DebuggerError::UnknownTarget(target_id.to_string())),
            );
        };
        let close_window = params
            .get("closeWindow")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let debugger = Arc::clone(&self.debugger);
        self.in_flight.push(
            async move {
                let res = if close_window {
                    debugger.close_window(tab_id).await
                } else {
                    debugger.close_tab(tab_id).await
                };
                Completion::Command {
                    reply,
                    result: res.map(|_| json!({ "success": true })),
                }
            }
            .boxed(),
        );
    }

    /// Resolves a relay visible session id to what the debugger addresses
    fn resolve(&self, session_id: &str) -> Option<DebuggeeId> {
        if let Some(tab_id) = self.sessions.get(session_id) {
            return self
                .tabs
                .get(tab_id)
                .filter(|entry| entry.state == TabState::Connected)
                .map(|_| DebuggeeId::tab(*tab_id));
        }
        self.children
            .get(session_id)
            .map(|child| DebuggeeId::child(child.tab_id, session_id))
    }

    fn dispatch(&mut self, session_id: String, method: String, params: Value, reply: Reply) {
        let Some(target) = self.resolve(&session_id) else {
            return self.finish(reply, Err(DebuggerError::UnknownSession(session_id)));
        };
        let debugger = Arc::clone(&self.debugger);
        let timeout = self.config.request_timeout;
        self.in_flight.push(
            async move {
                let what = method.clone();
                let result =
                    with_timeout(timeout, what, debugger.send_command(target, &method, params))
                        .await;
                Completion::Command { reply, result }
            }
            .boxed(),
        );
    }

    fn finish(&mut self, reply: Reply, result: Result<Value, DebuggerError>) {
        match reply {
            Reply::Relay { id, epoch } if epoch == self.epoch => {
                self.send(FromExtension::Response {
                    id,
                    outcome: result.map_err(|err| err.to_string()),
                });
            }
            Reply::Relay { id, .. } => {
                tracing::debug!(%id, "dropping reply for a previous relay link")
            }
            Reply::Handle(ack) => {
                let _ = ack.send(result);
            }
        }
    }

    fn detach(&mut self, tab_id: TabId, ack: oneshot::Sender<()>) {
        match self.tabs.get(&tab_id).map(|entry| entry.state) {
            Some(TabState::Connected) => self.drop_session(tab_id),
            Some(TabState::Connecting) | Some(TabState::Error) => {}
            Some(TabState::Idle) | None => {
                let _ = ack.send(());
                return;
            }
        }
        let attempt = self.next_attempt();
        if let Some(entry) = self.tabs.get_mut(&tab_id) {
            *entry = TabEntry {
                attempt,
                ..TabEntry::new()
            };
        }
        self.push_state(tab_id);

        let debugger = Arc::clone(&self.debugger);
        self.in_flight.push(
            async move {
                if let Err(err) = debugger.detach(tab_id).await {
                    tracing::debug!(%tab_id, %err, "detach failed");
                }
                let _ = ack.send(());
                Completion::Done
            }
            .boxed(),
        );
    }

    /// Tells the relay the tab's session is gone, then forgets it
    fn drop_session(&mut self, tab_id: TabId) {
        let Some(entry) = self.tabs.get(&tab_id) else {
            return;
        };
        let Some(session_id) = entry.session_id.clone() else {
            return;
        };
        let target_id = entry.info.as_ref().map(|info| info.target_id.clone());
        self.send_event(
            methods::DETACHED_FROM_TARGET,
            None,
            json!({ "sessionId": session_id, "targetId": target_id }),
        );
        self.sessions.remove(&session_id);
        self.children.retain(|_, child| child.tab_id != tab_id);
        tracing::info!(%tab_id, session = %session_id, "tab disconnected");
    }

    fn on_native_event(&mut self, event: DebuggerEvent) {
        match event {
            DebuggerEvent::Cdp {
                source,
                method,
                params,
            } => self.forward_native_event(source, method, params),
            DebuggerEvent::Detached { tab_id, reason } => {
                if self.tab_state(tab_id) != TabState::Connected {
                    return;
                }
                tracing::info!(%tab_id, %reason, "debugger detached");
                self.drop_session(tab_id);
                if let Some(entry) = self.tabs.get_mut(&tab_id) {
                    *entry = TabEntry {
                        attempt: entry.attempt,
                        ..TabEntry::new()
                    };
                }
                self.push_state(tab_id);
            }
            DebuggerEvent::TabRemoved { tab_id } => {
                if self.tab_state(tab_id) == TabState::Connected {
                    self.drop_session(tab_id);
                }
                if self.tabs.remove(&tab_id).is_some() {
                    self.events.push_back(PeerEvent::TabState(TabSnapshot {
                        tab_id,
                        state: TabState::Idle,
                        session_id: None,
                        target_info: None,
                        error: None,
                    }));
                }
            }
            DebuggerEvent::TabUpdated { tab_id, info } => self.on_tab_updated(tab_id, info),
        }
    }

    fn on_tab_updated(&mut self, tab_id: TabId, update: TabInfo) {
        let Some(entry) = self.tabs.get_mut(&tab_id) else {
            return;
        };
        if entry.state != TabState::Connected {
            return;
        }
        let Some(info) = entry.info.as_mut() else {
            return;
        };
        if info.url == update.url && info.title == update.title {
            return;
        }
        info.url = update.url;
        info.title = update.title;
        let info = info.clone();
        self.push_state(tab_id);
        self.send_event(
            methods::TARGET_INFO_CHANGED,
            None,
            json!({ "targetInfo": info }),
        );
    }

    fn forward_native_event(&mut self, source: DebuggeeId, method: String, params: Value) {
        let Some(tab_session) = self
            .tabs
            .get(&source.tab_id)
            .filter(|entry| entry.state == TabState::Connected)
            .and_then(|entry| entry.session_id.clone())
        else {
            tracing::trace!(tab_id = %source.tab_id, %method, "event for untracked tab");
            return;
        };

        match method.as_str() {
            methods::ATTACHED_TO_TARGET => {
                match serde_json::from_value::<AttachedToTarget>(params.clone()) {
                    Ok(ev) if !ev.target_info.is_page_or_iframe() => {
                        tracing::trace!(target_type = %ev.target_info.r#type, "ignoring auto-attached target");
                        return;
                    }
                    Ok(ev) => {
                        self.children.insert(
                            ev.session_id,
                            ChildSession {
                                tab_id: source.tab_id,
                                target_id: ev.target_info.target_id,
                            },
                        );
                    }
                    Err(err) => tracing::warn!(%err, "malformed attachedToTarget"),
                }
            }
            methods::DETACHED_FROM_TARGET => {
                if let Some(child) = params.get("sessionId").and_then(Value::as_str) {
                    if let Some(removed) = self.children.remove(child) {
                        tracing::trace!(target_id = %removed.target_id, "child session detached");
                    }
                }
            }
            _ => {}
        }

        let session_id = source.session_id.unwrap_or(tab_session);
        self.send_event(&method, Some(session_id), params);
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Attached {
                tab_id,
                attempt,
                origin,
                result,
            } => self.on_attached(tab_id, attempt, origin, result),
            Completion::TabCreated { origin, result } => match result {
                Ok(tab_id) => self.start_attach(tab_id, origin),
                Err(err) => {
                    tracing::warn!(%err, "failed to create tab");
                    self.fail_origin(origin, err)
                }
            },
            Completion::Command { reply, result } => self.finish(reply, result),
            Completion::Done => {}
        }
    }
}

impl Stream for ExtensionPeer {
    type Item = PeerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        loop {
            if let Some(event) = pin.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            let mut done = true;

            if let Poll::Ready(Some(msg)) = Pin::new(&mut pin.from_handles).poll_next(cx) {
                pin.on_handle_message(msg);
                done = false;
            }

            match Pin::new(&mut pin.native_events).poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    pin.on_native_event(event);
                    done = false;
                }
                // the browser went away
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => {}
            }

            if let Poll::Ready(Some(completion)) = pin.in_flight.poll_next_unpin(cx) {
                pin.on_completion(completion);
                done = false;
            }

            if done {
                return Poll::Pending;
            }
        }
    }
}

/// Attaches the debugger and collects the tab's metadata. A failure after the
/// native attach detaches again.
async fn attach_tab(debugger: Arc<dyn Debugger>, tab_id: TabId) -> Result<TargetInfo, DebuggerError> {
    let tab = debugger
        .tab(tab_id)
        .await?
        .ok_or(DebuggerError::TabNotFound(tab_id))?;
    if is_restricted_url(&tab.url) {
        return Err(DebuggerError::Restricted(tab.url));
    }

    debugger.attach(tab_id).await?;
    let res = async {
        debugger
            .send_command(DebuggeeId::tab(tab_id), methods::PAGE_ENABLE, json!({}))
            .await?;
        let value = debugger
            .send_command(DebuggeeId::tab(tab_id), methods::GET_TARGET_INFO, json!({}))
            .await?;
        serde_json::from_value::<TargetInfo>(value["targetInfo"].clone())
            .map_err(|err| DebuggerError::Native(format!("invalid target info: {}", err)))
    }
    .await;
    if res.is_err() {
        let _ = debugger.detach(tab_id).await;
    }
    res
}

async fn with_timeout<T>(
    timeout: Duration,
    what: String,
    fut: impl Future<Output = Result<T, DebuggerError>>,
) -> Result<T, DebuggerError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(DebuggerError::Timeout(what)))
}

/// Handle to a running [`ExtensionPeer`], used by the user facing layer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    sender: Sender<PeerMessage>,
}

impl PeerHandle {
    async fn call<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> PeerMessage,
    ) -> Result<T, DebuggerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .clone()
            .send(msg(tx))
            .await
            .map_err(|_| DebuggerError::PeerGone)?;
        rx.await.map_err(|_| DebuggerError::PeerGone)
    }

    /// Attaches to the tab, or returns the existing session if it is already
    /// connected.
    pub async fn attach(&self, tab_id: TabId) -> Result<AttachedTab, DebuggerError> {
        self.call(|ack| PeerMessage::Attach { tab_id, ack }).await?
    }

    /// Detaches from the tab. Errors of the native detach are swallowed.
    pub async fn detach(&self, tab_id: TabId) -> Result<(), DebuggerError> {
        self.call(|ack| PeerMessage::Detach { tab_id, ack }).await
    }

    /// Sends a protocol command to the tab or child session owning
    /// `session_id`.
    pub async fn dispatch(
        &self,
        session_id: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Result<Value, DebuggerError> {
        let session_id = session_id.into();
        let method = method.into();
        self.call(|ack| PeerMessage::Dispatch {
            session_id,
            method,
            params,
            ack,
        })
        .await?
    }

    pub async fn tabs(&self) -> Result<Vec<TabSnapshot>, DebuggerError> {
        self.call(PeerMessage::Tabs).await
    }
}
