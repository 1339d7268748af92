use std::borrow::Cow;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use futures::channel::mpsc::{Receiver, UnboundedSender};
use futures::channel::oneshot::Sender as OneshotSender;
use futures::stream::{Fuse, Stream, StreamExt};
use futures::task::{Context, Poll};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nutbot_relay_types::extension::{
    CdpForward, CreateInitialTabResult, FromExtension, FromRelay, LogParams, NotificationParams,
};
use nutbot_relay_types::{methods, CallId, EventMessage, Request, Response, TargetInfo};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::handler::cmd::CommandMessage;
use crate::handler::job::PeriodicJob;
use crate::handler::session::ConnectedTarget;
use crate::handler::target::{TargetChange, TargetRegistry};

pub mod cmd;
pub(crate) mod commandfuture;
mod job;
pub mod session;
pub mod target;

/// The previous extension connection was replaced by a new one
pub const CLOSE_REPLACED: u16 = 4001;
/// The extension slot is held by a connection with live sessions
pub const CLOSE_SLOT_BUSY: u16 = 4002;
/// A control client with the same id is already connected
pub const CLOSE_DUPLICATE_CLIENT: u16 = 4003;

pub const PROTOCOL_VERSION: &str = "1.3";
pub const PRODUCT: &str = concat!("Chrome/NutbotRelay-", env!("CARGO_PKG_VERSION"));

pub type ClientId = String;

/// Identifies one extension connection, so that a replaced connection that
/// closes late cannot tear down its successor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// What the hub writes to a connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: Cow<'static, str> },
}

/// Outcome of offering a new extension connection to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(ConnectionId),
    /// The slot is busy, the connection was sent a close frame
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub connected: bool,
    pub active_targets: usize,
}

/// The state the discovery endpoints render
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub extension_connected: bool,
    pub targets: Vec<TargetInfo>,
}

/// Messages used to communicate with the hub, which are executed in the
/// background
#[derive(Debug)]
pub enum HubMessage {
    ExtensionConnected {
        tx: UnboundedSender<Outbound>,
        ack: OneshotSender<Admission>,
    },
    ExtensionFrame {
        conn: ConnectionId,
        text: String,
    },
    ExtensionClosed {
        conn: ConnectionId,
    },
    ClientConnected {
        client_id: Option<ClientId>,
        tx: UnboundedSender<Outbound>,
        ack: OneshotSender<Result<ClientId>>,
    },
    ClientCommand(CommandMessage),
    ClientClosed {
        client_id: ClientId,
    },
    Status(OneshotSender<ExtensionStatus>),
    Snapshot(OneshotSender<Snapshot>),
    Notify {
        params: NotificationParams,
        ack: OneshotSender<Result<()>>,
    },
}

/// Things that happened inside the hub, yielded by its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    ExtensionConnected(ConnectionId),
    ExtensionReplaced(ConnectionId),
    ExtensionRejected,
    ExtensionDisconnected {
        dropped_sessions: usize,
        rejected_requests: usize,
    },
    ClientConnected(ClientId),
    ClientRejected(ClientId),
    ClientDisconnected(ClientId),
    TargetAttached(String),
    TargetDetached(String),
    RequestTimedOut { id: CallId, method: String },
}

/// The relay hub.
///
/// Owns the single extension slot, every control client, the session
/// registry and all requests in flight to the extension. Connections only
/// talk to it through [`HubMessage`]s, so none of its state is shared.
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Hub {
    config: RelayConfig,
    /// Messages from connections and handles
    from_conns: Fuse<Receiver<HubMessage>>,
    extension: Option<ExtensionSlot>,
    clients: FnvHashMap<ClientId, UnboundedSender<Outbound>>,
    targets: TargetRegistry,
    /// Requests sent to the extension awaiting a response
    pending: FnvHashMap<CallId, PendingRequest>,
    /// The `createInitialTab` request currently in flight
    bootstrap: Option<CallId>,
    next_call_id: u64,
    next_conn_id: u64,
    next_client_id: u64,
    /// Evicts timed out requests periodically
    evict_timed_out: PeriodicJob,
    keepalive: PeriodicJob,
    events: VecDeque<HubEvent>,
}

#[derive(Debug)]
struct ExtensionSlot {
    id: ConnectionId,
    tx: UnboundedSender<Outbound>,
}

#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    method: String,
    deadline: Instant,
}

/// A control client waiting for the outcome of an extension request
#[derive(Debug)]
struct Waiter {
    client_id: ClientId,
    request_id: CallId,
    session_id: Option<String>,
    done: OneshotSender<()>,
}

#[derive(Debug)]
enum PendingKind {
    /// A client command forwarded to the extension
    Forward(Waiter),
    /// `createInitialTab` issued while answering `Target.setAutoAttach`,
    /// every client that asked while it was in flight waits for it
    Bootstrap(Vec<Waiter>),
}

/// How a client command is answered
enum Routed {
    /// Answered by the hub, `events` follow the response
    Reply {
        result: Result<Value>,
        events: Vec<EventMessage>,
    },
    Forward(CdpForward),
    Bootstrap,
}

impl Routed {
    fn reply(result: Result<Value>) -> Self {
        Routed::Reply {
            result,
            events: Vec::new(),
        }
    }

    fn forward(request: &Request) -> Self {
        Routed::Forward(CdpForward {
            method: request.method.clone(),
            session_id: request.session_id.clone(),
            params: request.params.clone(),
        })
    }
}

impl Hub {
    /// Create a new `Hub` that listens for messages on the receiver `rx`.
    pub(crate) fn new(config: RelayConfig, rx: Receiver<HubMessage>) -> Self {
        Self {
            evict_timed_out: PeriodicJob::new(config.evict_interval),
            keepalive: PeriodicJob::new(config.keepalive_interval),
            config,
            from_conns: rx.fuse(),
            extension: None,
            clients: Default::default(),
            targets: Default::default(),
            pending: Default::default(),
            bootstrap: None,
            next_call_id: 0,
            next_conn_id: 0,
            next_client_id: 0,
            events: Default::default(),
        }
    }

    fn on_message(&mut self, msg: HubMessage, now: Instant) {
        match msg {
            HubMessage::ExtensionConnected { tx, ack } => self.on_extension_connected(tx, ack),
            HubMessage::ExtensionFrame { conn, text } => self.on_extension_frame(conn, &text),
            HubMessage::ExtensionClosed { conn } => self.on_extension_closed(conn),
            HubMessage::ClientConnected { client_id, tx, ack } => {
                self.on_client_connected(client_id, tx, ack)
            }
            HubMessage::ClientCommand(cmd) => self.on_client_command(cmd, now),
            HubMessage::ClientClosed { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    tracing::debug!(client = %client_id, "control client disconnected");
                    self.events.push_back(HubEvent::ClientDisconnected(client_id));
                }
            }
            HubMessage::Status(tx) => {
                let _ = tx.send(self.status());
            }
            HubMessage::Snapshot(tx) => {
                let _ = tx.send(Snapshot {
                    extension_connected: self.extension.is_some(),
                    targets: self.targets.targets().map(|t| t.attached_info()).collect(),
                });
            }
            HubMessage::Notify { params, ack } => {
                let res = if self.extension.is_some() {
                    self.send_to_extension(&FromRelay::ShowNotification(params));
                    Ok(())
                } else {
                    Err(RelayError::NotConnected)
                };
                let _ = ack.send(res);
            }
        }
    }

    fn status(&self) -> ExtensionStatus {
        ExtensionStatus {
            connected: self.extension.is_some(),
            active_targets: self.targets.len(),
        }
    }

    /// Admission policy of the extension slot: an idle connection is replaced,
    /// a connection with live sessions keeps the slot.
    fn on_extension_connected(
        &mut self,
        tx: UnboundedSender<Outbound>,
        ack: OneshotSender<Admission>,
    ) {
        if self.extension.is_some() {
            if !self.targets.is_empty() {
                tracing::warn!(
                    sessions = self.targets.len(),
                    "rejecting extension connection, slot busy"
                );
                let _ = tx.unbounded_send(Outbound::Close {
                    code: CLOSE_SLOT_BUSY,
                    reason: "Extension slot busy".into(),
                });
                let _ = ack.send(Admission::Rejected);
                self.events.push_back(HubEvent::ExtensionRejected);
                return;
            }
            if let Some(old) = self.extension.take() {
                tracing::info!("replacing idle extension connection");
                let _ = old.tx.unbounded_send(Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "Replaced by new extension connection".into(),
                });
                self.drop_extension_state();
                self.events.push_back(HubEvent::ExtensionReplaced(old.id));
            }
        }

        let id = ConnectionId(self.next_conn_id);
        self.next_conn_id = self.next_conn_id.wrapping_add(1);
        if ack.send(Admission::Accepted(id)).is_ok() {
            tracing::info!("extension connected");
            self.extension = Some(ExtensionSlot { id, tx });
            // first frame of an admitted link, a rejected one only sees the close
            self.send_to_extension(&FromRelay::Ping);
            self.events.push_back(HubEvent::ExtensionConnected(id));
        }
    }

    fn on_extension_closed(&mut self, conn: ConnectionId) {
        if self.extension.as_ref().map(|slot| slot.id) != Some(conn) {
            // a replaced or rejected connection went away
            return;
        }
        self.extension = None;
        let (dropped_sessions, rejected_requests) = self.drop_extension_state();
        tracing::info!(
            dropped_sessions,
            rejected_requests,
            "extension disconnected"
        );
        self.events.push_back(HubEvent::ExtensionDisconnected {
            dropped_sessions,
            rejected_requests,
        });
    }

    /// Rejects every request in flight to the extension and forgets all of its
    /// sessions
    fn drop_extension_state(&mut self) -> (usize, usize) {
        let ids: Vec<CallId> = self.pending.keys().copied().collect();
        let rejected = ids.len();
        for id in ids {
            self.settle(id, Err(RelayError::Disconnected));
        }
        let removed = self.targets.clear();
        for target in &removed {
            let event = detached_event(target);
            self.broadcast(&event, None);
            self.events
                .push_back(HubEvent::TargetDetached(target.session_id().to_string()));
        }
        (removed.len(), rejected)
    }

    fn on_extension_frame(&mut self, conn: ConnectionId, text: &str) {
        if self.extension.as_ref().map(|slot| slot.id) != Some(conn) {
            tracing::debug!("ignoring frame of stale extension connection");
            return;
        }
        match FromExtension::parse(text) {
            Ok(FromExtension::Response { id, outcome }) => {
                self.settle(id, outcome.map_err(RelayError::Upstream))
            }
            Ok(FromExtension::Ping) => self.send_to_extension(&FromRelay::Pong),
            Ok(FromExtension::Pong) => {}
            Ok(FromExtension::Log(params)) => log_extension(params),
            Ok(FromExtension::ForwardCdpEvent(event)) => self.on_extension_event(event),
            Err(err) => tracing::warn!(%err, "invalid message from extension"),
        }
    }

    /// Updates the registry and hands the event to every control client
    fn on_extension_event(&mut self, event: CdpForward) {
        match self
            .targets
            .on_event(&event.method, event.session_id.as_deref(), &event.params)
        {
            Some(TargetChange::Attached {
                session_id,
                evicted,
            }) => {
                if let Some(evicted) = evicted {
                    // clients must drop the old session before seeing the new one
                    self.broadcast(&detached_event(&evicted), None);
                    self.events.push_back(HubEvent::TargetDetached(
                        evicted.session_id().to_string(),
                    ));
                }
                tracing::debug!(session = %session_id, "target attached");
                self.events.push_back(HubEvent::TargetAttached(session_id));
            }
            Some(TargetChange::Detached(session_id)) => {
                tracing::debug!(session = %session_id, "target detached");
                self.events.push_back(HubEvent::TargetDetached(session_id));
            }
            _ => {}
        }
        let message = EventMessage::new(event.method, event.params).with_session(event.session_id);
        self.broadcast(&message, None);
    }

    fn on_client_connected(
        &mut self,
        client_id: Option<ClientId>,
        tx: UnboundedSender<Outbound>,
        ack: OneshotSender<Result<ClientId>>,
    ) {
        let client_id = client_id.unwrap_or_else(|| self.next_client_id());
        if self.clients.contains_key(&client_id) {
            tracing::warn!(client = %client_id, "rejecting duplicate control client");
            let _ = tx.unbounded_send(Outbound::Close {
                code: CLOSE_DUPLICATE_CLIENT,
                reason: "Client id already connected".into(),
            });
            let _ = ack.send(Err(RelayError::DuplicateClient(client_id.clone())));
            self.events.push_back(HubEvent::ClientRejected(client_id));
            return;
        }
        if ack.send(Ok(client_id.clone())).is_ok() {
            tracing::debug!(client = %client_id, "control client connected");
            self.clients.insert(client_id.clone(), tx);
            self.events.push_back(HubEvent::ClientConnected(client_id));
        }
    }

    fn next_client_id(&mut self) -> ClientId {
        loop {
            self.next_client_id += 1;
            let id = format!("client-{}", self.next_client_id);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    fn on_client_command(&mut self, cmd: CommandMessage, now: Instant) {
        let CommandMessage {
            client_id,
            request,
            done,
        } = cmd;
        match self.route(&request) {
            Routed::Reply { result, events } => {
                self.reply(&client_id, request.id, request.session_id, result);
                for event in &events {
                    self.send_to_client(&client_id, event);
                }
                let _ = done.send(());
            }
            Routed::Forward(command) => {
                let waiter = Waiter {
                    client_id,
                    request_id: request.id,
                    session_id: request.session_id,
                    done,
                };
                let timeout = self.config.request_timeout;
                self.submit(
                    |id| FromRelay::ForwardCdpCommand { id, command },
                    PendingKind::Forward(waiter),
                    request.method,
                    timeout,
                    now,
                );
            }
            Routed::Bootstrap => {
                let waiter = Waiter {
                    client_id,
                    request_id: request.id,
                    session_id: None,
                    done,
                };
                if let Some(PendingKind::Bootstrap(waiters)) = self
                    .bootstrap
                    .and_then(|id| self.pending.get_mut(&id))
                    .map(|pending| &mut pending.kind)
                {
                    waiters.push(waiter);
                    return;
                }
                tracing::info!("no targets yet, asking the extension for an initial tab");
                let timeout = self.config.bootstrap_timeout;
                let id = self.submit(
                    |id| FromRelay::CreateInitialTab { id },
                    PendingKind::Bootstrap(vec![waiter]),
                    methods::SET_AUTO_ATTACH.to_string(),
                    timeout,
                    now,
                );
                if self.pending.contains_key(&id) {
                    self.bootstrap = Some(id);
                }
            }
        }
    }

    /// Decides how a client command is answered
    fn route(&self, request: &Request) -> Routed {
        let session_id = request.session_id.as_deref();
        match (request.method.as_str(), session_id) {
            (methods::BROWSER_GET_VERSION, _) => Routed::reply(Ok(version_info())),
            (methods::SET_DISCOVER_TARGETS, _) => {
                let discover = request
                    .params
                    .get("discover")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let events = if discover {
                    self.targets
                        .targets()
                        .map(|t| {
                            EventMessage::new(
                                methods::TARGET_CREATED,
                                json!({ "targetInfo": t.attached_info() }),
                            )
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                Routed::Reply {
                    result: Ok(json!({})),
                    events,
                }
            }
            (methods::GET_TARGETS, _) => {
                let infos: Vec<_> = self.targets.targets().map(|t| t.attached_info()).collect();
                Routed::reply(Ok(json!({ "targetInfos": infos })))
            }
            // only the extension knows the child's own target
            (methods::GET_TARGET_INFO, Some(session_id))
                if request.str_param("targetId").is_none()
                    && self.targets.child(session_id).is_some() =>
            {
                Routed::forward(request)
            }
            (methods::GET_TARGET_INFO, _) => Routed::reply(self.target_info(request)),
            (methods::ATTACH_TO_TARGET, _) => {
                let result = match request.str_param("targetId") {
                    None => Err(RelayError::MissingParam("targetId")),
                    Some(target_id) => self
                        .targets
                        .by_target_id(target_id)
                        .map(|t| json!({ "sessionId": t.session_id() }))
                        .ok_or_else(|| RelayError::TargetNotFound(target_id.to_string())),
                };
                Routed::reply(result)
            }
            (methods::SET_AUTO_ATTACH, None) => {
                if !self.targets.is_empty() {
                    Routed::Reply {
                        result: Ok(json!({})),
                        events: self.attached_events(),
                    }
                } else if self.extension.is_none() {
                    Routed::reply(Err(RelayError::NotConnected))
                } else {
                    Routed::Bootstrap
                }
            }
            _ if self.extension.is_none() => Routed::reply(Err(RelayError::NotConnected)),
            (_, Some(session_id)) if !self.targets.contains_session(session_id) => {
                Routed::reply(Err(RelayError::NoSuchSession(session_id.to_string())))
            }
            _ => Routed::forward(request),
        }
    }

    fn target_info(&self, request: &Request) -> Result<Value> {
        let target = match (request.str_param("targetId"), request.session_id.as_deref()) {
            (Some(target_id), _) => Some(
                self.targets
                    .by_target_id(target_id)
                    .ok_or_else(|| RelayError::TargetNotFound(target_id.to_string()))?,
            ),
            (None, Some(session_id)) => Some(
                self.targets
                    .get(session_id)
                    .ok_or_else(|| RelayError::NoSuchSession(session_id.to_string()))?,
            ),
            (None, None) => self.targets.targets().next(),
        };
        let info = match target {
            Some(target) => serde_json::to_value(target.attached_info())?,
            None => json!({
                "targetId": "browser",
                "type": "browser",
                "title": "",
                "url": "",
                "attached": true
            }),
        };
        Ok(json!({ "targetInfo": info }))
    }

    /// One `Target.attachedToTarget` per known target
    fn attached_events(&self) -> Vec<EventMessage> {
        self.targets.targets().map(attached_event).collect()
    }

    /// Sends the request to the extension and tracks it until it settles.
    ///
    /// Without an extension the request settles right away.
    fn submit(
        &mut self,
        message: impl FnOnce(CallId) -> FromRelay,
        kind: PendingKind,
        method: String,
        timeout: Duration,
        now: Instant,
    ) -> CallId {
        let id = CallId::new(self.next_call_id);
        self.next_call_id = self.next_call_id.wrapping_add(1);
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                method,
                deadline: now + timeout,
            },
        );
        let sent = self.extension.as_ref().map_or(false, |slot| {
            slot.tx
                .unbounded_send(Outbound::Text(message(id).to_json()))
                .is_ok()
        });
        if !sent {
            self.settle(id, Err(RelayError::NotConnected));
        }
        id
    }

    /// The only place a pending request is resolved, regardless of whether it
    /// succeeded, timed out or its connection dropped.
    fn settle(&mut self, id: CallId, outcome: Result<Value>) {
        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!(%id, "discarding response to unknown or expired request");
            return;
        };
        match pending.kind {
            PendingKind::Forward(waiter) => {
                self.reply(
                    &waiter.client_id,
                    waiter.request_id,
                    waiter.session_id,
                    outcome,
                );
                let _ = waiter.done.send(());
            }
            PendingKind::Bootstrap(waiters) => {
                self.bootstrap = None;
                self.on_bootstrap_settled(waiters, outcome);
            }
        }
    }

    fn on_bootstrap_settled(&mut self, waiters: Vec<Waiter>, outcome: Result<Value>) {
        let created = outcome.and_then(|value| {
            let res: CreateInitialTabResult = serde_json::from_value(value)?;
            match (res.success, res.session_id, res.target_info) {
                (true, Some(session_id), Some(info)) => Ok(ConnectedTarget::new(session_id, info)),
                _ => Err(RelayError::Upstream(
                    res.error
                        .unwrap_or_else(|| "Failed to create initial tab".to_string()),
                )),
            }
        });

        match created {
            Ok(target) => {
                let event = attached_event(&target);
                let session_id = target.session_id().to_string();
                tracing::info!(session = %session_id, "initial tab attached");
                if let Some(evicted) = self.targets.insert(target) {
                    self.broadcast(&detached_event(&evicted), None);
                    self.events.push_back(HubEvent::TargetDetached(
                        evicted.session_id().to_string(),
                    ));
                }
                self.events
                    .push_back(HubEvent::TargetAttached(session_id));

                let seeded: Vec<&str> = waiters.iter().map(|w| w.client_id.as_str()).collect();
                for client_id in self.clients.keys() {
                    if !seeded.contains(&client_id.as_str()) {
                        send_json(&self.clients[client_id], &event);
                    }
                }
                let events = self.attached_events();
                for waiter in waiters {
                    self.reply(&waiter.client_id, waiter.request_id, None, Ok(json!({})));
                    for event in &events {
                        self.send_to_client(&waiter.client_id, event);
                    }
                    let _ = waiter.done.send(());
                }
            }
            Err(err) => {
                tracing::warn!(%err, "initial tab bootstrap failed");
                for waiter in waiters {
                    self.reply(
                        &waiter.client_id,
                        waiter.request_id,
                        None,
                        Err(RelayError::Upstream(err.to_string())),
                    );
                    let _ = waiter.done.send(());
                }
            }
        }
    }

    fn evict_timed_out_requests(&mut self, now: Instant) {
        let expired: Vec<(CallId, String)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (*id, p.method.clone()))
            .collect();
        for (id, method) in expired {
            tracing::warn!(%id, %method, "request to extension timed out");
            self.settle(id, Err(RelayError::Timeout(method.clone())));
            self.events
                .push_back(HubEvent::RequestTimedOut { id, method });
        }
    }

    fn reply(
        &self,
        client_id: &str,
        request_id: CallId,
        session_id: Option<String>,
        result: Result<Value>,
    ) {
        let resp = match result {
            Ok(value) => Response::ok(request_id, value, session_id),
            Err(err) => Response::err(request_id, err.to_cdp_error(), session_id),
        };
        self.send_to_client(client_id, &resp);
    }

    fn send_to_client<T: Serialize>(&self, client_id: &str, msg: &T) {
        match self.clients.get(client_id) {
            Some(tx) => send_json(tx, msg),
            None => tracing::trace!(client = %client_id, "dropping message for gone client"),
        }
    }

    /// Sends the message to every connected client except `skip`
    fn broadcast<T: Serialize>(&self, msg: &T, skip: Option<&str>) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };
        for (client_id, tx) in &self.clients {
            if Some(client_id.as_str()) != skip {
                let _ = tx.unbounded_send(Outbound::Text(text.clone()));
            }
        }
    }

    fn send_to_extension(&self, msg: &FromRelay) {
        if let Some(slot) = &self.extension {
            if slot.tx.unbounded_send(Outbound::Text(msg.to_json())).is_err() {
                tracing::debug!("extension connection already closed");
            }
        }
    }
}

impl Stream for Hub {
    type Item = HubEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        loop {
            if let Some(event) = pin.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            let now = Instant::now();
            let mut done = true;

            // the receiver is fused, exhaustion means every handle is gone
            match Pin::new(&mut pin.from_conns).poll_next(cx) {
                Poll::Ready(Some(msg)) => {
                    pin.on_message(msg, now);
                    done = false;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => {}
            }

            if pin.evict_timed_out.is_ready(cx) {
                pin.evict_timed_out_requests(now);
                done = false;
            }

            if pin.keepalive.is_ready(cx) {
                pin.send_to_extension(&FromRelay::Ping);
                done = false;
            }

            if done {
                return Poll::Pending;
            }
        }
    }
}

fn send_json<T: Serialize>(tx: &UnboundedSender<Outbound>, msg: &T) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = tx.unbounded_send(Outbound::Text(text));
        }
        Err(err) => tracing::error!(%err, "failed to serialize message"),
    }
}

fn attached_event(target: &ConnectedTarget) -> EventMessage {
    EventMessage::new(
        methods::ATTACHED_TO_TARGET,
        json!({
            "sessionId": target.session_id(),
            "targetInfo": target.attached_info(),
            "waitingForDebugger": false,
        }),
    )
}

fn detached_event(target: &ConnectedTarget) -> EventMessage {
    EventMessage::new(
        methods::DETACHED_FROM_TARGET,
        json!({
            "sessionId": target.session_id(),
            "targetId": target.target_id(),
        }),
    )
}

fn version_info() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "product": PRODUCT,
        "revision": "",
        "userAgent": concat!("NutbotRelay/", env!("CARGO_PKG_VERSION")),
        "jsVersion": "",
    })
}

/// Mirrors the extension's console into the relay's log
fn log_extension(params: LogParams) {
    let text = params
        .args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    match params.level.as_str() {
        "error" => tracing::error!(target: "extension", "{}", text),
        "warn" => tracing::warn!(target: "extension", "{}", text),
        "debug" => tracing::debug!(target: "extension", "{}", text),
        _ => tracing::info!(target: "extension", "{}", text),
    }
}
