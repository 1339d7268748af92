use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::StreamExt;
use serde_json::Value;

use nutbot_relay_types::{CallId, Error as CdpErrorObject, Request, Response};

use crate::error::Result;
use crate::handler::{ClientId, Outbound};
use crate::relay::Relay;

/// A control client command travelling to the hub
#[derive(Debug)]
pub struct CommandMessage {
    pub client_id: ClientId,
    pub request: Request,
    /// Fired once the response and every follow-up event were written to the
    /// client
    pub done: oneshot::Sender<()>,
}

/// The inbound queue of a single control client.
///
/// Frames are handed to the hub strictly one after another: the next frame is
/// only submitted once the hub completed the previous one, so a client never
/// sees its second command answered before its first.
#[derive(Debug)]
pub struct ClientQueue {
    relay: Relay,
    client_id: ClientId,
    /// Used to answer frames that never make it to the hub
    outbound: UnboundedSender<Outbound>,
    frames: UnboundedReceiver<String>,
}

impl ClientQueue {
    pub fn new(
        relay: Relay,
        client_id: ClientId,
        outbound: UnboundedSender<Outbound>,
        frames: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            relay,
            client_id,
            outbound,
            frames,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Drains the queue until the frame sender is dropped
    pub async fn run(mut self) -> Result<()> {
        while let Some(text) = self.frames.next().await {
            match serde_json::from_str::<Request>(&text) {
                Ok(request) => {
                    tracing::trace!(client = %self.client_id, id = %request.id, method = %request.method, "client command");
                    self.relay.execute(self.client_id.clone(), request).await?;
                }
                Err(err) => self.reject_malformed(&text, &err),
            }
        }
        Ok(())
    }

    /// Answers an unparsable frame if it at least carries an id
    fn reject_malformed(&self, text: &str, err: &serde_json::Error) {
        tracing::warn!(client = %self.client_id, %err, "malformed client frame");
        let id = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_u64));
        if let Some(id) = id {
            let resp = Response::err(
                CallId::new(id),
                CdpErrorObject::new(
                    CdpErrorObject::INVALID_REQUEST,
                    format!("Invalid request: {}", err),
                ),
                None,
            );
            if let Ok(text) = serde_json::to_string(&resp) {
                let _ = self.outbound.unbounded_send(Outbound::Text(text));
            }
        }
    }
}
