use futures::channel::mpsc::{channel, Sender, UnboundedSender};
use futures::SinkExt;

use nutbot_relay_types::extension::NotificationParams;
use nutbot_relay_types::Request;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::handler::cmd::CommandMessage;
use crate::handler::commandfuture::CommandFuture;
use crate::handler::{
    Admission, ClientId, ConnectionId, ExtensionStatus, Hub, HubMessage, Outbound, Snapshot,
};

/// Capacity of the channel feeding the hub
const HUB_CHANNEL_CAPACITY: usize = 1_000;

/// A cheap handle to a running [`Hub`].
///
/// Every connection task and HTTP handler holds a clone; the hub itself must
/// be polled to completion somewhere, see [`Relay::new`].
#[derive(Debug, Clone)]
pub struct Relay {
    sender: Sender<HubMessage>,
}

impl Relay {
    /// Creates a handle and the hub it talks to.
    ///
    /// The hub is a stream and does nothing unless polled:
    ///
    /// ```no_run
    /// # use futures::StreamExt;
    /// # use nutbot_relay::{Relay, RelayConfig};
    /// # async fn demo() {
    /// let (relay, mut hub) = Relay::new(RelayConfig::default());
    /// tokio::spawn(async move {
    ///     while let Some(event) = hub.next().await {
    ///         tracing::debug!(?event, "hub event");
    ///     }
    /// });
    /// # }
    /// ```
    pub fn new(config: RelayConfig) -> (Self, Hub) {
        let (tx, rx) = channel(HUB_CHANNEL_CAPACITY);
        (Self { sender: tx }, Hub::new(config, rx))
    }

    async fn send(&self, msg: HubMessage) -> Result<()> {
        self.sender.clone().send(msg).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<ExtensionStatus> {
        CommandFuture::new(self.sender.clone(), HubMessage::Status).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        CommandFuture::new(self.sender.clone(), HubMessage::Snapshot).await
    }

    /// Asks the extension to show a notification
    pub async fn notify(&self, params: NotificationParams) -> Result<()> {
        CommandFuture::new(self.sender.clone(), |ack| HubMessage::Notify { params, ack }).await?
    }

    /// Offers a new extension connection; `tx` receives everything the hub
    /// writes to it, including the close frame of a rejection.
    pub async fn connect_extension(&self, tx: UnboundedSender<Outbound>) -> Result<Admission> {
        CommandFuture::new(self.sender.clone(), |ack| HubMessage::ExtensionConnected {
            tx,
            ack,
        })
        .await
    }

    pub async fn extension_frame(&self, conn: ConnectionId, text: String) -> Result<()> {
        self.send(HubMessage::ExtensionFrame { conn, text }).await
    }

    pub async fn extension_closed(&self, conn: ConnectionId) -> Result<()> {
        self.send(HubMessage::ExtensionClosed { conn }).await
    }

    /// Registers a control client, generating an id when none is given.
    pub async fn connect_client(
        &self,
        client_id: Option<ClientId>,
        tx: UnboundedSender<Outbound>,
    ) -> Result<ClientId> {
        CommandFuture::new(self.sender.clone(), |ack| HubMessage::ClientConnected {
            client_id,
            tx,
            ack,
        })
        .await?
    }

    /// Submits a client command and resolves once the hub wrote its response
    /// and every follow-up event to the client.
    pub async fn execute(&self, client_id: ClientId, request: Request) -> Result<()> {
        CommandFuture::new(self.sender.clone(), |done| {
            HubMessage::ClientCommand(CommandMessage {
                client_id,
                request,
                done,
            })
        })
        .await
    }

    pub async fn client_closed(&self, client_id: ClientId) -> Result<()> {
        self.send(HubMessage::ClientClosed { client_id }).await
    }
}
