use std::future::Future;
use std::time::Duration;

use futures::StreamExt;

use nutbot_relay_types::extension::FromExtension;

use crate::config::PeerConfig;
use crate::conn::Connection;
use crate::error::{RelayError, Result};
use crate::extension::peer::{ExtensionPeer, PeerEvent, TabSnapshot};
use crate::handler::{ExtensionStatus, CLOSE_REPLACED, CLOSE_SLOT_BUSY};

/// How a relay link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Lost,
    /// Another extension holds the slot with live sessions
    Busy,
    /// Another extension took over the slot
    Replaced,
    /// The peer itself stopped
    Stopped,
}

/// Keeps the extension peer connected to the relay.
///
/// Reconnects on an interval while the relay is unreachable, waits for the
/// slot to free up when it is held by someone else, and pings the relay while
/// connected. The peer is polled the whole time, so tabs keep working on the
/// browser side while the link is down.
#[derive(Debug)]
pub struct Supervisor {
    config: PeerConfig,
    peer: ExtensionPeer,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(config: PeerConfig, peer: ExtensionPeer) -> Self {
        Self {
            config,
            peer,
            http: reqwest::Client::new(),
        }
    }

    /// Runs until the peer stops.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let url = self.config.relay_url.clone();
            let conn = match self.drive_until(Connection::connect(url)).await {
                Some(Ok(conn)) => conn,
                Some(Err(err)) => {
                    tracing::debug!(%err, "relay unreachable");
                    if !self.sleep(self.config.retry_interval).await {
                        return Ok(());
                    }
                    continue;
                }
                None => return Ok(()),
            };

            tracing::info!(url = %self.config.relay_url, "connected to relay");
            let end = self.serve(conn).await;
            tracing::info!(?end, "relay link ended");
            let keep_going = match end {
                LinkEnd::Stopped => false,
                LinkEnd::Busy => self.wait_for_slot(false).await,
                LinkEnd::Replaced => self.wait_for_slot(true).await,
                LinkEnd::Lost => self.sleep(self.config.retry_interval).await,
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Pumps messages between the link and the peer until either side ends.
    ///
    /// The peer only sees the link as up once the relay sent its first frame,
    /// a connection turned away by the relay never re-attaches tabs.
    async fn serve(&mut self, mut conn: Connection) -> LinkEnd {
        let mut admitted = false;
        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                msg = conn.next() => match msg {
                    Some(Ok(msg)) => {
                        if !admitted {
                            admitted = true;
                            self.peer.relay_connected();
                        }
                        self.peer.on_relay_message(msg)
                    }
                    Some(Err(RelayError::Protocol(err))) => self.peer.on_protocol_error(err),
                    Some(Err(err)) => {
                        tracing::warn!(%err, "relay link failed");
                        break link_end(conn.close_code());
                    }
                    None => break link_end(conn.close_code()),
                },
                event = self.peer.next() => match event {
                    Some(PeerEvent::Send(msg)) => conn.submit(msg),
                    Some(PeerEvent::TabState(snapshot)) => self.observe(snapshot),
                    None => break LinkEnd::Stopped,
                },
                _ = keepalive.tick() => conn.submit(FromExtension::Ping),
            }
        };
        self.peer.relay_disconnected();
        end
    }

    /// Polls the relay's status endpoint until the slot can be taken.
    ///
    /// A busy slot is free once its holder has no sessions left, a slot that
    /// was taken over only once nobody holds it, otherwise two extensions
    /// would keep replacing each other.
    async fn wait_for_slot(&mut self, until_disconnected: bool) -> bool {
        loop {
            if !self.sleep(self.config.status_poll_interval).await {
                return false;
            }
            let request = fetch_status(self.http.clone(), self.config.status_url.clone());
            match self.drive_until(request).await {
                Some(Ok(status)) => {
                    let free = !status.connected
                        || (!until_disconnected && status.active_targets == 0);
                    if free {
                        return true;
                    }
                    tracing::trace!(?status, "extension slot still taken");
                }
                Some(Err(err)) => {
                    // relay is gone, back to plain reconnecting
                    tracing::debug!(%err, "status poll failed");
                    return true;
                }
                None => return false,
            }
        }
    }

    /// Drives the peer for `duration`, `false` if the peer stopped meanwhile
    async fn sleep(&mut self, duration: Duration) -> bool {
        self.drive_until(tokio::time::sleep(duration)).await.is_some()
    }

    /// Drives the peer until `fut` resolves. While there is no link, messages
    /// for the relay are dropped.
    async fn drive_until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Some(out),
                event = self.peer.next() => match event {
                    Some(PeerEvent::TabState(snapshot)) => self.observe(snapshot),
                    Some(PeerEvent::Send(msg)) => tracing::trace!(?msg, "no relay link"),
                    None => return None,
                },
            }
        }
    }

    fn observe(&self, snapshot: TabSnapshot) {
        tracing::debug!(
            tab_id = %snapshot.tab_id,
            state = ?snapshot.state,
            error = ?snapshot.error,
            "tab state"
        );
    }
}

fn link_end(close_code: Option<u16>) -> LinkEnd {
    match close_code {
        Some(CLOSE_SLOT_BUSY) => LinkEnd::Busy,
        Some(CLOSE_REPLACED) => LinkEnd::Replaced,
        _ => LinkEnd::Lost,
    }
}

async fn fetch_status(http: reqwest::Client, url: String) -> Result<ExtensionStatus> {
    let status = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<ExtensionStatus>()
        .await?;
    Ok(status)
}
