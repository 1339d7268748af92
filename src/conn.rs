use std::collections::VecDeque;
use std::pin::Pin;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::Message as WsMessage;
use async_tungstenite::WebSocketStream;
use futures::stream::Stream;
use futures::task::{Context, Poll};
use futures::Sink;

use nutbot_relay_types::extension::{FromExtension, FromRelay};

use crate::error::{RelayError, Result};

/// Exchanges the extension protocol messages with the relay's websocket
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Connection {
    /// Queue of messages to send.
    pending_messages: VecDeque<FromExtension>,
    /// The websocket of the relay
    ws: WebSocketStream<ConnectStream>,
    needs_flush: bool,
    /// Code of the close frame the relay sent, if any
    close_code: Option<u16>,
}

impl Connection {
    pub async fn connect(relay_url: impl AsRef<str>) -> Result<Self> {
        let (ws, _) = connect_async(relay_url.as_ref()).await?;
        Ok(Self {
            pending_messages: Default::default(),
            ws,
            needs_flush: false,
            close_code: None,
        })
    }

    /// Queue in the message to send over the socket
    pub fn submit(&mut self, msg: FromExtension) {
        tracing::trace!(?msg, "submit to relay");
        self.pending_messages.push_back(msg);
    }

    /// The close code the relay ended the link with
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Start sending every queued message and flush the sink
    fn start_send_next(&mut self, cx: &mut Context<'_>) -> Result<()> {
        while !self.pending_messages.is_empty() {
            match Sink::poll_ready(Pin::new(&mut self.ws), cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(msg) = self.pending_messages.pop_front() {
                        Sink::start_send(Pin::new(&mut self.ws), WsMessage::Text(msg.to_json()))?;
                        self.needs_flush = true;
                    }
                }
                Poll::Ready(Err(err)) => return Err(err.into()),
                Poll::Pending => break,
            }
        }
        if self.needs_flush {
            match Sink::poll_flush(Pin::new(&mut self.ws), cx) {
                Poll::Ready(Ok(())) => self.needs_flush = false,
                Poll::Ready(Err(err)) => return Err(err.into()),
                Poll::Pending => {}
            }
        }
        Ok(())
    }
}

impl Stream for Connection {
    type Item = Result<FromRelay>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        // queue in the next messages if not currently flushing
        if let Err(err) = pin.start_send_next(cx) {
            return Poll::Ready(Some(Err(err)));
        }

        loop {
            // read from the ws
            match Stream::poll_next(Pin::new(&mut pin.ws), cx) {
                Poll::Ready(Some(Ok(WsMessage::Text(text)))) => {
                    tracing::trace!(%text, "read from relay");
                    return Poll::Ready(Some(FromRelay::parse(&text).map_err(RelayError::from)));
                }
                Poll::Ready(Some(Ok(WsMessage::Close(frame)))) => {
                    pin.close_code = frame.map(|frame| u16::from(frame.code));
                    tracing::debug!(code = ?pin.close_code, "relay closed the connection");
                }
                // pings are answered by the websocket itself
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(RelayError::Ws(err)))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
