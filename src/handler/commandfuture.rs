use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::{
    mpsc,
    oneshot::{self, channel as oneshot_channel},
};
use pin_project_lite::pin_project;

use crate::error::Result;
use crate::handler::HubMessage;

pin_project! {
    /// Hands a message to the hub and resolves once the hub answered it.
    pub(crate) struct CommandFuture<T> {
        #[pin]
        rx_command: oneshot::Receiver<T>,

        hub_sender: mpsc::Sender<HubMessage>,

        message: Option<HubMessage>,
    }
}

impl<T> CommandFuture<T> {
    pub(crate) fn new(
        hub_sender: mpsc::Sender<HubMessage>,
        message: impl FnOnce(oneshot::Sender<T>) -> HubMessage,
    ) -> Self {
        let (tx, rx_command) = oneshot_channel::<T>();
        Self {
            rx_command,
            hub_sender,
            message: Some(message(tx)),
        }
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Some(message) = this.message.take() {
            match this.hub_sender.poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Err(err) = this.hub_sender.start_send(message) {
                        return Poll::Ready(Err(err.into()));
                    }
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
                Poll::Pending => {
                    *this.message = Some(message);
                    Poll::Pending
                }
            }
        } else {
            this.rx_command
                .poll(cx)
                .map(|res| res.map_err(Into::into))
        }
    }
}
