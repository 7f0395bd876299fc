//! Per-connection reader and writer loops.
//!
//! Both loops are generic over the transport halves so they can be driven by
//! an axum `WebSocket` in production and by in-memory channels in tests.

use std::{fmt::Display, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{error::Elapsed, timeout};
use tracing::debug;

use crate::{
    client::{ClientId, Mailbox},
    connection::CloseReason,
    hub::HubHandle,
    payload::Payload,
};

/// Reads frames one at a time and submits every data frame to the hub.
///
/// Returns when the peer closes, the transport fails, the idle timeout
/// elapses, or the hub stops accepting broadcasts.
pub async fn read_loop<S, E>(
    inbound: &mut S,
    id: ClientId,
    hub: &HubHandle,
    idle_timeout: Option<Duration>,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match next_frame(inbound, idle_timeout).await {
            Ok(frame) => frame,
            Err(_) => {
                debug!(client = %id, "no frame within idle timeout");
                return CloseReason::IdleTimeout;
            }
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                debug!(client = %id, %error, "read failed");
                return CloseReason::ReadError;
            }
            None => return CloseReason::PeerClosed,
        };

        if let Message::Close(_) = message {
            return CloseReason::PeerClosed;
        }

        // Pings are answered by the transport itself.
        let Some(payload) = Payload::from_message(message) else {
            continue;
        };

        if hub.broadcast(payload).await.is_err() {
            return CloseReason::HubStopped;
        }
    }
}

async fn next_frame<S>(
    inbound: &mut S,
    idle_timeout: Option<Duration>,
) -> Result<Option<S::Item>, Elapsed>
where
    S: Stream + Unpin,
{
    match idle_timeout {
        Some(limit) => timeout(limit, inbound.next()).await,
        None => Ok(inbound.next().await),
    }
}

/// Writes mailbox payloads to the transport in FIFO order.
///
/// When the hub closes the mailbox, whatever is still buffered is written,
/// followed by a close frame, and the loop returns
/// [`CloseReason::MailboxClosed`]. A failed write ends the loop immediately.
pub async fn write_loop<K>(mut outbound: K, mut mailbox: Mailbox) -> CloseReason
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let id = mailbox.id();
    while let Some(payload) = mailbox.recv().await {
        if let Err(error) = outbound.send(payload.into()).await {
            debug!(client = %id, %error, "write failed");
            return CloseReason::WriteError;
        }
    }

    // The peer may already be gone; a failed close frame changes nothing.
    if let Err(error) = outbound.send(Message::Close(None)).await {
        debug!(client = %id, %error, "close frame not delivered");
    }
    CloseReason::MailboxClosed
}
