//! Connection adapter: one peer's transport, mailbox and lifecycle.
//!
//! A connection moves through `Connected -> Closing -> Closed`. It starts
//! closing when its reader or writer loop ends for any reason, and is closed
//! once both loops have exited and the transport has been dropped. There is no
//! reconnection; a new session needs a new `Connection`.

use std::{fmt::Display, net::SocketAddr, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio::{select, task::JoinError};
use tracing::{debug, info, warn};

use crate::{
    client::{Client, ClientId, DEFAULT_MAILBOX_CAPACITY},
    dispatch::{read_loop, write_loop},
    hub::HubHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream from the peer.
    PeerClosed,
    ReadError,
    WriteError,
    /// The hub closed the mailbox: eviction, unregistration or hub shutdown.
    MailboxClosed,
    IdleTimeout,
    HubStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closing(CloseReason),
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub mailbox_capacity: usize,
    /// Close the connection when the peer sends nothing for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            idle_timeout: None,
        }
    }
}

pub struct Connection<T> {
    transport: T,
    config: ConnectionConfig,
    peer: Option<SocketAddr>,
}

enum FirstExit {
    Reader(CloseReason),
    Writer(Result<CloseReason, JoinError>),
}

impl<T, RE, WE> Connection<T>
where
    T: Stream<Item = Result<Message, RE>> + Sink<Message, Error = WE> + Send + 'static,
    RE: Display + Send,
    WE: Display + Send + 'static,
{
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Registers with the hub and runs both dispatch loops until the
    /// connection closes.
    ///
    /// The reader runs on the calling task and the writer on a task of its
    /// own. Whichever ends first decides the close reason; the client is then
    /// unregistered (a no-op if the hub already evicted it) and the other
    /// loop is wound down.
    pub async fn run(self, hub: HubHandle) -> CloseReason {
        let Connection {
            transport,
            config,
            peer,
        } = self;

        let (client, mailbox) = Client::new(config.mailbox_capacity);
        let id = client.id();
        if hub.register(client).await.is_err() {
            warn!(?peer, "hub stopped, refusing connection");
            return CloseReason::HubStopped;
        }
        let mut state = ConnectionState::Connected;
        info!(client = %id, ?peer, "client connected");

        let (outbound, mut inbound) = transport.split::<Message>();
        let mut writer = tokio::spawn(write_loop(outbound, mailbox));

        let first = select! {
            reason = read_loop(&mut inbound, id, &hub, config.idle_timeout) => {
                FirstExit::Reader(reason)
            }
            joined = &mut writer => FirstExit::Writer(joined),
        };

        let reason = match first {
            FirstExit::Reader(reason) => {
                advance(&mut state, ConnectionState::Closing(reason), id);
                // Closing the mailbox is what lets the writer drain and finish.
                if let Err(error) = hub.unregister(id).await {
                    debug!(client = %id, %error, "unregister skipped");
                }
                if let Err(error) = writer.await {
                    warn!(client = %id, ?error, "writer task ended abnormally");
                }
                reason
            }
            FirstExit::Writer(joined) => {
                let reason = joined.unwrap_or_else(|error| {
                    warn!(client = %id, ?error, "writer task ended abnormally");
                    CloseReason::WriteError
                });
                advance(&mut state, ConnectionState::Closing(reason), id);
                if let Err(error) = hub.unregister(id).await {
                    debug!(client = %id, %error, "unregister skipped");
                }
                reason
            }
        };

        drop(inbound);
        advance(&mut state, ConnectionState::Closed, id);
        info!(client = %id, ?peer, ?reason, "client disconnected");
        reason
    }
}

fn advance(state: &mut ConnectionState, next: ConnectionState, id: ClientId) {
    debug!(client = %id, from = ?state, to = ?next, "connection state changed");
    *state = next;
}
