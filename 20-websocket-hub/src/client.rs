use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};

use crate::payload::Payload;

/// Outbound buffer size a client gets unless configured otherwise.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// The hub's side of one connected peer: its identity plus the producer end
/// of its mailbox.
///
/// Dropping a `Client` closes the mailbox. The hub owns every registered
/// `Client`, so removing one from membership and closing its mailbox are the
/// same step.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    outbox: mpsc::Sender<Payload>,
}

/// The consumer end of a client's mailbox, read by that client's writer loop.
#[derive(Debug)]
pub struct Mailbox {
    id: ClientId,
    inbox: mpsc::Receiver<Payload>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    /// The mailbox is at capacity; the consumer is not keeping up.
    Full,
    /// The consumer end was dropped; the writer loop is gone.
    Closed,
}

impl Client {
    /// Creates a client with a fresh id and a mailbox holding up to
    /// `capacity` payloads. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> (Client, Mailbox) {
        let id = ClientId::next();
        let (outbox, inbox) = mpsc::channel(capacity.max(1));
        (Client { id, outbox }, Mailbox { id, inbox })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Enqueues without waiting. Never blocks the caller.
    pub(crate) fn try_deliver(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.outbox.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl Mailbox {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Waits for the next payload in FIFO order.
    ///
    /// Once the hub has closed the mailbox, buffered payloads are still handed
    /// out; `None` is returned only after the buffer is drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Payload, TryRecvError> {
        self.inbox.try_recv()
    }

    /// True once the hub has dropped its end, even if payloads are still buffered.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Number of payloads waiting to be written.
    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }
}
