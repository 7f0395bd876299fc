//! The hub: membership registry and broadcast fan-out.
//!
//! The hub runs as a single Tokio task that owns the membership map. Every
//! other task talks to it through a [`HubHandle`], which only enqueues
//! commands. Because one task processes commands one at a time, registering,
//! unregistering and fanning out never interleave and no lock guards the map.
//!
//! Delivery to a member never waits. A member whose mailbox is full (or whose
//! writer is already gone) is evicted on the spot: it is removed from the map,
//! which drops the hub's end of its mailbox and lets its writer loop finish.

use std::collections::HashMap;

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    client::{Client, ClientId, DeliveryError},
    payload::Payload,
};

/// Depth of the command queue when not configured otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How many commands may wait for the hub before submitters are suspended.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is no longer running")]
    Closed,
}

enum Command {
    Register(Client),
    Unregister(ClientId),
    Broadcast(Payload),
    Members {
        respond_to: oneshot::Sender<Vec<ClientId>>,
    },
    Shutdown,
}

/// Cloneable submission side of a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    /// Adds `client` to the membership. It receives every broadcast processed
    /// after this command.
    ///
    /// Fails only when the hub has stopped, in which case the client is
    /// dropped and its mailbox closed.
    pub async fn register(&self, client: Client) -> Result<(), HubError> {
        self.submit(Command::Register(client)).await
    }

    /// Removes the client and closes its mailbox. Unknown ids are ignored, so
    /// unregistering twice is the same as unregistering once.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.submit(Command::Unregister(id)).await
    }

    /// Queues `payload` for delivery to every member, sender included.
    pub async fn broadcast(&self, payload: Payload) -> Result<(), HubError> {
        self.submit(Command::Broadcast(payload)).await
    }

    /// Current membership, sorted by id.
    ///
    /// The query goes through the same queue as every other command, so the
    /// answer reflects everything this handle submitted before it.
    pub async fn members(&self) -> Result<Vec<ClientId>, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(Command::Members { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    async fn submit(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// A hub whose coordination loop is running on a Tokio task.
pub struct RunningHub {
    handle: HubHandle,
    task: JoinHandle<()>,
}

impl RunningHub {
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Stops the coordination loop and waits for it to exit.
    ///
    /// Commands queued before the stop request are still processed. Every
    /// remaining member is dropped, which closes all mailboxes.
    pub async fn stop(self) {
        if self.handle.submit(Command::Shutdown).await.is_err() {
            debug!("hub already stopped");
        }
        if let Err(error) = self.task.await {
            warn!(?error, "hub task ended abnormally");
        }
    }
}

pub struct Hub {
    commands: mpsc::Receiver<Command>,
    clients: HashMap<ClientId, Client>,
}

impl Hub {
    /// Starts a hub on the current Tokio runtime.
    pub fn spawn(config: HubConfig) -> RunningHub {
        let (commands_tx, commands) = mpsc::channel(config.queue_capacity.max(1));
        let hub = Hub {
            commands,
            clients: HashMap::new(),
        };
        let task = tokio::spawn(hub.run());

        RunningHub {
            handle: HubHandle {
                commands: commands_tx,
            },
            task,
        }
    }

    async fn run(mut self) {
        debug!("hub started");
        while let Some(command) = self.commands.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }

        let remaining = self.clients.len();
        self.clients.clear();
        info!(remaining, "hub stopped");
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Register(client) => self.register(client),
            Command::Unregister(id) => self.unregister(id),
            Command::Broadcast(payload) => self.broadcast(payload),
            Command::Members { respond_to } => {
                let mut members: Vec<ClientId> = self.clients.keys().copied().collect();
                members.sort_unstable();
                let _ = respond_to.send(members);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn register(&mut self, client: Client) {
        let id = client.id();
        self.clients.insert(id, client);
        debug!(client = %id, members = self.clients.len(), "client registered");
    }

    fn unregister(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            debug!(client = %id, members = self.clients.len(), "client unregistered");
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        let mut evicted = Vec::new();
        for (id, client) in &self.clients {
            match client.try_deliver(payload.clone()) {
                Ok(()) => {}
                Err(DeliveryError::Full) => {
                    warn!(client = %id, "mailbox full, evicting slow client");
                    evicted.push(*id);
                }
                Err(DeliveryError::Closed) => {
                    debug!(client = %id, "writer gone, evicting client");
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            self.clients.remove(&id);
        }
    }
}
