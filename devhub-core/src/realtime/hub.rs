//! Publish/subscribe hub fanning events out to connected clients.
//!
//! A single task owns the client registry and processes one FIFO mailbox.
//! [`EventHub`] is a cheap, cloneable handle onto that mailbox.
//!
//! Control commands (register, unregister, snapshots) wait for mailbox room;
//! publishes never block and are dropped with a warning when the mailbox is
//! full. During fan-out, a client whose queue is full or closed is reaped on
//! the spot.
//!
//! ```no_run
//! use devhub_core::realtime::{Client, EventHub, EventType, HubConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = EventHub::spawn(HubConfig::default());
//! let (client, mut queue) = Client::new("user-42", 256);
//! hub.register(client).await?;
//!
//! hub.broadcast_to_all(EventType::SyncStatusUpdate, json!({"status": "connected"}));
//! while let Some(event) = queue.recv().await {
//!     println!("{}", event.to_json()?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{require_positive, ConfigError};
use crate::observability::metrics::{
    HUB_CLIENTS_REAPED, HUB_CONNECTED_CLIENTS, HUB_EVENTS_DROPPED, HUB_EVENTS_PUBLISHED,
};
use crate::realtime::client::{Client, ClientInfo};
use crate::realtime::event::{Event, EventType};
use crate::resilience::shutdown::{GracefulShutdown, ShutdownError};
use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Commands buffered in the hub mailbox
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("hub.mailbox_capacity", self.mailbox_capacity as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("event hub is not running")]
    Closed,
}

enum HubCommand {
    Register(Client),
    Unregister(String),
    Publish(Event),
    Snapshot(oneshot::Sender<Vec<ClientInfo>>),
    Shutdown(oneshot::Sender<usize>),
}

#[derive(Debug, Default)]
struct HubCounters {
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    reaped: AtomicU64,
    connected: AtomicU64,
}

/// Lifetime counters of a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connected_clients: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub events_delivered: u64,
    pub clients_reaped: u64,
}

/// Handle onto a running hub loop.
#[derive(Clone)]
pub struct EventHub {
    mailbox: mpsc::Sender<HubCommand>,
    counters: Arc<HubCounters>,
}

impl EventHub {
    /// Start the hub loop on the current runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (mailbox, inbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let counters = Arc::new(HubCounters::default());

        let hub_loop = HubLoop {
            clients: HashMap::new(),
            inbox,
            counters: Arc::clone(&counters),
        };
        tokio::spawn(hub_loop.run());
        info!(mailbox_capacity = config.mailbox_capacity, "Event hub started");

        Self { mailbox, counters }
    }

    /// Add a client; it receives a `connect` acknowledgement first.
    pub async fn register(&self, client: Client) -> Result<(), HubError> {
        self.command(HubCommand::Register(client)).await
    }

    /// Remove a client and close its queue. Unknown ids are ignored.
    pub async fn unregister(&self, client_id: &str) -> Result<(), HubError> {
        self.command(HubCommand::Unregister(client_id.to_string()))
            .await
    }

    /// Queue an event for every client. Returns false if it was dropped.
    pub fn broadcast_to_all(&self, event_type: EventType, data: Value) -> bool {
        self.publish(Event::new(event_type, data))
    }

    /// Queue an event for one client. Returns false if it was dropped.
    pub fn broadcast_to_client(&self, client_id: &str, event_type: EventType, data: Value) -> bool {
        self.publish(Event::for_client(event_type, data, client_id))
    }

    /// Queue a prepared event without waiting.
    pub fn publish(&self, event: Event) -> bool {
        let event_type = event.event_type;
        match self.mailbox.try_send(HubCommand::Publish(event)) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                counter!(HUB_EVENTS_PUBLISHED, "type" => event_type.as_str()).increment(1);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(HUB_EVENTS_DROPPED, "type" => event_type.as_str()).increment(1);
                warn!(%event_type, "Hub mailbox full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(%event_type, "Hub stopped, dropping event");
                false
            }
        }
    }

    /// Number of registered clients, as seen by the hub loop.
    pub async fn connected_clients(&self) -> Result<usize, HubError> {
        Ok(self.clients().await?.len())
    }

    pub async fn client_ids(&self) -> Result<Vec<String>, HubError> {
        Ok(self.clients().await?.into_iter().map(|c| c.id).collect())
    }

    /// Snapshot of registered clients, ordered by connection time.
    pub async fn clients(&self) -> Result<Vec<ClientInfo>, HubError> {
        let (reply, response) = oneshot::channel();
        self.command(HubCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Close every client queue and stop the loop.
    ///
    /// Returns how many clients were still connected.
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.command(HubCommand::Shutdown(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// True while the hub loop is accepting commands.
    pub fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connected_clients: self.counters.connected.load(Ordering::Relaxed),
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
            events_delivered: self.counters.delivered.load(Ordering::Relaxed),
            clients_reaped: self.counters.reaped.load(Ordering::Relaxed),
        }
    }

    async fn command(&self, command: HubCommand) -> Result<(), HubError> {
        self.mailbox.send(command).await.map_err(|_| HubError::Closed)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl GracefulShutdown for EventHub {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        match EventHub::shutdown(self).await {
            Ok(remaining) => {
                info!(remaining, "Event hub shut down");
                Ok(())
            }
            Err(HubError::Closed) => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "event_hub"
    }
}

/// Why a client left the registry.
#[derive(Debug, Clone, Copy)]
enum Removal {
    Unregistered,
    Unresponsive,
    Closed,
}

struct HubLoop {
    clients: HashMap<String, Client>,
    inbox: mpsc::Receiver<HubCommand>,
    counters: Arc<HubCounters>,
}

impl HubLoop {
    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            match command {
                HubCommand::Register(client) => self.register(client),
                HubCommand::Unregister(id) => {
                    if !self.remove(&id, Removal::Unregistered) {
                        debug!(client = %id, "Unregister for unknown client ignored");
                    }
                }
                HubCommand::Publish(event) => self.publish(event),
                HubCommand::Snapshot(reply) => {
                    let mut clients: Vec<ClientInfo> =
                        self.clients.values().map(Client::info).collect();
                    clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
                    let _ = reply.send(clients);
                }
                HubCommand::Shutdown(reply) => {
                    let remaining = self.clients.len();
                    self.clients.clear();
                    self.sync_connected();
                    let _ = reply.send(remaining);
                    info!(remaining, "Event hub loop stopping");
                    return;
                }
            }
        }

        debug!(clients = self.clients.len(), "All hub handles dropped, stopping loop");
        self.clients.clear();
        self.sync_connected();
    }

    fn register(&mut self, client: Client) {
        let id = client.id().to_string();
        let ack = Event::for_client(
            EventType::Connect,
            json!({ "client_id": id, "user_id": client.user_id() }),
            id.clone(),
        );
        info!(client = %id, user = %client.user_id(), "Client registered");
        self.clients.insert(id.clone(), client);
        self.sync_connected();

        self.deliver(&id, ack);
    }

    fn publish(&mut self, event: Event) {
        if event.is_broadcast() {
            let mut failed = Vec::new();
            for (id, client) in &self.clients {
                match client.try_send(event.clone()) {
                    Ok(()) => {
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => failed.push((id.clone(), Removal::Unresponsive)),
                    Err(TrySendError::Closed(_)) => failed.push((id.clone(), Removal::Closed)),
                }
            }
            for (id, reason) in failed {
                self.remove(&id, reason);
            }
        } else {
            let id = event.client_id.clone();
            if self.clients.contains_key(&id) {
                self.deliver(&id, event);
            } else {
                debug!(client = %id, event_type = %event.event_type, "Target client not connected");
            }
        }
    }

    /// Send to one client, reaping it if its queue cannot take the event.
    fn deliver(&mut self, id: &str, event: Event) {
        let outcome = match self.clients.get(id) {
            Some(client) => client.try_send(event),
            None => return,
        };
        match outcome {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.remove(id, Removal::Unresponsive);
            }
            Err(TrySendError::Closed(_)) => {
                self.remove(id, Removal::Closed);
            }
        }
    }

    /// Drop the client, which closes its outbound queue.
    fn remove(&mut self, id: &str, reason: Removal) -> bool {
        let Some(client) = self.clients.remove(id) else {
            return false;
        };
        match reason {
            Removal::Unregistered => info!(client = %id, "Client unregistered"),
            Removal::Unresponsive | Removal::Closed => {
                self.counters.reaped.fetch_add(1, Ordering::Relaxed);
                counter!(HUB_CLIENTS_REAPED).increment(1);
                warn!(client = %id, user = %client.user_id(), ?reason, "Reaping client");
            }
        }
        drop(client);
        self.sync_connected();
        true
    }

    fn sync_connected(&self) {
        let connected = self.clients.len() as u64;
        self.counters.connected.store(connected, Ordering::Relaxed);
        gauge!(HUB_CONNECTED_CLIENTS).set(connected as f64);
    }
}
