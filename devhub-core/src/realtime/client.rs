//! Per-connection client state and the session pumps that move frames between
//! a transport and the hub.
//!
//! The hub owns each [`Client`] (and with it the only sender of the outbound
//! queue); the transport side owns the [`OutboundQueue`] and a
//! [`ClientHandle`]. Dropping the `Client` is what closes the queue.

use crate::config::{require_positive, ConfigError};
use crate::realtime::event::{Event, EventType};
use crate::realtime::hub::{EventHub, HubError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Timing and sizing for one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound events buffered before the client is considered unresponsive
    pub queue_capacity: usize,
    /// Longest silence tolerated from the peer
    #[serde(rename = "pong_wait_ms", with = "crate::config::duration_ms")]
    pub pong_wait: Duration,
    /// Bound on writing a single frame
    #[serde(rename = "write_wait_ms", with = "crate::config::duration_ms")]
    pub write_wait: Duration,
    /// Largest inbound text frame accepted, in bytes
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Ping cadence: nine tenths of `pong_wait`.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("client.queue_capacity", self.queue_capacity as u64)?;
        require_positive("client.max_message_size", self.max_message_size as u64)?;
        if self.ping_period().is_zero() {
            return Err(ConfigError::new(
                "client.pong_wait_ms",
                "too short to derive a ping period",
            ));
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::new("client.write_wait_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Identity and presence shared by a client and its session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: String,
    user_id: String,
    connected_at: DateTime<Utc>,
    last_seen: Arc<Mutex<Instant>>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// False once nothing has been heard for more than twice `pong_wait`.
    pub fn is_alive(&self, pong_wait: Duration) -> bool {
        self.last_seen().elapsed() <= pong_wait * 2
    }
}

/// Receiving end of a client's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Event>,
}

impl OutboundQueue {
    /// Next event, or `None` once the hub has closed the queue and it is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// A connected client as held in the hub registry.
pub struct Client {
    handle: ClientHandle,
    sender: mpsc::Sender<Event>,
}

impl Client {
    /// Create a client with a fresh id and a bounded outbound queue.
    pub fn new(user_id: impl Into<String>, capacity: usize) -> (Self, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            connected_at: Utc::now(),
            last_seen: Arc::new(Mutex::new(Instant::now())),
        };
        (Self { handle, sender }, OutboundQueue { receiver })
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn user_id(&self) -> &str {
        self.handle.user_id()
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.handle.id.clone(),
            user_id: self.handle.user_id.clone(),
            connected_at: self.handle.connected_at,
        }
    }

    /// Handle onto the outbound queue that does not keep it open.
    pub(crate) fn reply_sender(&self) -> mpsc::WeakSender<Event> {
        self.sender.downgrade()
    }

    /// Non-blocking enqueue; fails when the queue is full or its reader is gone.
    pub(crate) fn try_send(&self, event: Event) -> Result<(), TrySendError<Event>> {
        self.sender.try_send(event)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.handle.id)
            .field("user_id", &self.handle.user_id)
            .finish()
    }
}

/// Public view of a registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Transport-neutral frame exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Application hook for inbound events that are not session control.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, client: &ClientHandle, event: Event);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("no traffic from peer for {0:?}")]
    ReadTimeout(Duration),

    #[error("inbound message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Whether the read pump keeps going after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Drives one connection: a write pump draining the outbound queue and a
/// read pump dispatching inbound frames.
pub struct ClientSession {
    handle: ClientHandle,
    hub: EventHub,
    replies: mpsc::WeakSender<Event>,
    config: ClientConfig,
    handler: Option<Arc<dyn InboundHandler>>,
}

impl ClientSession {
    /// Register a new client for `user_id` and return its session and queue.
    pub async fn open(
        hub: &EventHub,
        user_id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<(Self, OutboundQueue), HubError> {
        let (client, queue) = Client::new(user_id, config.queue_capacity);
        let handle = client.handle();
        let replies = client.reply_sender();
        hub.register(client).await?;

        let session = Self {
            handle,
            hub: hub.clone(),
            replies,
            config,
            handler: None,
        };
        Ok((session, queue))
    }

    pub fn with_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive(self.config.pong_wait)
    }

    /// Run both pumps until either ends, then unregister the client.
    pub async fn run<S, R, E>(
        self,
        queue: OutboundQueue,
        sink: S,
        stream: R,
    ) -> Result<(), SessionError>
    where
        S: Sink<Frame> + Unpin,
        S::Error: fmt::Display,
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        info!(client = %self.id(), user = %self.handle.user_id(), "Client session started");

        let result = tokio::select! {
            result = self.write_pump(queue, sink) => result,
            result = self.read_pump(stream) => result,
        };

        if let Err(e) = self.hub.unregister(self.id()).await {
            debug!(client = %self.id(), error = %e, "Hub already stopped");
        }
        match &result {
            Ok(()) => info!(client = %self.id(), "Client session ended"),
            Err(e) => warn!(client = %self.id(), error = %e, "Client session ended with error"),
        }
        result
    }

    /// Drain the outbound queue to the wire, pinging every `ping_period`.
    ///
    /// Returns after sending a close frame once the hub closes the queue.
    pub async fn write_pump<S>(
        &self,
        mut queue: OutboundQueue,
        mut sink: S,
    ) -> Result<(), SessionError>
    where
        S: Sink<Frame> + Unpin,
        S::Error: fmt::Display,
    {
        let period = self.config.ping_period().max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = queue.recv() => match event {
                    Some(event) => {
                        let text = event.to_json()?;
                        self.write_frame(&mut sink, Frame::Text(text)).await?;
                    }
                    None => {
                        debug!(client = %self.id(), "Outbound queue closed");
                        let _ = self.write_frame(&mut sink, Frame::Close).await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.write_frame(&mut sink, Frame::Ping(Vec::new())).await?;
                }
            }
        }
    }

    async fn write_frame<S>(&self, sink: &mut S, frame: Frame) -> Result<(), SessionError>
    where
        S: Sink<Frame> + Unpin,
        S::Error: fmt::Display,
    {
        match timeout(self.config.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
            Err(_) => Err(SessionError::WriteTimeout(self.config.write_wait)),
        }
    }

    /// Read frames until the peer closes, disconnects or goes silent for `pong_wait`.
    pub async fn read_pump<R, E>(&self, mut stream: R) -> Result<(), SessionError>
    where
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let frame = match timeout(self.config.pong_wait, stream.next()).await {
                Err(_) => return Err(SessionError::ReadTimeout(self.config.pong_wait)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(SessionError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };
            self.handle.touch();

            match frame {
                Frame::Text(text) => {
                    if text.len() > self.config.max_message_size {
                        return Err(SessionError::MessageTooLarge {
                            size: text.len(),
                            limit: self.config.max_message_size,
                        });
                    }
                    if self.handle_message(&text).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                Frame::Ping(_) | Frame::Pong(_) => {}
                Frame::Close => return Ok(()),
            }
        }
    }

    /// Dispatch one inbound text message by event type.
    pub async fn handle_message(&self, text: &str) -> Result<Flow, SessionError> {
        let event = match Event::from_json(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(client = %self.id(), error = %e, "Dropping unrecognised message");
                return Ok(Flow::Continue);
            }
        };

        if !event.event_type.is_control() {
            match &self.handler {
                Some(handler) => handler.handle(&self.handle, event).await,
                None => debug!(
                    client = %self.id(),
                    event_type = %event.event_type,
                    "No inbound handler, dropping event"
                ),
            }
            return Ok(Flow::Continue);
        }

        match event.event_type {
            EventType::Heartbeat => self.reply_pong(),
            EventType::Disconnect => {
                debug!(client = %self.id(), "Client requested disconnect");
                self.hub.unregister(self.id()).await?;
                return Ok(Flow::Stop);
            }
            _ => debug!(client = %self.id(), "Client connect acknowledged"),
        }
        Ok(Flow::Continue)
    }

    /// Answer a heartbeat straight onto this client's queue, bypassing the hub mailbox.
    fn reply_pong(&self) {
        let Some(sender) = self.replies.upgrade() else {
            debug!(client = %self.id(), "Queue already closed, skipping pong");
            return;
        };
        let pong = Event::for_client(EventType::Heartbeat, json!("pong"), self.id());
        if let Err(e) = sender.try_send(pong) {
            warn!(client = %self.id(), error = %e, "Could not queue heartbeat reply");
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::hub::HubConfig;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            pong_wait: Duration::from_secs(10),
            write_wait: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_ping_period_is_nine_tenths_of_pong_wait() {
        let config = ClientConfig::default();
        assert_eq!(config.ping_period(), Duration::from_secs(54));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config_validation() {
        let config = ClientConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "client.queue_capacity");
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_alive_after_silence() {
        let (client, _queue) = Client::new("user-1", 4);
        let handle = client.handle();
        let pong_wait = Duration::from_secs(10);

        assert!(handle.is_alive(pong_wait));
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!handle.is_alive(pong_wait));

        handle.touch();
        assert!(handle.is_alive(pong_wait));
    }

    #[tokio::test]
    async fn test_queue_closes_when_client_dropped() {
        let (client, mut queue) = Client::new("user-1", 4);
        client.try_send(Event::new(EventType::LogAlert, json!({}))).unwrap();
        drop(client);

        assert_eq!(queue.recv().await.unwrap().event_type, EventType::LogAlert);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_send() {
        let (client, _queue) = Client::new("user-1", 1);
        client.try_send(Event::new(EventType::LogAlert, json!(1))).unwrap();
        let err = client
            .try_send(Event::new(EventType::LogAlert, json!(2)))
            .unwrap_err();
        assert!(matches!(err, TrySendError::Full(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_answered_while_hub_mailbox_full() {
        let hub = EventHub::spawn(HubConfig {
            mailbox_capacity: 1,
        });
        let (session, mut queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();
        assert_eq!(queue.recv().await.unwrap().event_type, EventType::Connect);

        assert!(hub.broadcast_to_all(EventType::LogAlert, json!(1)));
        assert!(!hub.broadcast_to_all(EventType::LogAlert, json!(2)));

        session
            .handle_message(r#"{"type":"heartbeat"}"#)
            .await
            .unwrap();

        let mut received = vec![
            queue.recv().await.unwrap().event_type,
            queue.recv().await.unwrap().event_type,
        ];
        received.sort_by_key(|t| t.as_str());
        assert_eq!(received, vec![EventType::Heartbeat, EventType::LogAlert]);
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered_with_pong() {
        let hub = EventHub::spawn(HubConfig::default());
        let (session, mut queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();
        assert_eq!(queue.recv().await.unwrap().event_type, EventType::Connect);

        let flow = session
            .handle_message(r#"{"type":"heartbeat","data":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        let reply = queue.recv().await.unwrap();
        assert_eq!(reply.event_type, EventType::Heartbeat);
        assert_eq!(reply.data, json!("pong"));
        assert_eq!(reply.client_id, session.id());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_stops() {
        let hub = EventHub::spawn(HubConfig::default());
        let (session, mut queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();

        let flow = session.handle_message(r#"{"type":"disconnect"}"#).await.unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(hub.connected_clients().await.unwrap(), 0);

        assert_eq!(queue.recv().await.unwrap().event_type, EventType::Connect);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_application_events() {
        struct Recorder(Mutex<Vec<EventType>>);

        #[async_trait]
        impl InboundHandler for Recorder {
            async fn handle(&self, _client: &ClientHandle, event: Event) {
                self.0.lock().unwrap().push(event.event_type);
            }
        }

        let hub = EventHub::spawn(HubConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (session, _queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();
        let session = session.with_handler(recorder.clone());

        assert_eq!(session.handle_message("not json").await.unwrap(), Flow::Continue);
        assert_eq!(
            session.handle_message(r#"{"type":"reboot"}"#).await.unwrap(),
            Flow::Continue
        );
        session
            .handle_message(r#"{"type":"test_progress","data":{"pct":50}}"#)
            .await
            .unwrap();
        session.handle_message(r#"{"type":"connect"}"#).await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![EventType::TestProgress]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_pumps_over_channels() {
        let hub = EventHub::spawn(HubConfig::default());
        let (session, queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();
        let id = session.id().to_string();

        let (out_tx, mut out_rx) = fmpsc::unbounded::<Frame>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Frame, Infallible>>();
        let task = tokio::spawn(session.run(queue, out_tx, in_rx));

        let connect = out_rx.next().await.unwrap();
        assert!(matches!(connect, Frame::Text(ref t) if t.contains("\"connect\"")));

        hub.broadcast_to_all(EventType::LogAlert, json!({"level": "error"}));
        let alert = out_rx.next().await.unwrap();
        assert!(matches!(alert, Frame::Text(ref t) if t.contains("log_alert")));

        // Silence past one ping period produces a ping frame
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(out_rx.next().await.unwrap(), Frame::Ping(Vec::new()));

        in_tx
            .unbounded_send(Ok(Frame::Text(r#"{"type":"disconnect"}"#.to_string())))
            .unwrap();
        task.await.unwrap().unwrap();

        assert!(!hub.client_ids().await.unwrap().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let hub = EventHub::spawn(HubConfig::default());
        let (session, _queue) = ClientSession::open(&hub, "user-1", fast_config())
            .await
            .unwrap();

        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Frame, Infallible>>();
        let err = session.read_pump(in_rx).await.unwrap_err();
        assert!(matches!(err, SessionError::ReadTimeout(d) if d == Duration::from_secs(10)));
    }
}
