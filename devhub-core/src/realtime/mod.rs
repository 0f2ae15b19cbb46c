//! Real-time event delivery to connected clients.
//!
//! The [`EventHub`] fans [`Event`]s out to registered [`Client`]s. A
//! [`ClientSession`] drives one transport connection with a read pump and a
//! write pump.

pub mod client;
pub mod event;
pub mod hub;

pub use client::{
    Client, ClientConfig, ClientHandle, ClientInfo, ClientSession, Flow, Frame, InboundHandler,
    OutboundQueue, SessionError, DEFAULT_QUEUE_CAPACITY,
};
pub use event::{Event, EventType};
pub use hub::{EventHub, HubConfig, HubError, HubStats};
