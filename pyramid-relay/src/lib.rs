//! Pyramid Stream rendezvous relay
//!
//! A small topic relay that room sessions use to find each other. Clients
//! connect over WebSocket, subscribe to room topics and publish signaling
//! frames; the relay forwards each published frame to the topic's other
//! subscribers and keeps no history.

pub mod hub;
pub mod server;

pub use hub::{ConnectionId, HubStats, TopicHub};
pub use server::RelayServer;
