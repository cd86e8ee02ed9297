//! The membership engine and the runtime that drives it.
//!
//! Heartbeats flow from the [`Transport`](crate::core::Transport) into the [`ConnectionSet`],
//! which keeps one [`Connection`] (wrapping a [`HeartbeatProtocol`]) per peer, derives the local
//! [`View`](crate::core::View) and elects the leader. [`Node`] owns the tasks: the receive loop,
//! the heartbeat sender, the periodic sweep and the upcall dispatcher.

mod connection;
mod connection_set;
mod heartbeat_protocol;
mod node;

#[rustfmt::skip]
pub use {
  connection::Connection,
  connection::Link,
  connection::SeqCheck,
  connection_set::ConnectionSet,
  connection_set::MessageOutcome,
  connection_set::Notification,
  connection_set::Outbound,
  heartbeat_protocol::HeartbeatProtocol,
  heartbeat_protocol::Reception,
  node::MessageConnection,
  node::Node,
};
