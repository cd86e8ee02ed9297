//! The vocabulary shared by every other module: node identities, views, the wire format, message
//! authentication, transports, configuration and errors.
//!
//! ### Wire Format
//! Every packet starts with the cluster magic and a [`MessageType`] tag. Heartbeats carry the
//! sender's [`Identity`], its [`View`], its current vote and the set of peers it wants to exchange
//! application messages with. When a [`SecurityConfig`] is present, an HMAC-SHA1 tag is appended
//! to every packet and checked before decoding.
//!
//! ### Transports
//! The membership engine only needs "send bytes to an address" and "receive bytes from an
//! address". [`UdpTransport`] does this with datagrams (optionally multicast), [`TcpTransport`]
//! with length-prefixed streams, and [`MemoryNetwork`](crate::testkit::MemoryNetwork) in memory.

mod config;
mod error;
mod identity;
mod packets;
mod security;
mod transport;
mod view;

#[rustfmt::skip]
pub use {
  config::ClusterConfig,
  config::ProtocolKind,
  config::SecurityConfig,
  error::ConfigError,
  error::ConnectionError,
  error::DecodeError,
  identity::now_millis,
  identity::Identity,
  identity::Timestamp,
  packets::AppMessage,
  packets::Heartbeat,
  packets::MessageType,
  packets::Packet,
  packets::HEADER_SIZE,
  security::KeyRing,
  security::Security,
  security::MAC_SIZE,
  transport::frame,
  transport::TcpTransport,
  transport::Transport,
  transport::UdpTransport,
  view::View,
};
pub(crate) use transport::{closed_error, Closer};
