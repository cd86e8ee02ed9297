use std::io;
use std::time::Duration;

/// Reasons an inbound datagram or frame could not be turned into a [`Packet`].
///
/// These never escape the receive path: the packet is dropped and the reason is logged.
///
/// [`Packet`]: crate::core::Packet
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
  #[error("magic mismatch: expected {expected:#010x}, found {found:#010x}")]
  BadMagic { expected: u32, found: u32 },

  #[error("unknown message type {0}")]
  UnknownType(u8),

  #[error("truncated message: need {needed} bytes, have {have}")]
  Truncated { needed: usize, have: usize },

  #[error("invalid address encoding of length {0}")]
  InvalidAddress(u8),

  #[error("invalid bitset member {0}")]
  InvalidMember(i32),

  #[error("message authentication failed")]
  BadMac,

  #[error("{0} trailing bytes after message")]
  Trailing(usize),

  #[error("envelope: {0}")]
  Envelope(#[from] serde_cbor::Error),
}

/// Problems found by [`ClusterConfig::validate`](crate::core::ClusterConfig::validate).
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
  #[error("node id {id} outside of 0..{max_nodes}")]
  IdOutOfRange { id: i32, max_nodes: usize },

  #[error("timeout {timeout:?} must exceed heartbeat interval {interval:?}")]
  TimeoutTooShort { timeout: Duration, interval: Duration },

  #[error("quiesce {quiesce:?} must be at least the timeout {timeout:?}")]
  QuiesceTooShort { quiesce: Duration, timeout: Duration },

  #[error("{0} must be greater than zero")]
  Zero(&'static str),

  #[error("security is enabled with an empty key")]
  EmptyKey,
}

/// Failures surfaced through the upward API.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
  #[error("node {0} is not a live member")]
  UnknownNode(i32),

  #[error("connection to node {0} has been terminated")]
  Terminated(i32),

  #[error("connection to node {0} is not a message connection")]
  NotUpgraded(i32),

  #[error("the local node has been terminated")]
  NodeTerminated,

  #[error("transport: {0}")]
  Transport(#[from] io::Error),

  #[error("serialization: {0}")]
  Serialization(#[from] serde_cbor::Error),
}
