use crate::core::ConfigError;
use crate::detection::DetectorConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// How a peer's heartbeats are judged timely.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProtocolKind {
  /// Heartbeats carry the sender's clock. A peer is late when its clock differs from ours by more
  /// than the timeout in either direction.
  Timestamp,
  /// Only the local clock is trusted. Heartbeats echo the ids they have heard from, which yields
  /// round trip samples.
  Ping,
}

/// Message authentication keys.
///
/// Datagrams are tagged with the current key. Received datagrams are checked against the current
/// key, then the last key, then the default key, so a key rotation can propagate through the
/// cluster without partitioning it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityConfig {
  pub key: Vec<u8>,
  pub last_key: Option<Vec<u8>>,
  pub default_key: Option<Vec<u8>>,
}

/// Configures a [`Node`](crate::cluster::Node) and its
/// [`ConnectionSet`](crate::cluster::ConnectionSet).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
  /// Separates clusters sharing a network. Packets with another magic are dropped silently.
  ///
  /// default: `0x414e5542`
  pub magic: u32,
  /// The number of this node. Must be below [`max_nodes`](#field.max_nodes).
  ///
  /// default: `0`
  pub id: i32,
  /// The size of the id space.
  ///
  /// default: `64`
  pub max_nodes: usize,
  /// Preferred nodes win elections against non-preferred nodes regardless of votes.
  ///
  /// default: `false`
  pub preferred: bool,
  /// How often a heartbeat is sent.
  ///
  /// default: `1 second`
  pub heartbeat_interval: Duration,
  /// How long a peer may stay silent before it leaves the view.
  ///
  /// default: `3 seconds`
  pub timeout: Duration,
  /// How long a dead peer is remembered before its entry may be reaped or replaced.
  ///
  /// default: `6 seconds`
  pub quiesce: Duration,
  /// How often the connection set sweeps its connections.
  ///
  /// default: `500 milliseconds`
  pub check_period: Duration,
  /// How long the membership must stay unchanged before the view becomes stable.
  ///
  /// default: `2 seconds`
  pub stabilization_delay: Duration,
  /// Listener upcalls running longer than this are reported.
  ///
  /// default: `200 milliseconds`
  pub upcall_timeout: Duration,
  /// default: [`ProtocolKind::Timestamp`]
  pub protocol: ProtocolKind,
  /// Failure detector built for every peer.
  ///
  /// default: [`DetectorConfig::FixedTimeout`] with the [`timeout`](#field.timeout)
  pub detector: DetectorConfig,
  /// Where heartbeats are sent: a multicast group or a list of peers.
  ///
  /// default: `[]`
  pub heartbeat_targets: Vec<SocketAddr>,
  /// Advertised in heartbeats for management tooling.
  ///
  /// default: `None`
  pub controller: Option<SocketAddr>,
  /// default: `None`
  pub security: Option<SecurityConfig>,
}
impl Default for ClusterConfig {
  #[inline]
  fn default() -> Self {
    ClusterConfig {
      magic: 0x414e5542,
      id: 0,
      max_nodes: 64,
      preferred: false,
      heartbeat_interval: Duration::from_millis(1000),
      timeout: Duration::from_millis(3000),
      quiesce: Duration::from_millis(6000),
      check_period: Duration::from_millis(500),
      stabilization_delay: Duration::from_millis(2000),
      upcall_timeout: Duration::from_millis(200),
      protocol: ProtocolKind::Timestamp,
      detector: DetectorConfig::FixedTimeout {
        timeout: Duration::from_millis(3000),
      },
      heartbeat_targets: vec![],
      controller: None,
      security: None,
    }
  }
}
impl ClusterConfig {
  /// A configuration for node `id` with every period scaled from `interval`.
  pub fn with_timing(id: i32, interval: Duration, timeout: Duration) -> ClusterConfig {
    ClusterConfig {
      id: id,
      heartbeat_interval: interval,
      timeout: timeout,
      quiesce: timeout * 2,
      check_period: interval / 2,
      stabilization_delay: interval * 2,
      detector: DetectorConfig::FixedTimeout { timeout: timeout },
      ..ClusterConfig::default()
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.id < 0 || self.id as usize >= self.max_nodes {
      return Err(ConfigError::IdOutOfRange {
        id: self.id,
        max_nodes: self.max_nodes,
      });
    }
    for (name, d) in [
      ("heartbeat_interval", self.heartbeat_interval),
      ("check_period", self.check_period),
      ("upcall_timeout", self.upcall_timeout),
    ]
    .iter()
    {
      if d.as_millis() == 0 {
        return Err(ConfigError::Zero(*name));
      }
    }
    if self.timeout <= self.heartbeat_interval {
      return Err(ConfigError::TimeoutTooShort {
        timeout: self.timeout,
        interval: self.heartbeat_interval,
      });
    }
    if self.quiesce < self.timeout {
      return Err(ConfigError::QuiesceTooShort {
        quiesce: self.quiesce,
        timeout: self.timeout,
      });
    }
    self.detector.validate()?;
    if let Some(sec) = &self.security {
      if sec.key.is_empty() {
        return Err(ConfigError::EmptyKey);
      }
    }
    Ok(())
  }

  pub(crate) fn timeout_millis(&self) -> i64 {
    self.timeout.as_millis() as i64
  }

  pub(crate) fn quiesce_millis(&self) -> i64 {
    self.quiesce.as_millis() as i64
  }

  pub(crate) fn stabilization_millis(&self) -> i64 {
    self.stabilization_delay.as_millis() as i64
  }
}

#[test]
fn test_config_validation() {
  assert_eq!(ClusterConfig::default().validate(), Ok(()));
  let mut cfg = ClusterConfig::default();
  cfg.id = 64;
  assert_eq!(
    cfg.validate(),
    Err(ConfigError::IdOutOfRange {
      id: 64,
      max_nodes: 64
    })
  );
  let cfg = ClusterConfig::with_timing(1, Duration::from_millis(100), Duration::from_millis(100));
  assert!(matches!(cfg.validate(), Err(ConfigError::TimeoutTooShort { .. })));
  let mut cfg = ClusterConfig::with_timing(1, Duration::from_millis(100), Duration::from_millis(300));
  assert_eq!(cfg.validate(), Ok(()));
  cfg.quiesce = Duration::from_millis(200);
  assert!(matches!(cfg.validate(), Err(ConfigError::QuiesceTooShort { .. })));
}
