use crate::core::{ClusterConfig, Heartbeat, Identity, ProtocolKind, Timestamp, View};
use crate::detection::FailureDetector;
use crate::election::Candidate;
use im::OrdSet;
use std::fmt;
use std::net::SocketAddr;

/// What accepting a heartbeat changed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reception {
  /// Stale, duplicate, or the protocol is terminated.
  Rejected,
  Accepted,
  /// Only the view's timestamp moved.
  NewViewTime,
  /// The sender's view changed, possibly only by its view number.
  NewView,
}
impl Reception {
  pub fn is_accepted(&self) -> bool {
    *self != Reception::Rejected
  }
}

/// Everything known about one remote peer: its latest heartbeat, how timely it is, and its ballot
/// for leader election.
///
/// A protocol is created from the first heartbeat of an unknown peer and is never reactivated once
/// terminated. If the peer comes back, a fresh protocol replaces this one.
pub struct HeartbeatProtocol {
  sender: Identity,
  address: SocketAddr,
  controller: Option<SocketAddr>,
  kind: ProtocolKind,
  time: Timestamp,
  arrival: Timestamp,
  order: u64,
  view: View,
  msg_links: OrdSet<i32>,
  timebound: i64,
  round_trip: Option<i64>,
  detector: Box<dyn FailureDetector>,
  candidate: Candidate,
  terminated: bool,
}
impl HeartbeatProtocol {
  /// Builds the protocol for the sender of `hb`, which counts as its first accepted heartbeat.
  pub fn new(
    hb: &Heartbeat,
    from: SocketAddr,
    now: Timestamp,
    round_trip: Option<i64>,
    config: &ClusterConfig,
  ) -> HeartbeatProtocol {
    let mut protocol = HeartbeatProtocol {
      sender: hb.sender,
      address: hb.sender_address.unwrap_or(from),
      controller: hb.controller,
      kind: config.protocol,
      time: hb.time,
      arrival: now,
      order: hb.order,
      view: hb.view.clone(),
      msg_links: hb.msg_links.clone(),
      timebound: config.timeout_millis(),
      round_trip: round_trip,
      detector: config.detector.build(),
      candidate: Candidate::new(hb.sender, hb.candidate, hb.preferred),
      terminated: false,
    };
    let delay = protocol.delay(hb, now);
    protocol.detector.record(now, delay);
    protocol
  }

  // Ping peers are judged on the local arrival clock only.
  fn delay(&self, hb: &Heartbeat, now: Timestamp) -> i64 {
    match self.kind {
      ProtocolKind::Timestamp => now - hb.time,
      ProtocolKind::Ping => 0,
    }
  }

  /// Accepts `hb` if it is newer than everything accepted so far.
  pub fn receive_heartbeat(
    &mut self,
    hb: &Heartbeat,
    now: Timestamp,
    round_trip: Option<i64>,
  ) -> Reception {
    if self.terminated || hb.time <= self.time {
      return Reception::Rejected;
    }
    self.time = hb.time;
    self.arrival = now;
    self.order = hb.order;
    if let Some(addr) = hb.sender_address {
      self.address = addr;
    }
    self.controller = hb.controller;
    self.msg_links = hb.msg_links.clone();
    self.candidate.set_vote(hb.candidate);
    self.candidate.set_preferred(hb.preferred);
    if round_trip.is_some() {
      self.round_trip = round_trip;
    }
    let delay = self.delay(hb, now);
    self.detector.record(now, delay);

    let reception = if hb.view.view_number() != self.view.view_number()
      || !hb.view.same_content(&self.view)
    {
      Reception::NewView
    } else if hb.view.timestamp() != self.view.timestamp() {
      Reception::NewViewTime
    } else {
      Reception::Accepted
    };
    self.view = hb.view.clone();
    reception
  }

  /// Whether the peer is still considered alive at `now`.
  pub fn is_timely(&self, now: Timestamp) -> bool {
    if self.terminated {
      return false;
    }
    let late = match self.kind {
      // Clocks running backwards are as suspicious as lagging ones.
      ProtocolKind::Timestamp => (now - self.time).abs() > self.timebound,
      ProtocolKind::Ping => now - self.arrival > self.timebound,
    };
    !late && !self.detector.should_convict(now)
  }

  /// Whether nothing has been accepted for longer than `quiesce`.
  pub fn is_quiesced(&self, now: Timestamp, quiesce: i64) -> bool {
    now - self.arrival > quiesce
  }

  pub fn terminate(&mut self) {
    self.terminated = true;
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated
  }

  /// Applies new timing. The detector starts over.
  pub fn set_timing(&mut self, config: &ClusterConfig) {
    self.timebound = config.timeout_millis();
    self.detector = config.detector.build();
  }

  pub fn sender(&self) -> Identity {
    self.sender
  }

  pub fn address(&self) -> SocketAddr {
    self.address
  }

  pub fn controller(&self) -> Option<SocketAddr> {
    self.controller
  }

  pub fn time(&self) -> Timestamp {
    self.time
  }

  pub fn arrival(&self) -> Timestamp {
    self.arrival
  }

  /// The latest round trip measured through an echoed ping.
  pub fn round_trip(&self) -> Option<i64> {
    self.round_trip
  }

  pub fn order(&self) -> u64 {
    self.order
  }

  pub fn view(&self) -> &View {
    &self.view
  }

  pub fn msg_links(&self) -> &OrdSet<i32> {
    &self.msg_links
  }

  pub fn candidate(&self) -> &Candidate {
    &self.candidate
  }

  pub fn candidate_mut(&mut self) -> &mut Candidate {
    &mut self.candidate
  }
}
impl fmt::Debug for HeartbeatProtocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HeartbeatProtocol")
      .field("sender", &self.sender)
      .field("time", &self.time)
      .field("arrival", &self.arrival)
      .field("view", &self.view)
      .field("terminated", &self.terminated)
      .finish()
  }
}

#[cfg(test)]
use crate::detection::DetectorConfig;
#[cfg(test)]
use im::ordset;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn heartbeat(time: Timestamp, view: View) -> Heartbeat {
  let sender = Identity::new(1, 4, 77);
  Heartbeat {
    sender: sender,
    sender_address: None,
    time: time,
    view: view,
    candidate: sender,
    preferred: false,
    msg_links: OrdSet::new(),
    controller: None,
    order: time as u64,
    pings: OrdSet::new(),
  }
}

#[cfg(test)]
fn config(kind: ProtocolKind) -> ClusterConfig {
  let mut cfg = ClusterConfig::with_timing(0, Duration::from_millis(100), Duration::from_millis(300));
  cfg.protocol = kind;
  cfg
}

#[cfg(test)]
fn addr() -> SocketAddr {
  "127.0.0.1:9000".parse().unwrap()
}

#[test]
fn test_only_newest_heartbeat_is_kept() {
  use rand::seq::SliceRandom;
  use rand::SeedableRng;
  let view = View::new(ordset![0, 4], false, 0, 1);
  let mut rng = rand::rngs::SmallRng::seed_from_u64(7);
  for _ in 0..20 {
    let mut times = (1..=30).map(|t| t * 10).collect::<Vec<Timestamp>>();
    times.shuffle(&mut rng);
    let mut p = HeartbeatProtocol::new(&heartbeat(5, view.clone()), addr(), 5, None, &config(ProtocolKind::Timestamp));
    let mut max = 5;
    for t in times {
      let accepted = p.receive_heartbeat(&heartbeat(t, view.clone()), t, None).is_accepted();
      assert_eq!(accepted, t > max);
      max = max.max(t);
      assert_eq!(p.time(), max);
    }
    assert!(!p.receive_heartbeat(&heartbeat(300, view.clone()), 301, None).is_accepted());
  }
}

#[test]
fn test_view_number_change_is_a_new_view() {
  let cfg = config(ProtocolKind::Timestamp);
  let v1 = View::new(ordset![0, 4], true, 10, 1);
  let mut p = HeartbeatProtocol::new(&heartbeat(100, v1.clone()), addr(), 100, None, &cfg);
  assert_eq!(p.receive_heartbeat(&heartbeat(200, v1.clone()), 200, None), Reception::Accepted);
  // Same members, new number: the sender flapped in between.
  let v2 = View::new(ordset![0, 4], true, 10, 3);
  assert_eq!(p.receive_heartbeat(&heartbeat(300, v2.clone()), 300, None), Reception::NewView);
  assert_eq!(
    p.receive_heartbeat(&heartbeat(400, v2.with_timestamp(20)), 400, None),
    Reception::NewViewTime
  );
  let v3 = View::new(ordset![0, 4], false, 30, 3);
  assert_eq!(p.receive_heartbeat(&heartbeat(500, v3), 500, None), Reception::NewView);
}

#[test]
fn test_terminated_protocol_rejects() {
  let cfg = config(ProtocolKind::Timestamp);
  let view = View::singleton(4, 0);
  let mut p = HeartbeatProtocol::new(&heartbeat(100, view.clone()), addr(), 100, None, &cfg);
  p.terminate();
  assert!(!p.is_timely(100));
  assert_eq!(p.receive_heartbeat(&heartbeat(200, view), 200, None), Reception::Rejected);
}

#[test]
fn test_timestamp_timeliness_is_symmetric() {
  let cfg = config(ProtocolKind::Timestamp);
  let view = View::singleton(4, 0);
  // The sender's clock runs 1000ms ahead of ours.
  let p = HeartbeatProtocol::new(&heartbeat(2000, view), addr(), 1000, None, &cfg);
  assert!(!p.is_timely(1000));
  assert!(p.is_timely(1800));
  assert!(p.is_timely(2300));
  assert!(!p.is_timely(2301));
}

#[test]
fn test_ping_timeliness_uses_local_arrival() {
  let cfg = config(ProtocolKind::Ping);
  let view = View::singleton(4, 0);
  let mut p = HeartbeatProtocol::new(&heartbeat(99_999, view.clone()), addr(), 1000, Some(40), &cfg);
  assert_eq!(p.round_trip(), Some(40));
  assert!(p.is_timely(1000));
  assert!(p.is_timely(1300));
  assert!(!p.is_timely(1301));
  assert!(!p.is_quiesced(1600, 600));
  assert!(p.is_quiesced(1601, 600));
  // A later echo refreshes the round trip without moving the bound off the arrival.
  p.receive_heartbeat(&heartbeat(100_000, view), 1100, Some(80));
  assert_eq!(p.round_trip(), Some(80));
  assert!(p.is_timely(1400));
  assert!(!p.is_timely(1401));
}

#[test]
fn test_detector_conviction_overrides_timebound() {
  let mut cfg = config(ProtocolKind::Ping);
  cfg.detector = DetectorConfig::FixedTimeout {
    timeout: Duration::from_millis(50),
  };
  let view = View::singleton(4, 0);
  let p = HeartbeatProtocol::new(&heartbeat(1, view), addr(), 1000, None, &cfg);
  assert!(p.is_timely(1050));
  assert!(!p.is_timely(1051));
}
