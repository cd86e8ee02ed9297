use crate::cluster::{Connection, HeartbeatProtocol, Reception, SeqCheck};
use crate::core::{
  AppMessage, ClusterConfig, ConfigError, ConnectionError, Heartbeat, Identity, Packet, ProtocolKind,
  Timestamp, View,
};
use crate::detection::DetectorConfig;
use crate::election::{Candidate, LeaderMgr};
use crate::partition::Delivery;
use hashbrown::HashMap;
use im::OrdSet;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// A view together with the leader elected for it, as handed to listeners.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
  pub view: View,
  pub leader: Identity,
}

/// What became of an inbound application message.
#[derive(Debug)]
pub enum MessageOutcome {
  Deliver(Delivery),
  Dropped,
  /// The message broke the sequence. The connection was terminated and the membership re-evaluated.
  Violation(Vec<Notification>),
}

/// Where and how to send the next message on a link.
#[derive(Clone, Copy, Debug)]
pub struct Outbound {
  pub sender: Identity,
  pub address: SocketAddr,
  pub seq: u64,
}

struct Inner {
  config: ClusterConfig,
  me: Identity,
  address: Option<SocketAddr>,
  conns: HashMap<i32, Connection>,
  candidate: Candidate,
  leader_mgr: LeaderMgr,
  view: View,
  view_number: u64,
  last_change: Timestamp,
  ignoring: OrdSet<i32>,
  claims: OrdSet<i32>,
  order: u64,
  last_time: Timestamp,
  last_sent: Option<Timestamp>,
  heard: OrdSet<i32>,
  notified: Option<(u64, bool, Identity)>,
  terminated: bool,
}

/// The membership engine.
///
/// Owns one [`Connection`] per peer and derives the local [`View`] from them. Every mutation
/// (heartbeat ingress, the periodic sweep, elections, upgrades) runs under one lock, so an
/// election always sees a consistent connection table. Nothing here calls into user code: the
/// operations return the [`Notification`]s and deliveries to dispatch once the lock is released.
///
/// The aggregate view cycles between unstable and stable. It becomes stable once the membership
/// has not changed for `stabilization_delay`, the last election did not move the leader, and every
/// live peer reports the same members. Any membership or leader change makes it unstable again.
pub struct ConnectionSet {
  inner: Mutex<Inner>,
}
impl ConnectionSet {
  pub fn new(config: ClusterConfig, me: Identity, now: Timestamp) -> ConnectionSet {
    let view = View::singleton(me.id, now);
    ConnectionSet {
      inner: Mutex::new(Inner {
        candidate: Candidate::solo(me, config.preferred),
        config: config,
        me: me,
        address: None,
        conns: HashMap::new(),
        leader_mgr: LeaderMgr::new(),
        view: view,
        view_number: 0,
        last_change: now,
        ignoring: OrdSet::new(),
        claims: OrdSet::new(),
        order: 0,
        last_time: Timestamp::MIN,
        last_sent: None,
        heard: OrdSet::new(),
        notified: None,
        terminated: false,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // Poisoning is ignored.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn identity(&self) -> Identity {
    self.lock().me
  }

  /// Address advertised in outbound heartbeats.
  pub fn set_address(&self, address: SocketAddr) {
    self.lock().address = Some(address);
  }

  pub fn heartbeat_interval(&self) -> Duration {
    self.lock().config.heartbeat_interval
  }

  pub fn check_period(&self) -> Duration {
    self.lock().config.check_period
  }

  pub fn heartbeat_targets(&self) -> Vec<SocketAddr> {
    self.lock().config.heartbeat_targets.clone()
  }

  pub fn is_terminated(&self) -> bool {
    self.lock().terminated
  }

  /// Processes one decoded heartbeat.
  pub fn receive_heartbeat(
    &self,
    hb: &Heartbeat,
    from: SocketAddr,
    now: Timestamp,
  ) -> Vec<Notification> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return Vec::new();
    }
    let id = hb.sender.id;
    if !hb.sender.compatible(&inner.me) {
      trace!("dropping heartbeat from {} of another cluster", hb.sender);
      return Vec::new();
    }
    if id == inner.me.id {
      return Vec::new();
    }
    if id < 0 || id as usize >= inner.config.max_nodes {
      debug!("dropping heartbeat from out of range node {}", hb.sender);
      return Vec::new();
    }
    if inner.ignoring.contains(&id) {
      trace!("ignoring heartbeat from {}", hb.sender);
      return Vec::new();
    }
    trace!("heartbeat from {} at {}: {}", hb.sender, hb.time, hb.view);
    inner.heard.insert(id);
    let round_trip = match inner.config.protocol {
      ProtocolKind::Ping if hb.pings.contains(&inner.me.id) => inner.last_sent.map(|t| now - t),
      _ => None,
    };
    let wants_link = hb.msg_links.contains(&inner.me.id);
    let quiesce = inner.config.quiesce_millis();

    let changed = match inner.conns.get_mut(&id) {
      Some(conn) if conn.sender().same_incarnation(&hb.sender) => {
        let reception = conn.receive_heartbeat(hb, now, round_trip);
        if !reception.is_accepted() {
          return Vec::new();
        }
        if wants_link && conn.upgrade() {
          info!("{} upgraded the link to a message connection", hb.sender);
        }
        if reception == Reception::NewViewTime {
          // The peer re-stamped an unchanged view, its leader or stability moved.
          trace!("{} re-stamped its view at {}", hb.sender, hb.view.timestamp());
        }
        // A peer coming back from a timeout changes membership without a new view of its own.
        reception != Reception::Accepted || inner.view.contains(id) != conn.is_timely(now)
      }
      Some(conn) => {
        if hb.sender.epoch < conn.sender().epoch {
          debug!("dropping heartbeat from stale incarnation {}", hb.sender);
          return Vec::new();
        }
        let mut changed = false;
        if !conn.is_terminated() {
          info!("{} restarted as {}", conn.sender(), hb.sender);
          conn.terminate();
          changed = true;
        }
        if conn.is_quiesced(now, quiesce) {
          let mut fresh = Connection::new(HeartbeatProtocol::new(
            hb,
            from,
            now,
            round_trip,
            &inner.config,
          ));
          if wants_link || inner.claims.contains(&id) {
            fresh.upgrade();
          }
          inner.conns.insert(id, fresh);
          changed = true;
        }
        changed
      }
      None => {
        info!("new connection to {}", hb.sender);
        let mut conn = Connection::new(HeartbeatProtocol::new(
          hb,
          from,
          now,
          round_trip,
          &inner.config,
        ));
        if wants_link || inner.claims.contains(&id) {
          conn.upgrade();
        }
        inner.conns.insert(id, conn);
        true
      }
    };
    if changed {
      inner.evaluate(now)
    } else {
      Vec::new()
    }
  }

  /// The periodic sweep: reaps dead and quiesced connections, then re-evaluates the view.
  pub fn check(&self, now: Timestamp) -> Vec<Notification> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return Vec::new();
    }
    let quiesce = inner.config.quiesce_millis();
    inner.conns.retain(|_, conn| {
      let reap = !conn.is_timely(now) && conn.is_quiesced(now, quiesce);
      if reap {
        info!("reaping connection to {}", conn.sender());
      }
      !reap
    });
    inner.evaluate(now)
  }

  /// Builds the next outbound heartbeat.
  pub fn build_heartbeat(&self, now: Timestamp) -> Packet {
    let mut guard = self.lock();
    let inner = &mut *guard;
    inner.order += 1;
    // Receivers only accept strictly increasing times.
    let time = now.max(inner.last_time + 1);
    inner.last_time = time;
    let msg_links = inner
      .conns
      .iter()
      .filter(|(_, c)| c.is_upgraded())
      .map(|(id, _)| *id)
      .collect::<OrdSet<i32>>()
      .union(inner.claims.clone());
    let ping = inner.config.protocol == ProtocolKind::Ping;
    let pings = if ping {
      inner.last_sent = Some(time);
      std::mem::take(&mut inner.heard)
    } else {
      OrdSet::new()
    };
    let hb = Heartbeat {
      sender: inner.me,
      sender_address: inner.address,
      time: time,
      view: inner.view.clone(),
      candidate: inner.candidate.vote(),
      preferred: inner.candidate.is_preferred(),
      msg_links: msg_links,
      controller: inner.config.controller,
      order: inner.order,
      pings: pings,
    };
    if ping {
      Packet::PingHeartbeat(hb)
    } else {
      Packet::Heartbeat(hb)
    }
  }

  /// Checks the sequence of an inbound application message.
  pub fn receive_message(
    &self,
    message: AppMessage,
    serialized: bool,
    now: Timestamp,
  ) -> MessageOutcome {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return MessageOutcome::Dropped;
    }
    let conn = match inner.conns.get_mut(&message.sender.id) {
      Some(conn) if conn.sender().same_incarnation(&message.sender) => conn,
      _ => {
        debug!("dropping message from unknown peer {}", message.sender);
        return MessageOutcome::Dropped;
      }
    };
    if conn.is_terminated() {
      return MessageOutcome::Dropped;
    }
    if conn.upgrade() {
      info!("{} opened a message connection", message.sender);
    }
    match conn.accept_seq(message.seq) {
      SeqCheck::Deliver => MessageOutcome::Deliver(Delivery {
        message: message,
        serialized: serialized,
      }),
      SeqCheck::Duplicate => {
        trace!("duplicate message {} from {}", message.seq, message.sender);
        MessageOutcome::Dropped
      }
      SeqCheck::Gap { expected } => {
        error!(
          "message {} from {} while expecting {}, terminating the connection",
          message.seq, message.sender, expected
        );
        conn.terminate();
        MessageOutcome::Violation(inner.evaluate(now))
      }
    }
  }

  /// Claims a message connection to `id`. Claiming an already claimed link returns it again.
  pub fn connect(&self, id: i32, now: Timestamp) -> Result<Identity, ConnectionError> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return Err(ConnectionError::NodeTerminated);
    }
    let conn = inner.conns.get_mut(&id).ok_or(ConnectionError::UnknownNode(id))?;
    if conn.is_terminated() {
      return Err(ConnectionError::Terminated(id));
    }
    if !conn.is_timely(now) {
      return Err(ConnectionError::UnknownNode(id));
    }
    if inner.claims.insert(id).is_some() {
      debug!("message connection to {} already claimed", id);
    } else {
      conn.upgrade();
    }
    Ok(conn.sender())
  }

  /// Reserves the next sequence number on the link to `peer`.
  pub fn next_outbound(&self, peer: Identity) -> Result<Outbound, ConnectionError> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return Err(ConnectionError::NodeTerminated);
    }
    let me = inner.me;
    let conn = match inner.conns.get_mut(&peer.id) {
      Some(conn) if conn.sender().same_incarnation(&peer) => conn,
      _ => return Err(ConnectionError::Terminated(peer.id)),
    };
    if conn.is_terminated() {
      return Err(ConnectionError::Terminated(peer.id));
    }
    let seq = conn
      .next_send_seq()
      .ok_or(ConnectionError::NotUpgraded(peer.id))?;
    Ok(Outbound {
      sender: me,
      address: conn.address(),
      seq: seq,
    })
  }

  /// The current view and its leader.
  pub fn get_status(&self) -> (View, Identity) {
    let inner = self.lock();
    let leader = inner.leader_mgr.leader().unwrap_or(inner.me);
    (inner.view.clone(), leader)
  }

  /// Forces the view unstable, which leads to a fresh election once it stabilizes again.
  pub fn destabilize(&self, now: Timestamp) -> Vec<Notification> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    if inner.terminated {
      return Vec::new();
    }
    info!("destabilizing {}", inner.view);
    inner.last_change = now;
    inner.evaluate(now)
  }

  /// Drops heartbeats from `ids` at ingress until the next call.
  pub fn set_ignoring(&self, ids: OrdSet<i32>) {
    let mut inner = self.lock();
    info!("ignoring {:?}", ids);
    inner.ignoring = ids;
  }

  /// Changes the heartbeat cadence. Every failure detector starts over.
  pub fn set_timing(&self, interval: Duration, timeout: Duration) -> Result<(), ConfigError> {
    let mut guard = self.lock();
    let inner = &mut *guard;
    let mut config = inner.config.clone();
    config.heartbeat_interval = interval;
    config.timeout = timeout;
    config.quiesce = config.quiesce.max(timeout * 2);
    config.check_period = config.check_period.min(interval);
    if let DetectorConfig::FixedTimeout { .. } = config.detector {
      config.detector = DetectorConfig::FixedTimeout { timeout: timeout };
    }
    config.validate()?;
    info!("heartbeat interval {:?}, timeout {:?}", interval, timeout);
    for conn in inner.conns.values_mut() {
      conn.set_timing(&config);
    }
    inner.config = config;
    Ok(())
  }

  /// Terminates every connection. Later calls on the set do nothing.
  pub fn terminate(&self) {
    let mut inner = self.lock();
    if inner.terminated {
      return;
    }
    inner.terminated = true;
    for conn in inner.conns.values_mut() {
      conn.terminate();
    }
    info!("{} terminated", inner.me);
  }

  pub fn connection_count(&self) -> usize {
    self.lock().conns.len()
  }

  /// The latest round trip to `id`, for the ping protocol.
  pub fn round_trip(&self, id: i32) -> Option<i64> {
    self.lock().conns.get(&id).and_then(|c| c.round_trip())
  }

  pub fn is_upgraded(&self, id: i32) -> bool {
    self.lock().conns.get(&id).map(|c| c.is_upgraded()).unwrap_or(false)
  }
}

impl Inner {
  fn evaluate(&mut self, now: Timestamp) -> Vec<Notification> {
    let members = std::iter::once(self.me.id)
      .chain(
        self
          .conns
          .iter()
          .filter(|(id, c)| c.is_timely(now) && !self.ignoring.contains(*id))
          .map(|(id, _)| *id),
      )
      .collect::<OrdSet<i32>>();
    let changed = &members != self.view.members();
    if changed {
      self.view_number += 1;
      self.last_change = now;
      info!("membership of {} is now {:?}", self.me, members);
    }
    let agreed = self
      .conns
      .iter()
      .filter(|(id, _)| members.contains(*id))
      .all(|(_, c)| c.view().members() == &members);
    let settled = now - self.last_change >= self.config.stabilization_millis();
    let stable = !changed && settled && agreed;

    let previous = self.leader_mgr.leader();
    let candidate_view = View::new(members.clone(), stable, self.last_change, self.view_number);
    let leader = {
      let Inner {
        conns,
        candidate,
        leader_mgr,
        ..
      } = &mut *self;
      let peers = conns
        .values_mut()
        .map(|c| c.candidate_mut())
        .collect::<Vec<_>>();
      leader_mgr.elect_leader(&candidate_view, candidate, peers)
    };
    let stable = if previous.is_some() && previous != Some(leader) {
      self.last_change = now;
      false
    } else {
      stable
    };
    self.view = View::new(members, stable, self.last_change, self.view_number);

    let key = (self.view_number, stable, leader);
    if self.notified == Some(key) {
      return Vec::new();
    }
    self.notified = Some(key);
    info!("view {} with leader {}", self.view, leader);
    vec![Notification {
      view: self.view.clone(),
      leader: leader,
    }]
  }
}

#[cfg(test)]
use maplit::btreeset;
#[cfg(test)]
use std::collections::BTreeSet;

#[cfg(test)]
const MAGIC: u32 = 0x4d454d42;

#[cfg(test)]
fn test_set(id: i32) -> ConnectionSet {
  let mut cfg = ClusterConfig::with_timing(id, Duration::from_millis(100), Duration::from_millis(300));
  cfg.magic = MAGIC;
  ConnectionSet::new(cfg, Identity::new(MAGIC, id, 1), 0)
}

#[cfg(test)]
fn addr(id: i32) -> SocketAddr {
  SocketAddr::from(([10, 0, 0, id as u8 + 1], 4000))
}

#[cfg(test)]
fn heartbeat_of(packet: Packet) -> Heartbeat {
  match packet {
    Packet::Heartbeat(hb) | Packet::PingHeartbeat(hb) => hb,
    other => panic!("not a heartbeat: {:?}", other),
  }
}

#[cfg(test)]
fn members(view: &View) -> BTreeSet<i32> {
  view.members().iter().copied().collect()
}

// One round: everyone alive sends, everyone alive receives from everyone it hears, everyone sweeps.
#[cfg(test)]
fn round(sets: &[ConnectionSet], alive: &[bool], now: Timestamp) -> Vec<Notification> {
  let hbs = sets
    .iter()
    .map(|s| heartbeat_of(s.build_heartbeat(now)))
    .collect::<Vec<_>>();
  let mut notes = Vec::new();
  for (i, set) in sets.iter().enumerate() {
    if !alive[i] {
      continue;
    }
    for (j, hb) in hbs.iter().enumerate() {
      if i != j && alive[j] {
        notes.extend(set.receive_heartbeat(hb, addr(j as i32), now));
      }
    }
  }
  for (i, set) in sets.iter().enumerate() {
    if alive[i] {
      notes.extend(set.check(now));
    }
  }
  notes
}

#[test]
fn test_three_nodes_elect_highest_id() {
  let sets = (0..3).map(test_set).collect::<Vec<_>>();
  let alive = [true; 3];
  for t in 0..10 {
    round(&sets, &alive, t * 100);
  }
  for set in sets.iter() {
    let (view, leader) = set.get_status();
    assert_eq!(members(&view), btreeset! {0, 1, 2});
    assert!(view.is_stable(), "{}", view);
    assert_eq!(leader.id, 2);
  }
}

#[test]
fn test_dead_node_leaves_view() {
  let sets = (0..3).map(test_set).collect::<Vec<_>>();
  let mut alive = [true; 3];
  let mut t = 0;
  while t < 1000 {
    round(&sets, &alive, t);
    t += 100;
  }
  alive[2] = false;
  let died = t;
  let mut excluded_at = None;
  while t < 3000 {
    round(&sets, &alive, t);
    let (view, _) = sets[0].get_status();
    if excluded_at.is_none() && !view.contains(2) {
      excluded_at = Some(t);
    }
    t += 100;
  }
  // Still a member right up to the timeout.
  assert!(excluded_at.unwrap() - died >= 300 - 100);
  for set in sets[..2].iter() {
    let (view, leader) = set.get_status();
    assert_eq!(members(&view), btreeset! {0, 1});
    assert!(view.is_stable());
    assert_eq!(leader.id, 1);
  }
  assert_eq!(sets[0].connection_count(), 1);
}

#[cfg(test)]
fn detector_set(id: i32, detector: DetectorConfig) -> ConnectionSet {
  let mut cfg =
    ClusterConfig::with_timing(id, Duration::from_millis(100), Duration::from_millis(1000));
  cfg.magic = MAGIC;
  cfg.detector = detector;
  ConnectionSet::new(cfg, Identity::new(MAGIC, id, 1), 0)
}

#[test]
fn test_every_detector_convicts_a_dead_node() {
  // The last heartbeat of node 2 is sent at 900.
  let fixed = DetectorConfig::FixedTimeout {
    timeout: Duration::from_millis(1000),
  };
  let detectors = vec![
    (fixed, 2000, 2000),
    (DetectorConfig::phi_accrual(Duration::from_millis(100)), 1300, 1600),
    (DetectorConfig::adaptive(), 1100, 1300),
  ];
  for (detector, earliest, latest) in detectors {
    let sets = (0..3)
      .map(|id| detector_set(id, detector.clone()))
      .collect::<Vec<_>>();
    let mut alive = [true; 3];
    let mut t = 0;
    while t < 1000 {
      round(&sets, &alive, t);
      t += 100;
    }
    alive[2] = false;
    let mut excluded_at = None;
    while t < 3200 {
      round(&sets, &alive, t);
      let (view, _) = sets[0].get_status();
      if excluded_at.is_none() && !view.contains(2) {
        excluded_at = Some(t);
      }
      t += 100;
    }
    let excluded_at = excluded_at.unwrap();
    assert!(
      excluded_at >= earliest && excluded_at <= latest,
      "{:?} excluded at {}",
      detector,
      excluded_at
    );
    for set in sets[..2].iter() {
      let (view, leader) = set.get_status();
      assert_eq!(members(&view), btreeset! {0, 1}, "{:?}", detector);
      assert!(view.is_stable(), "{:?}", detector);
      assert_eq!(leader.id, 1);
    }
    // Reaped once quiescent, 2000 after the last heartbeat.
    assert_eq!(sets[0].connection_count(), 1, "{:?}", detector);
  }
}

#[test]
fn test_restamped_view_is_evaluated_at_once() {
  let a = test_set(0);
  let b = test_set(1);
  b.receive_heartbeat(&heartbeat_of(a.build_heartbeat(0)), addr(0), 0);
  let first = a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(10)), addr(1), 10);
  assert_eq!(first.len(), 1);
  assert!(!first[0].view.is_stable());

  // Settled by now, but an unchanged view from the peer does not trigger an evaluation.
  assert!(a
    .receive_heartbeat(&heartbeat_of(b.build_heartbeat(300)), addr(1), 300)
    .is_empty());
  let mut hb = heartbeat_of(b.build_heartbeat(310));
  hb.view = hb.view.with_timestamp(hb.view.timestamp() + 5);
  let restamped = a.receive_heartbeat(&hb, addr(1), 310);
  assert_eq!(restamped.len(), 1);
  assert!(restamped[0].view.is_stable());
  assert_eq!(restamped[0].view.view_number(), first[0].view.view_number());
  assert_eq!(members(&restamped[0].view), btreeset! {0, 1});
}

#[test]
fn test_not_timely_connection_waits_for_quiescence() {
  let a = test_set(0);
  let b = test_set(1);
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(0)), addr(1), 0);
  assert_eq!(a.connection_count(), 1);
  a.check(400);
  assert!(!a.get_status().0.contains(1));
  assert_eq!(a.connection_count(), 1);
  a.check(600);
  assert_eq!(a.connection_count(), 1);
  a.check(601);
  assert_eq!(a.connection_count(), 0);
}

#[test]
fn test_notifications_follow_transitions() {
  let sets = (0..2).map(test_set).collect::<Vec<_>>();
  let alive = [true; 2];
  let mut notes = Vec::new();
  for t in 0..8 {
    notes.extend(round(&sets, &alive, t * 100).into_iter().filter(|n| n.view.contains(0)));
  }
  let first = &notes[0];
  assert!(!first.view.is_stable());
  let last = notes.last().unwrap();
  assert!(last.view.is_stable());
  assert_eq!(last.leader.id, 1);
  // A quiet round changes nothing and notifies nobody.
  assert!(round(&sets, &alive, 800).is_empty());
  // Destabilizing fires a transition.
  let notes = sets[0].destabilize(850);
  assert_eq!(notes.len(), 1);
  assert!(!notes[0].view.is_stable());
}

#[test]
fn test_flapping_peer_bumps_view_number() {
  let a = test_set(0);
  let b = test_set(1);
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(0)), addr(1), 0);
  let (v1, _) = a.get_status();
  a.check(350);
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(360)), addr(1), 360);
  let (v2, _) = a.get_status();
  assert!(v1.same_members(&v2));
  assert!(v2.view_number() > v1.view_number());
}

#[test]
fn test_ignoring_drops_at_ingress() {
  let a = test_set(0);
  let b = test_set(1);
  a.set_ignoring(OrdSet::unit(1));
  assert!(a
    .receive_heartbeat(&heartbeat_of(b.build_heartbeat(0)), addr(1), 0)
    .is_empty());
  assert_eq!(a.connection_count(), 0);
  a.set_ignoring(OrdSet::new());
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(10)), addr(1), 10);
  assert_eq!(a.connection_count(), 1);
}

#[test]
fn test_restart_replaces_after_quiescence() {
  let a = test_set(0);
  let old = test_set(1);
  a.receive_heartbeat(&heartbeat_of(old.build_heartbeat(0)), addr(1), 0);
  let mut cfg = ClusterConfig::with_timing(1, Duration::from_millis(100), Duration::from_millis(300));
  cfg.magic = MAGIC;
  let new = ConnectionSet::new(cfg, Identity::new(MAGIC, 1, 2), 100);
  a.receive_heartbeat(&heartbeat_of(new.build_heartbeat(100)), addr(1), 100);
  // The old incarnation is terminated but stays in the table.
  assert!(!a.get_status().0.contains(1));
  assert_eq!(a.connection_count(), 1);
  a.receive_heartbeat(&heartbeat_of(new.build_heartbeat(700)), addr(1), 700);
  assert!(a.get_status().0.contains(1));
  assert_eq!(a.connect(1, 700).unwrap(), Identity::new(MAGIC, 1, 2));
  // A late heartbeat from the old incarnation changes nothing.
  assert!(a
    .receive_heartbeat(&heartbeat_of(old.build_heartbeat(710)), addr(1), 710)
    .is_empty());
}

#[test]
fn test_message_links() {
  let a = test_set(0);
  let b = test_set(1);
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(0)), addr(1), 0);
  b.receive_heartbeat(&heartbeat_of(a.build_heartbeat(0)), addr(0), 0);
  assert!(matches!(a.connect(7, 0), Err(ConnectionError::UnknownNode(7))));
  let peer = a.connect(1, 10).unwrap();
  assert_eq!(a.connect(1, 10).unwrap(), peer);
  // The claim travels in a's heartbeats and upgrades b's side.
  assert!(!b.is_upgraded(0));
  b.receive_heartbeat(&heartbeat_of(a.build_heartbeat(20)), addr(0), 20);
  assert!(b.is_upgraded(0));

  let me = a.identity();
  let send = |seq| AppMessage {
    sender: me,
    time: 30,
    seq: seq,
    payload: vec![seq as u8],
  };
  let out = a.next_outbound(peer).unwrap();
  assert_eq!(out.seq, 1);
  assert_eq!(out.address, addr(1));
  assert!(matches!(b.receive_message(send(1), false, 30), MessageOutcome::Deliver(_)));
  assert!(matches!(b.receive_message(send(1), false, 30), MessageOutcome::Dropped));
  assert!(matches!(b.receive_message(send(3), false, 30), MessageOutcome::Violation(_)));
  assert!(matches!(b.receive_message(send(4), false, 30), MessageOutcome::Dropped));
  assert!(!b.get_status().0.contains(0));
}

#[test]
fn test_ping_round_trip_is_measured() {
  let mut cfg = ClusterConfig::with_timing(0, Duration::from_millis(100), Duration::from_millis(300));
  cfg.magic = MAGIC;
  cfg.protocol = ProtocolKind::Ping;
  let a = ConnectionSet::new(cfg.clone(), Identity::new(MAGIC, 0, 1), 0);
  cfg.id = 1;
  let b = ConnectionSet::new(cfg, Identity::new(MAGIC, 1, 1), 0);
  let sent = heartbeat_of(a.build_heartbeat(0));
  assert!(sent.pings.is_empty());
  b.receive_heartbeat(&sent, addr(0), 5);
  // b's clock is far ahead, which only the timestamp protocol would hold against it.
  let echo = heartbeat_of(b.build_heartbeat(10_000));
  assert!(echo.pings.contains(&0));
  a.receive_heartbeat(&echo, addr(1), 12);
  let next = heartbeat_of(a.build_heartbeat(100));
  assert_eq!(next.pings, OrdSet::unit(1));
  assert!(a.get_status().0.contains(1));
  assert_eq!(a.round_trip(1), Some(12));
  // Timeliness follows the local arrival at 12, not the round trip.
  a.check(312);
  assert!(a.get_status().0.contains(1));
  a.check(313);
  assert!(!a.get_status().0.contains(1));
}

#[test]
fn test_set_timing_validates() {
  let a = test_set(0);
  assert!(a
    .set_timing(Duration::from_millis(200), Duration::from_millis(100))
    .is_err());
  a.set_timing(Duration::from_millis(50), Duration::from_millis(150))
    .unwrap();
  assert_eq!(a.heartbeat_interval(), Duration::from_millis(50));
}

#[test]
fn test_terminate_is_idempotent() {
  let a = test_set(0);
  let b = test_set(1);
  a.receive_heartbeat(&heartbeat_of(b.build_heartbeat(0)), addr(1), 0);
  a.terminate();
  a.terminate();
  assert!(a.is_terminated());
  assert!(a.check(10).is_empty());
  assert!(matches!(a.connect(1, 10), Err(ConnectionError::NodeTerminated)));
}
