use crate::cluster::{ConnectionSet, MessageOutcome, Notification};
use crate::core::{
  now_millis, AppMessage, ClusterConfig, ConfigError, ConnectionError, Identity, Packet, Security,
  Timestamp, Transport, View,
};
use crate::partition::{Delivery, PartitionListener, PartitionManager};
use im::OrdSet;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

enum Upcall {
  Partition(Notification),
  Object(Delivery),
}

struct NodeInner {
  identity: Identity,
  magic: u32,
  cs: ConnectionSet,
  pm: Arc<PartitionManager>,
  transport: Arc<dyn Transport>,
  security: RwLock<Security>,
  upcalls: mpsc::UnboundedSender<Upcall>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  terminated: AtomicBool,
}

/// A running cluster member.
///
/// Cloning a `Node` gives another handle to the same member. Starting one spawns four tasks on the
/// current tokio runtime: the receive loop, the heartbeat sender, the periodic sweep and the upcall
/// dispatcher. Listener code runs on the blocking pool, never under the membership lock.
#[derive(Clone)]
pub struct Node {
  inner: Arc<NodeInner>,
}
impl Node {
  /// Validates `config` and starts the member on `transport`.
  pub async fn start(
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
  ) -> Result<Node, ConfigError> {
    config.validate()?;
    let identity = Identity::fresh(config.magic, config.id);
    let cs = ConnectionSet::new(config.clone(), identity, now_millis());
    cs.set_address(transport.local_addr());
    let (tx, rx) = mpsc::unbounded_channel();
    let node = Node {
      inner: Arc::new(NodeInner {
        identity: identity,
        magic: config.magic,
        cs: cs,
        pm: Arc::new(PartitionManager::new(config.upcall_timeout)),
        transport: transport,
        security: RwLock::new(Security::from_config(config.security.as_ref())),
        upcalls: tx,
        tasks: Mutex::new(Vec::new()),
        terminated: AtomicBool::new(false),
      }),
    };
    let tasks = vec![
      tokio::spawn(receive_loop(node.inner.clone())),
      tokio::spawn(heartbeat_loop(node.inner.clone())),
      tokio::spawn(sweep_loop(node.inner.clone())),
      tokio::spawn(dispatch_loop(node.inner.pm.clone(), rx)),
    ];
    if let Ok(mut t) = node.inner.tasks.lock() {
      t.extend(tasks);
    }
    info!("started {} on {}", identity, node.local_addr());
    Ok(node)
  }

  pub fn identity(&self) -> Identity {
    self.inner.identity
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.inner.transport.local_addr()
  }

  pub fn register_listener(&self, listener: Arc<dyn PartitionListener>) {
    self.inner.pm.register(listener);
  }

  pub fn deregister_listener(&self, listener: &Arc<dyn PartitionListener>) -> bool {
    self.inner.pm.deregister(listener)
  }

  /// Opens a message connection to node `id`, which must currently be a live peer.
  pub fn connect(&self, id: i32) -> Result<MessageConnection, ConnectionError> {
    self.check_alive()?;
    let peer = self.inner.cs.connect(id, now_millis())?;
    Ok(MessageConnection {
      peer: peer,
      node: self.clone(),
    })
  }

  /// The current view and its leader.
  pub fn get_status(&self) -> (View, Identity) {
    self.inner.cs.get_status()
  }

  /// Forces a new election once the view stabilizes again.
  pub fn destabilize(&self) {
    let notes = self.inner.cs.destabilize(now_millis());
    self.inner.dispatch(notes);
  }

  /// Drops heartbeats from `ids` at ingress. Used to simulate partitions.
  pub fn set_ignoring(&self, ids: OrdSet<i32>) {
    self.inner.cs.set_ignoring(ids);
  }

  /// Changes the heartbeat cadence. The sender picks it up after its current sleep.
  pub fn set_timing(&self, interval: Duration, timeout: Duration) -> Result<(), ConfigError> {
    self.inner.cs.set_timing(interval, timeout)
  }

  /// Makes `key` the current authentication key. The previous key stays valid until the next
  /// rotation.
  pub fn rotate_key(&self, key: Vec<u8>) {
    if let Ok(mut security) = self.inner.security.write() {
      security.rotate(key);
      info!("rotated authentication key");
    }
  }

  /// Stops every task and upcall and closes the transport. Safe to call more than once, and from
  /// inside a listener.
  pub fn terminate(&self) {
    if self.inner.terminated.swap(true, Ordering::SeqCst) {
      return;
    }
    self.inner.pm.terminate();
    self.inner.cs.terminate();
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
    self.inner.transport.close();
    info!("terminated {}", self.inner.identity);
  }

  pub fn is_terminated(&self) -> bool {
    self.inner.terminated.load(Ordering::SeqCst)
  }

  fn check_alive(&self) -> Result<(), ConnectionError> {
    if self.is_terminated() {
      Err(ConnectionError::NodeTerminated)
    } else {
      Ok(())
    }
  }
}

/// Sends application messages to one peer incarnation.
///
/// Messages are numbered per link and the receiver delivers them in order, so the link should run
/// over a transport that neither drops nor reorders, such as
/// [`TcpTransport`](crate::core::TcpTransport).
#[derive(Clone)]
pub struct MessageConnection {
  peer: Identity,
  node: Node,
}
impl MessageConnection {
  pub fn peer(&self) -> Identity {
    self.peer
  }

  pub async fn send_bytes(&self, payload: Vec<u8>) -> Result<(), ConnectionError> {
    self.send(payload, false).await
  }

  /// Sends `item` in a CBOR envelope, to be read back with [`AppMessage::object`].
  pub async fn send_object<T: Serialize>(&self, item: &T) -> Result<(), ConnectionError> {
    self.send(serde_cbor::to_vec(item)?, true).await
  }

  async fn send(&self, payload: Vec<u8>, serialized: bool) -> Result<(), ConnectionError> {
    self.node.check_alive()?;
    let inner = &self.node.inner;
    let out = inner.cs.next_outbound(self.peer)?;
    let message = AppMessage {
      sender: out.sender,
      time: now_millis(),
      seq: out.seq,
      payload: payload,
    };
    let packet = if serialized {
      Packet::Serialized(message)
    } else {
      Packet::Message(message)
    };
    inner.send(&packet, out.address).await?;
    Ok(())
  }
}

impl NodeInner {
  fn seal(&self, packet: &Packet) -> Vec<u8> {
    let bytes = packet.encode();
    match self.security.read() {
      Ok(security) => security.seal(bytes),
      Err(_) => bytes,
    }
  }

  async fn send(&self, packet: &Packet, to: SocketAddr) -> io::Result<()> {
    let bytes = self.seal(packet);
    self.transport.send(&bytes, to).await
  }

  fn dispatch(&self, notes: Vec<Notification>) {
    for note in notes {
      let _ = self.upcalls.send(Upcall::Partition(note));
    }
  }

  fn handle(&self, bytes: &[u8], from: SocketAddr) {
    let packet = {
      let security = match self.security.read() {
        Ok(security) => security,
        Err(_) => return,
      };
      match security
        .open(bytes)
        .and_then(|payload| Packet::decode(payload, self.magic))
      {
        Ok(packet) => packet,
        Err(e) => {
          debug!("dropping {} bytes from {}: {}", bytes.len(), from, e);
          return;
        }
      }
    };
    let now = now_millis();
    match packet {
      Packet::Heartbeat(hb) | Packet::PingHeartbeat(hb) => {
        let notes = self.cs.receive_heartbeat(&hb, from, now);
        self.dispatch(notes);
      }
      Packet::Message(msg) => self.deliver(msg, false, now),
      Packet::Serialized(msg) => self.deliver(msg, true, now),
    }
  }

  fn deliver(&self, msg: AppMessage, serialized: bool, now: Timestamp) {
    match self.cs.receive_message(msg, serialized, now) {
      MessageOutcome::Deliver(delivery) => {
        let _ = self.upcalls.send(Upcall::Object(delivery));
      }
      MessageOutcome::Dropped => {}
      MessageOutcome::Violation(notes) => self.dispatch(notes),
    }
  }
}

async fn receive_loop(node: Arc<NodeInner>) {
  loop {
    match node.transport.recv().await {
      Ok((bytes, from)) => node.handle(&bytes, from),
      Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
        warn!("transport closed: {}", e);
        break;
      }
      Err(e) => warn!("receive failed: {}", e),
    }
  }
}

async fn heartbeat_loop(node: Arc<NodeInner>) {
  loop {
    let packet = node.cs.build_heartbeat(now_millis());
    let bytes = node.seal(&packet);
    for target in node.cs.heartbeat_targets() {
      trace!("heartbeat to {}", target);
      if let Err(e) = node.transport.send(&bytes, target).await {
        warn!("heartbeat to {} failed: {}", target, e);
      }
    }
    tokio::time::sleep(node.cs.heartbeat_interval()).await;
  }
}

async fn sweep_loop(node: Arc<NodeInner>) {
  loop {
    tokio::time::sleep(node.cs.check_period()).await;
    let notes = node.cs.check(now_millis());
    node.dispatch(notes);
  }
}

async fn dispatch_loop(pm: Arc<PartitionManager>, mut rx: mpsc::UnboundedReceiver<Upcall>) {
  while let Some(upcall) = rx.recv().await {
    let pm = pm.clone();
    let done = tokio::task::spawn_blocking(move || match upcall {
      Upcall::Partition(note) => pm.notify(&note.view, note.leader),
      Upcall::Object(delivery) => pm.receive_object(&delivery),
    });
    if let Err(e) = done.await {
      warn!("upcall task failed: {}", e);
    }
  }
}
