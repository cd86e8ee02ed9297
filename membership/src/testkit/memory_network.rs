use crate::core::{closed_error, Closer, Transport};
use crate::testkit::{FailureConfig, FailureConfigMap};
use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

struct Shared {
  inboxes: HashMap<SocketAddr, (u64, Inbox)>,
  generation: u64,
  failures: FailureConfigMap,
  blocked: HashSet<(SocketAddr, SocketAddr)>,
  rng: SmallRng,
}

/// An in-process network for tests. Endpoints exchange packets through channels, subject to the
/// configured loss, delay and partitions.
#[derive(Clone)]
pub struct MemoryNetwork {
  shared: Arc<Mutex<Shared>>,
}
impl MemoryNetwork {
  pub fn new(cluster_wide: FailureConfig) -> MemoryNetwork {
    Self::seeded(cluster_wide, rand::random())
  }

  pub fn seeded(cluster_wide: FailureConfig, seed: u64) -> MemoryNetwork {
    MemoryNetwork {
      shared: Arc::new(Mutex::new(Shared {
        inboxes: HashMap::new(),
        generation: 0,
        failures: FailureConfigMap {
          cluster_wide: cluster_wide,
          node_wide: Default::default(),
        },
        blocked: HashSet::new(),
        rng: SmallRng::seed_from_u64(seed),
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Shared> {
    self.shared.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Attaches an endpoint at `addr`, replacing any previous endpoint there.
  pub fn endpoint(&self, addr: SocketAddr) -> MemoryTransport {
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = {
      let mut shared = self.lock();
      shared.generation += 1;
      let generation = shared.generation;
      shared.inboxes.insert(addr, (generation, tx));
      generation
    };
    MemoryTransport {
      addr: addr,
      generation: generation,
      network: self.clone(),
      inbox: tokio::sync::Mutex::new(rx),
      closer: Closer::default(),
    }
  }

  /// Faults for packets sent to `dest`.
  pub fn set_failure(&self, dest: SocketAddr, config: FailureConfig) {
    self.lock().failures.node_wide.insert(dest, config);
  }

  /// Cuts every link between a member of `a` and a member of `b`, in both directions.
  pub fn partition(&self, a: &[SocketAddr], b: &[SocketAddr]) {
    let mut shared = self.lock();
    for x in a {
      for y in b {
        shared.blocked.insert((*x, *y));
        shared.blocked.insert((*y, *x));
      }
    }
  }

  /// Cuts `addr` off from everyone.
  pub fn isolate(&self, addr: SocketAddr) {
    let others = self
      .lock()
      .inboxes
      .keys()
      .copied()
      .filter(|a| *a != addr)
      .collect::<Vec<_>>();
    self.partition(&[addr], &others);
  }

  /// Restores every cut link.
  pub fn heal(&self) {
    self.lock().blocked.clear();
  }

  fn route(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
    let (inbox, delay) = {
      let mut guard = self.lock();
      let shared = &mut *guard;
      if shared.blocked.contains(&(from, to)) {
        trace!("{} -> {} is partitioned", from, to);
        return;
      }
      let config = *shared.failures.get(&to);
      if config.should_drop(&mut shared.rng) {
        trace!("dropped packet {} -> {}", from, to);
        return;
      }
      let delay = config.sample_delay(&mut shared.rng);
      match shared.inboxes.get(&to) {
        Some((_, inbox)) => (inbox.clone(), delay),
        None => return,
      }
    };
    match delay {
      Some(delay) => {
        tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          let _ = inbox.send((bytes, from));
        });
      }
      None => {
        let _ = inbox.send((bytes, from));
      }
    }
  }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
  addr: SocketAddr,
  generation: u64,
  network: MemoryNetwork,
  inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
  closer: Closer,
}
impl MemoryTransport {
  fn detach(&self) {
    let mut shared = self.network.lock();
    // Only detach if the address was not taken over by a newer endpoint.
    if shared.inboxes.get(&self.addr).map(|(g, _)| *g) == Some(self.generation) {
      shared.inboxes.remove(&self.addr);
    }
  }
}
#[async_trait]
impl Transport for MemoryTransport {
  async fn send(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
    if self.closer.is_closed() {
      return Err(closed_error());
    }
    self.network.route(self.addr, to, bytes.to_vec());
    Ok(())
  }

  async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
    let receiving = async {
      self
        .inbox
        .lock()
        .await
        .recv()
        .await
        .ok_or_else(closed_error)
    };
    self.closer.guard(receiving).await
  }

  fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  fn close(&self) {
    if self.closer.close() {
      self.detach();
    }
  }
}
impl Drop for MemoryTransport {
  fn drop(&mut self) {
    self.detach();
  }
}

#[cfg(test)]
fn addr(i: u8) -> SocketAddr {
  SocketAddr::from(([10, 0, 0, i], 4000))
}

#[tokio::test]
async fn test_memory_network_routes() {
  let net = MemoryNetwork::seeded(FailureConfig::default(), 1);
  let a = net.endpoint(addr(1));
  let b = net.endpoint(addr(2));
  a.send(b"hello", addr(2)).await.unwrap();
  assert_eq!(b.recv().await.unwrap(), (b"hello".to_vec(), addr(1)));
  // Nobody listens here.
  a.send(b"void", addr(9)).await.unwrap();
}

#[tokio::test]
async fn test_memory_network_partitions() {
  let net = MemoryNetwork::seeded(FailureConfig::default(), 1);
  let a = net.endpoint(addr(1));
  let b = net.endpoint(addr(2));
  net.partition(&[addr(1)], &[addr(2)]);
  a.send(b"lost", addr(2)).await.unwrap();
  b.send(b"lost", addr(1)).await.unwrap();
  net.heal();
  a.send(b"found", addr(2)).await.unwrap();
  assert_eq!(b.recv().await.unwrap().0, b"found".to_vec());
  net.set_failure(addr(2), FailureConfig::lossy(1.0));
  a.send(b"dropped", addr(2)).await.unwrap();
  b.send(b"kept", addr(1)).await.unwrap();
  assert_eq!(a.recv().await.unwrap().0, b"kept".to_vec());
}

#[tokio::test]
async fn test_closed_endpoint_detaches() {
  let net = MemoryNetwork::seeded(FailureConfig::default(), 1);
  let a = net.endpoint(addr(1));
  let b = net.endpoint(addr(2));
  b.close();
  assert!(b.send(b"late", addr(1)).await.is_err());
  assert!(b.recv().await.is_err());
  a.send(b"nobody", addr(2)).await.unwrap();
  let c = net.endpoint(addr(2));
  a.send(b"again", addr(2)).await.unwrap();
  assert_eq!(c.recv().await.unwrap().0, b"again".to_vec());
}
