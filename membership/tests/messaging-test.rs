use membership::cluster::Node;
use membership::core::{ClusterConfig, ConnectionError, Identity, View};
use membership::partition::{Delivery, PartitionListener};
use membership::testkit::{
  drain, eventually, init_logging, Event, FailureConfig, MemoryNetwork, Recorder,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
  text: String,
  count: u32,
}

fn addr(id: i32) -> SocketAddr {
  SocketAddr::from(([10, 0, 1, id as u8 + 1], 5000))
}

async fn pair(net: &MemoryNetwork) -> Vec<Node> {
  let mut nodes = Vec::new();
  for id in 0..2 {
    let mut cfg =
      ClusterConfig::with_timing(id, Duration::from_millis(50), Duration::from_millis(250));
    cfg.heartbeat_targets = vec![addr(0), addr(1)];
    let transport = Arc::new(net.endpoint(addr(id)));
    nodes.push(Node::start(cfg, transport).await.unwrap());
  }
  let ready = eventually(TIMEOUT, || nodes.iter().all(|n| n.get_status().0.size() == 2)).await;
  assert!(ready);
  nodes
}

fn deliveries(events: &[Event]) -> Vec<Delivery> {
  events
    .iter()
    .filter_map(|e| match e {
      Event::Object(d) => Some(d.clone()),
      _ => None,
    })
    .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn objects_and_bytes_arrive_in_order() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = pair(&net).await;
  let (recorder, rx) = Recorder::new();
  nodes[1].register_listener(recorder);

  let conn = nodes[0].connect(1).unwrap();
  assert_eq!(conn.peer(), nodes[1].identity());
  for count in 0..5 {
    let greeting = Greeting {
      text: "hello".to_string(),
      count: count,
    };
    conn.send_object(&greeting).await.unwrap();
  }
  conn.send_bytes(vec![1, 2, 3]).await.unwrap();

  let mut events = Vec::new();
  assert!(
    eventually(TIMEOUT, || {
      events.extend(drain(&rx));
      deliveries(&events).len() == 6
    })
    .await
  );
  let got = deliveries(&events);
  for (i, d) in got[..5].iter().enumerate() {
    assert!(d.serialized);
    assert_eq!(d.sender(), nodes[0].identity());
    assert_eq!(d.message.seq, i as u64 + 1);
    assert_eq!(d.message.object::<Greeting>().unwrap().count, i as u32);
  }
  assert!(!got[5].serialized);
  assert_eq!(got[5].message.payload, vec![1, 2, 3]);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_requires_a_live_peer() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = pair(&net).await;
  assert!(matches!(nodes[0].connect(9), Err(ConnectionError::UnknownNode(9))));
  let conn = nodes[0].connect(1).unwrap();
  // A second claim hands out the same link.
  assert_eq!(nodes[0].connect(1).unwrap().peer(), conn.peer());

  nodes[0].terminate();
  assert!(matches!(nodes[0].connect(1), Err(ConnectionError::NodeTerminated)));
  assert!(matches!(
    conn.send_bytes(vec![0]).await,
    Err(ConnectionError::NodeTerminated)
  ));
  nodes[1].terminate();
}

struct Quitter {
  node: Node,
}
impl PartitionListener for Quitter {
  fn partition_notification(&self, _: &View, _: Identity) {
    self.node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminate_from_inside_a_listener() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = pair(&net).await;
  nodes[0].register_listener(Arc::new(Quitter {
    node: nodes[0].clone(),
  }));
  nodes[0].destabilize();
  assert!(eventually(TIMEOUT, || nodes[0].is_terminated()).await);
  // The survivor notices the silence.
  assert!(eventually(TIMEOUT, || nodes[1].get_status().0.size() == 1).await);
  nodes[1].terminate();
}
