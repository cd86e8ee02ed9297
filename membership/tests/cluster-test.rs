use im::{ordset, OrdSet};
use membership::cluster::Node;
use membership::core::{ClusterConfig, SecurityConfig, Transport, UdpTransport};
use membership::partition::PartitionListener;
use membership::testkit::{drain, eventually, init_logging, Event, FailureConfig, MemoryNetwork, Recorder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::block_on;

const TIMEOUT: Duration = Duration::from_secs(10);

fn addr(id: i32) -> SocketAddr {
  SocketAddr::from(([10, 0, 0, id as u8 + 1], 4000))
}

fn config(id: i32, n: i32) -> ClusterConfig {
  let mut cfg = ClusterConfig::with_timing(id, Duration::from_millis(50), Duration::from_millis(250));
  cfg.heartbeat_targets = (0..n).map(addr).collect();
  cfg
}

async fn start(net: &MemoryNetwork, configs: Vec<ClusterConfig>) -> Vec<Node> {
  let mut nodes = Vec::new();
  for cfg in configs {
    let transport = Arc::new(net.endpoint(addr(cfg.id)));
    nodes.push(Node::start(cfg, transport).await.unwrap());
  }
  nodes
}

fn converged(nodes: &[&Node], members: &[i32], leader: i32) -> bool {
  nodes.iter().all(|n| {
    let (view, l) = n.get_status();
    view.is_stable() && view.members().iter().copied().eq(members.iter().copied()) && l.id == leader
  })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_the_highest_id() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = start(&net, (0..3).map(|i| config(i, 3)).collect()).await;
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_node_leaves_the_view() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = start(&net, (0..3).map(|i| config(i, 3)).collect()).await;
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);

  nodes[2].terminate();
  nodes[2].terminate();
  let rest = nodes[..2].iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&rest, &[0, 1], 1)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_and_heal() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = start(&net, (0..3).map(|i| config(i, 3)).collect()).await;
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);

  net.partition(&[addr(0), addr(1)], &[addr(2)]);
  let majority = nodes[..2].iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&majority, &[0, 1], 1)).await);
  assert!(eventually(TIMEOUT, || converged(&[&nodes[2]], &[2], 2)).await);

  net.heal();
  // Votes carry over, so the majority's leader outlives the merge.
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 1)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listeners_see_transitions() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = start(&net, (0..2).map(|i| config(i, 2)).collect()).await;
  let (recorder, rx) = Recorder::new();
  nodes[0].register_listener(recorder.clone());
  let mut events = Vec::new();
  let seen_stable = eventually(TIMEOUT, || {
    events.extend(drain(&rx));
    events.iter().any(|e| match e {
      Event::Partition { view, leader } => view.is_stable() && view.size() == 2 && leader.id == 1,
      _ => false,
    })
  })
  .await;
  assert!(seen_stable, "{:?}", events);

  let handle: Arc<dyn PartitionListener> = recorder;
  assert!(nodes[0].deregister_listener(&handle));
  nodes[0].destabilize();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(drain(&rx).is_empty());
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ignoring_simulates_a_partition() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let nodes = start(&net, (0..3).map(|i| config(i, 3)).collect()).await;
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);

  nodes[0].set_ignoring(ordset![2]);
  assert!(eventually(TIMEOUT, || !nodes[0].get_status().0.contains(2)).await);
  nodes[0].set_ignoring(OrdSet::new());
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lossy_network_still_converges() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig {
    drop_prob: 0.1,
    delay: Some((Duration::from_millis(0), Duration::from_millis(5))),
  });
  let nodes = start(&net, (0..3).map(|i| config(i, 3)).collect()).await;
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 2)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_keys_split_the_cluster() {
  init_logging();
  let net = MemoryNetwork::new(FailureConfig::default());
  let keyed = |id, key: &[u8]| {
    let mut cfg = config(id, 3);
    cfg.security = Some(SecurityConfig {
      key: key.to_vec(),
      last_key: None,
      default_key: None,
    });
    cfg
  };
  let nodes = start(&net, vec![keyed(0, b"alpha"), keyed(1, b"alpha"), keyed(2, b"beta")]).await;
  let pair = nodes[..2].iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&pair, &[0, 1], 1)).await);
  assert!(!nodes[2].get_status().0.contains(0));

  // The outsider adopts the shared key and is admitted.
  nodes[2].rotate_key(b"alpha".to_vec());
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1, 2], 1)).await);
  for node in nodes {
    node.terminate();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_nodes_find_each_other() {
  init_logging();
  let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
  let transports = vec![
    UdpTransport::bind(local).await.unwrap(),
    UdpTransport::bind(local).await.unwrap(),
  ];
  let targets = transports.iter().map(|t| t.local_addr()).collect::<Vec<_>>();
  let mut nodes = Vec::new();
  for (id, transport) in transports.into_iter().enumerate() {
    let mut cfg = config(id as i32, 0);
    cfg.heartbeat_targets = targets.clone();
    nodes.push(Node::start(cfg, Arc::new(transport)).await.unwrap());
  }
  let all = nodes.iter().collect::<Vec<_>>();
  assert!(eventually(TIMEOUT, || converged(&all, &[0, 1], 1)).await);
  for node in nodes {
    node.terminate();
    // The port is free as soon as terminate returns.
    let rebound = UdpTransport::bind(node.local_addr()).await;
    assert!(rebound.is_ok(), "{:?}", rebound.err());
  }
}

#[test]
fn invalid_configuration_is_rejected() {
  block_on(async {
    let net = MemoryNetwork::new(FailureConfig::default());
    let mut cfg = config(0, 1);
    cfg.timeout = cfg.heartbeat_interval;
    assert!(Node::start(cfg, Arc::new(net.endpoint(addr(0)))).await.is_err());

    let node = start(&net, vec![config(1, 2)]).await.remove(0);
    assert!(node
      .set_timing(Duration::from_millis(100), Duration::from_millis(50))
      .is_err());
    assert!(node
      .set_timing(Duration::from_millis(20), Duration::from_millis(100))
      .is_ok());
    node.terminate();
  });
}
