use crate::core::{Identity, View};
use crate::partition::{Delivery, PartitionListener};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An upcall seen by a [`Recorder`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
  Partition { view: View, leader: Identity },
  Object(Delivery),
}

/// A listener forwarding every upcall into a channel.
pub struct Recorder {
  tx: Sender<Event>,
}
impl Recorder {
  pub fn new() -> (Arc<Recorder>, Receiver<Event>) {
    let (tx, rx) = unbounded();
    (Arc::new(Recorder { tx: tx }), rx)
  }
}
impl PartitionListener for Recorder {
  fn partition_notification(&self, view: &View, leader: Identity) {
    let _ = self.tx.send(Event::Partition {
      view: view.clone(),
      leader: leader,
    });
  }

  fn object_notification(&self, delivery: &Delivery) {
    let _ = self.tx.send(Event::Object(delivery.clone()));
  }
}

/// Everything recorded so far, without waiting.
pub fn drain(rx: &Receiver<Event>) -> Vec<Event> {
  rx.try_iter().collect()
}

/// Polls `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if check() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[test]
fn test_recorder_forwards() {
  let (rec, rx) = Recorder::new();
  let view = View::singleton(1, 0);
  rec.partition_notification(&view, Identity::new(1, 1, 0));
  let events = drain(&rx);
  assert_eq!(
    events,
    vec![Event::Partition {
      view: view,
      leader: Identity::new(1, 1, 0)
    }]
  );
  assert!(drain(&rx).is_empty());
}
