use crate::cluster::HeartbeatProtocol;
use std::ops::{Deref, DerefMut};

/// What a peer connection is able to carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Link {
  HeartbeatOnly,
  /// Sequence numbers of the last message sent and the last message delivered.
  Message { send_seq: u64, recv_seq: u64 },
}

/// Where an inbound message sequence number falls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeqCheck {
  Deliver,
  Duplicate,
  Gap { expected: u64 },
}

/// One entry of the connection table. Upgrading to a message link happens in place, so the
/// protocol state accumulated while the link was heartbeat-only survives.
#[derive(Debug)]
pub struct Connection {
  protocol: HeartbeatProtocol,
  link: Link,
}
impl Connection {
  pub fn new(protocol: HeartbeatProtocol) -> Connection {
    Connection {
      protocol: protocol,
      link: Link::HeartbeatOnly,
    }
  }

  pub fn link(&self) -> Link {
    self.link
  }

  pub fn is_upgraded(&self) -> bool {
    matches!(self.link, Link::Message { .. })
  }

  /// Returns true if this call performed the upgrade.
  pub fn upgrade(&mut self) -> bool {
    match self.link {
      Link::HeartbeatOnly => {
        self.link = Link::Message {
          send_seq: 0,
          recv_seq: 0,
        };
        true
      }
      Link::Message { .. } => false,
    }
  }

  pub fn next_send_seq(&mut self) -> Option<u64> {
    match &mut self.link {
      Link::HeartbeatOnly => None,
      Link::Message { send_seq, .. } => {
        *send_seq += 1;
        Some(*send_seq)
      }
    }
  }

  /// Checks `seq` against the last delivered message and records it if it is the next one.
  pub fn accept_seq(&mut self, seq: u64) -> SeqCheck {
    match &mut self.link {
      Link::HeartbeatOnly => SeqCheck::Gap { expected: 1 },
      Link::Message { recv_seq, .. } => {
        if seq <= *recv_seq {
          SeqCheck::Duplicate
        } else if seq == *recv_seq + 1 {
          *recv_seq = seq;
          SeqCheck::Deliver
        } else {
          SeqCheck::Gap {
            expected: *recv_seq + 1,
          }
        }
      }
    }
  }
}
impl Deref for Connection {
  type Target = HeartbeatProtocol;

  fn deref(&self) -> &HeartbeatProtocol {
    &self.protocol
  }
}
impl DerefMut for Connection {
  fn deref_mut(&mut self) -> &mut HeartbeatProtocol {
    &mut self.protocol
  }
}

#[cfg(test)]
use crate::core::{ClusterConfig, Heartbeat, Identity, View};

#[cfg(test)]
fn connection() -> Connection {
  let sender = Identity::new(1, 3, 5);
  let hb = Heartbeat {
    sender: sender,
    sender_address: None,
    time: 10,
    view: View::singleton(3, 10),
    candidate: sender,
    preferred: false,
    msg_links: Default::default(),
    controller: None,
    order: 1,
    pings: Default::default(),
  };
  let cfg = ClusterConfig::default();
  let from = "127.0.0.1:1".parse().unwrap();
  Connection::new(HeartbeatProtocol::new(&hb, from, 10, None, &cfg))
}

#[test]
fn test_upgrade_keeps_protocol_state() {
  let mut conn = connection();
  assert_eq!(conn.next_send_seq(), None);
  assert!(conn.upgrade());
  assert!(!conn.upgrade());
  assert!(conn.is_upgraded());
  assert_eq!(conn.time(), 10);
  assert_eq!(conn.candidate().vote(), Identity::new(1, 3, 5));
  assert_eq!(conn.next_send_seq(), Some(1));
  assert_eq!(conn.next_send_seq(), Some(2));
}

#[test]
fn test_sequence_checks() {
  let mut conn = connection();
  assert_eq!(conn.accept_seq(1), SeqCheck::Gap { expected: 1 });
  conn.upgrade();
  assert_eq!(conn.accept_seq(1), SeqCheck::Deliver);
  assert_eq!(conn.accept_seq(2), SeqCheck::Deliver);
  assert_eq!(conn.accept_seq(2), SeqCheck::Duplicate);
  assert_eq!(conn.accept_seq(1), SeqCheck::Duplicate);
  assert_eq!(conn.accept_seq(4), SeqCheck::Gap { expected: 3 });
  assert_eq!(conn.link(), Link::Message { send_seq: 0, recv_seq: 2 });
}
