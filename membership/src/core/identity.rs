use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Every timestamp in this crate uses this unit.
pub type Timestamp = i64;

/// Reads the wall clock as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as Timestamp)
    .unwrap_or(0)
}

/// Uniquely names one incarnation of one node.
///
/// `magic` separates clusters sharing a network, `id` is the node number and `epoch` is taken from
/// the clock when the process starts, so a restarted node is distinguishable from its previous
/// incarnation even though it reuses the same `id`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Identity {
  pub magic: u32,
  pub id: i32,
  pub epoch: i64,
}
impl Identity {
  pub const SIZE: usize = 16;

  pub fn new(magic: u32, id: i32, epoch: i64) -> Identity {
    Identity {
      magic: magic,
      id: id,
      epoch: epoch,
    }
  }

  /// Creates an identity whose epoch is the current time.
  pub fn fresh(magic: u32, id: i32) -> Identity {
    Self::new(magic, id, now_millis())
  }

  /// Both identities belong to the same cluster.
  pub fn compatible(&self, other: &Identity) -> bool {
    self.magic == other.magic
  }

  /// Both identities name the same process lifetime of the same node.
  pub fn same_incarnation(&self, other: &Identity) -> bool {
    self.id == other.id && self.epoch == other.epoch
  }

  pub fn put(&self, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&self.magic.to_be_bytes());
    buf.extend_from_slice(&self.id.to_be_bytes());
    buf.extend_from_slice(&self.epoch.to_be_bytes());
  }
}
// Election tie-breaks compare node numbers only.
impl PartialOrd for Identity {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for Identity {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .id
      .cmp(&other.id)
      .then(self.epoch.cmp(&other.epoch))
      .then(self.magic.cmp(&other.magic))
  }
}
impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}#{}", self.id, self.epoch, self.magic)
  }
}

#[test]
fn test_identity_relations() {
  let a = Identity::new(7, 1, 100);
  let b = Identity::new(7, 1, 200);
  let c = Identity::new(8, 1, 100);
  assert!(a.compatible(&b));
  assert!(!a.compatible(&c));
  assert!(!a.same_incarnation(&b));
  assert!(a.same_incarnation(&c));
  assert!(Identity::new(7, 2, 0) > b);
}
