use crate::core::Timestamp;
use im::OrdSet;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An immutable snapshot of the nodes one member considers reachable.
///
/// Views are never mutated in place. Every change produces a new value, and holders replace their
/// stored copy. Cloning is cheap because the member set is a persistent [`im::OrdSet`].
///
/// Two views with identical members but different `view_number`s are distinct: the number changes
/// every time the sender's membership changes, so a member that left and came back between two
/// observations is still noticed.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct View {
  members: OrdSet<i32>,
  stable: bool,
  timestamp: Timestamp,
  view_number: u64,
}
impl View {
  pub fn new(members: OrdSet<i32>, stable: bool, timestamp: Timestamp, view_number: u64) -> View {
    View {
      members: members,
      stable: stable,
      timestamp: timestamp,
      view_number: view_number,
    }
  }

  /// A view containing only `id`, as every node starts out.
  pub fn singleton(id: i32, timestamp: Timestamp) -> View {
    Self::new(OrdSet::unit(id), false, timestamp, 0)
  }

  pub fn members(&self) -> &OrdSet<i32> {
    &self.members
  }

  pub fn contains(&self, id: i32) -> bool {
    self.members.contains(&id)
  }

  pub fn size(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn is_stable(&self) -> bool {
    self.stable
  }

  pub fn timestamp(&self) -> Timestamp {
    self.timestamp
  }

  pub fn view_number(&self) -> u64 {
    self.view_number
  }

  pub fn with_stable(&self, stable: bool) -> View {
    View {
      stable: stable,
      ..self.clone()
    }
  }

  pub fn with_timestamp(&self, timestamp: Timestamp) -> View {
    View {
      timestamp: timestamp,
      ..self.clone()
    }
  }

  /// Same members and stability.
  pub fn same_content(&self, other: &View) -> bool {
    self.members == other.members && self.stable == other.stable
  }

  pub fn same_members(&self, other: &View) -> bool {
    self.members == other.members
  }

  pub fn union(&self, other: &View) -> OrdSet<i32> {
    self.members.clone().union(other.members.clone())
  }

  pub fn intersection(&self, other: &View) -> OrdSet<i32> {
    self.members.clone().intersection(other.members.clone())
  }

  pub fn is_subset(&self, other: &View) -> bool {
    self.members.is_subset(&other.members)
  }

  /// Whether the two views share at least one member.
  pub fn overlap(&self, other: &View) -> bool {
    self.members.iter().any(|m| other.members.contains(m))
  }
}
impl fmt::Display for View {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{{{}}}{} #{}",
      self.members.iter().join(", "),
      if self.stable { " stable" } else { "" },
      self.view_number
    )
  }
}

#[cfg(test)]
use im::ordset;

#[test]
fn test_view_algebra() {
  let a = View::new(ordset![0, 1, 2], true, 10, 3);
  let b = View::new(ordset![2, 3], false, 11, 1);
  let c = View::new(ordset![0, 1], false, 12, 4);
  assert_eq!(a.union(&b), ordset![0, 1, 2, 3]);
  assert_eq!(a.intersection(&b), ordset![2]);
  assert!(c.is_subset(&a));
  assert!(!a.is_subset(&c));
  assert!(a.overlap(&b));
  assert!(!b.overlap(&c));
  assert_eq!(a.to_string(), "{0, 1, 2} stable #3");
}

#[test]
fn test_view_replacement_keeps_original() {
  let a = View::new(ordset![4, 5], false, 10, 1);
  let b = a.with_stable(true);
  assert!(!a.is_stable());
  assert!(b.is_stable());
  assert!(a.same_members(&b));
  assert!(!a.same_content(&b));
  assert_ne!(a, a.with_timestamp(11));
}
