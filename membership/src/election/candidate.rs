use crate::core::Identity;
use std::cmp::Ordering;

/// Tally value meaning "not counted in this election round".
pub const UNCOUNTED: i32 = -1;

/// A node's ballot state: who it is, who it votes for, whether it is preferred, and how many
/// votes it received in the current round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
  id: Identity,
  vote: Identity,
  preferred: bool,
  received_vote_count: i32,
}
impl Candidate {
  pub fn new(id: Identity, vote: Identity, preferred: bool) -> Candidate {
    Candidate {
      id: id,
      vote: vote,
      preferred: preferred,
      received_vote_count: UNCOUNTED,
    }
  }

  /// A candidate voting for itself.
  pub fn solo(id: Identity, preferred: bool) -> Candidate {
    Self::new(id, id, preferred)
  }

  pub fn id(&self) -> Identity {
    self.id
  }

  pub fn vote(&self) -> Identity {
    self.vote
  }

  pub fn set_vote(&mut self, vote: Identity) {
    self.vote = vote;
  }

  pub fn is_preferred(&self) -> bool {
    self.preferred
  }

  pub fn set_preferred(&mut self, preferred: bool) {
    self.preferred = preferred;
  }

  pub fn received_vote_count(&self) -> i32 {
    self.received_vote_count
  }

  pub fn clear_received_votes(&mut self) {
    self.received_vote_count = UNCOUNTED;
  }

  pub fn receive_vote(&mut self) {
    self.received_vote_count = self.received_vote_count.max(0) + 1;
  }

  /// Election order: preferred first, then most votes, then highest id. Distinct identities never
  /// tie.
  pub fn wins_against(&self, other: &Candidate) -> bool {
    self.rank(other) == Ordering::Greater
  }

  fn rank(&self, other: &Candidate) -> Ordering {
    self
      .preferred
      .cmp(&other.preferred)
      .then(self.received_vote_count.cmp(&other.received_vote_count))
      .then(self.id.cmp(&other.id))
  }
}

#[cfg(test)]
fn cand(id: i32, preferred: bool, votes: i32) -> Candidate {
  let mut c = Candidate::solo(Identity::new(1, id, 0), preferred);
  for _ in 0..votes {
    c.receive_vote();
  }
  c
}

#[test]
fn test_preferred_dominates_votes() {
  for votes in 0..50 {
    let preferred = cand(0, true, 0);
    let popular = cand(9, false, votes);
    assert!(preferred.wins_against(&popular));
    assert!(!popular.wins_against(&preferred));
  }
}

#[test]
fn test_votes_then_id() {
  assert!(cand(1, false, 3).wins_against(&cand(5, false, 2)));
  assert!(cand(5, false, 2).wins_against(&cand(1, false, 2)));
  assert!(!cand(1, false, 2).wins_against(&cand(5, false, 2)));
  assert!(!cand(4, false, 1).wins_against(&cand(4, false, 1)));
}

#[test]
fn test_tally_lifecycle() {
  let mut c = cand(2, false, 0);
  assert_eq!(c.received_vote_count(), UNCOUNTED);
  c.receive_vote();
  c.receive_vote();
  assert_eq!(c.received_vote_count(), 2);
  c.clear_received_votes();
  assert_eq!(c.received_vote_count(), UNCOUNTED);
}
