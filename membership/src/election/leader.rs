use crate::core::{Identity, View};
use crate::election::Candidate;
use tracing::{debug, info};

/// Runs leader elections over a pool of [`Candidate`]s.
///
/// A stable view gets a full election and the local node switches its vote to the winner. While
/// the view is unstable the local node keeps its previous vote as long as that node is still in
/// the view, so leadership does not thrash during membership churn.
#[derive(Debug, Default)]
pub struct LeaderMgr {
  leader: Option<Identity>,
}
impl LeaderMgr {
  pub fn new() -> LeaderMgr {
    LeaderMgr { leader: None }
  }

  pub fn leader(&self) -> Option<Identity> {
    self.leader
  }

  /// Counts the votes of every candidate in `view` and returns the winner. Tallies are reset
  /// first, so repeated calls give the same result.
  pub fn election(view: &View, pool: &mut [&mut Candidate]) -> Option<Identity> {
    for c in pool.iter_mut() {
      c.clear_received_votes();
    }
    pool.sort_by_key(|c| c.id());
    let mut best: Option<usize> = None;
    for i in 0..pool.len() {
      if !view.contains(pool[i].id().id) {
        continue;
      }
      if best.map(|b| pool[i].wins_against(&*pool[b])).unwrap_or(true) {
        best = Some(i);
      }
      let vote = pool[i].vote();
      if !view.contains(vote.id) {
        continue;
      }
      match pool.iter().position(|c| c.id().id == vote.id) {
        None => debug!("{} votes for {}, which has no connection", pool[i].id(), vote),
        Some(j) => {
          pool[j].receive_vote();
          if best.map(|b| b != j && pool[j].wins_against(&*pool[b])).unwrap_or(true) {
            best = Some(j);
          }
        }
      }
    }
    best.map(|b| pool[b].id())
  }

  /// Elects a leader for `view` and records it. `local` is the local node's candidate, `peers`
  /// holds one candidate per remote connection.
  pub fn elect_leader(
    &mut self,
    view: &View,
    local: &mut Candidate,
    peers: Vec<&mut Candidate>,
  ) -> Identity {
    if !view.contains(local.vote().id) {
      local.set_vote(local.id());
    }
    let leader = if view.is_stable() {
      let winner = {
        let mut pool = Vec::with_capacity(peers.len() + 1);
        pool.push(&mut *local);
        pool.extend(peers);
        Self::election(view, &mut pool)
      };
      let winner = winner.unwrap_or_else(|| local.id());
      local.set_vote(winner);
      winner
    } else {
      local.vote()
    };
    if self.leader != Some(leader) {
      info!("leader for {} is now {}", view, leader);
      self.leader = Some(leader);
    }
    leader
  }

  /// The leader a stable election would pick now, without changing any vote.
  pub fn predict_leader(view: &View, local: &mut Candidate, peers: Vec<&mut Candidate>) -> Identity {
    let fallback = local.id();
    let mut pool = Vec::with_capacity(peers.len() + 1);
    pool.push(local);
    pool.extend(peers);
    Self::election(view, &mut pool).unwrap_or(fallback)
  }
}

#[cfg(test)]
use im::ordset;

#[cfg(test)]
fn ident(id: i32) -> Identity {
  Identity::new(1, id, 0)
}

#[test]
fn test_equal_tallies_elect_highest_id() {
  let view = View::new(ordset![0, 1, 2], true, 0, 1);
  let mut c = (0..3)
    .map(|i| Candidate::solo(ident(i), false))
    .collect::<Vec<_>>();
  let mut pool = c.iter_mut().collect::<Vec<_>>();
  assert_eq!(LeaderMgr::election(&view, &mut pool), Some(ident(2)));
}

#[test]
fn test_election_is_repeatable() {
  let view = View::new(ordset![0, 1, 2, 3], true, 0, 1);
  let mut c = vec![
    Candidate::new(ident(3), ident(1), false),
    Candidate::new(ident(0), ident(1), false),
    Candidate::new(ident(1), ident(2), false),
    Candidate::new(ident(2), ident(2), false),
  ];
  let first = LeaderMgr::election(&view, &mut c.iter_mut().collect::<Vec<_>>());
  let votes = c.iter().map(|c| (c.id(), c.vote())).collect::<Vec<_>>();
  for _ in 0..5 {
    assert_eq!(LeaderMgr::election(&view, &mut c.iter_mut().collect::<Vec<_>>()), first);
  }
  assert_eq!(c.iter().map(|c| (c.id(), c.vote())).collect::<Vec<_>>(), votes);
  // 1 and 2 both have two votes, 2 has the higher id.
  assert_eq!(first, Some(ident(2)));
}

#[test]
fn test_unanimous_vote_wins() {
  let view = View::new(ordset![0, 1, 2, 3, 4], true, 0, 1);
  for target in 0..5 {
    let mut c = (0..5)
      .map(|i| Candidate::new(ident(i), ident(target), false))
      .collect::<Vec<_>>();
    let (local, peers) = c.split_at_mut(1);
    let mut mgr = LeaderMgr::new();
    let leader = mgr.elect_leader(&view, &mut local[0], peers.iter_mut().collect());
    assert_eq!(leader, ident(target));
    assert_eq!(mgr.leader(), Some(ident(target)));
  }
}

#[test]
fn test_votes_outside_view_do_not_count() {
  let view = View::new(ordset![0, 1], true, 0, 1);
  let mut c = vec![
    Candidate::new(ident(0), ident(0), false),
    Candidate::new(ident(1), ident(7), false),
    Candidate::new(ident(7), ident(7), false),
  ];
  let mut pool = c.iter_mut().collect::<Vec<_>>();
  assert_eq!(LeaderMgr::election(&view, &mut pool), Some(ident(0)));
}

#[test]
fn test_unstable_election_keeps_vote() {
  let unstable = View::new(ordset![0, 1, 2], false, 0, 1);
  let mut local = Candidate::new(ident(0), ident(1), false);
  let mut peers = vec![Candidate::solo(ident(1), false), Candidate::solo(ident(2), false)];
  let mut mgr = LeaderMgr::new();
  let leader = mgr.elect_leader(&unstable, &mut local, peers.iter_mut().collect());
  assert_eq!(leader, ident(1));
  // The previous choice left the view: fall back to self.
  let shrunk = View::new(ordset![0, 2], false, 0, 2);
  let leader = mgr.elect_leader(&shrunk, &mut local, peers.iter_mut().collect());
  assert_eq!(leader, ident(0));
  assert_eq!(local.vote(), ident(0));
  // Prediction does not touch the vote.
  let predicted = LeaderMgr::predict_leader(&shrunk, &mut local, peers.iter_mut().collect());
  assert_eq!(predicted, ident(2));
  assert_eq!(local.vote(), ident(0));
}
