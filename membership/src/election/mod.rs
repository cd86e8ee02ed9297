//! Leader election within a connected component.
//!
//! Every node holds one [`Candidate`] per peer (fed from that peer's heartbeats) plus its own. An
//! election counts each member's vote, and the winner is the best candidate under
//! [`Candidate::wins_against`]. Because every node in a stable view sees the same candidates, they
//! all reach the same winner and vote for it, which reinforces it in the next round.

mod candidate;
mod leader;

#[rustfmt::skip]
pub use {
  candidate::Candidate,
  candidate::UNCOUNTED,
  leader::LeaderMgr,
};
