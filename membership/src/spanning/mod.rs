//! A self-stabilizing spanning tree over the reachable nodes.
//!
//! Every [`TreeNode`] advertises its [`TreeState`] to its neighbours and repeatedly applies three
//! rules: turn red when the path to the root breaks, restart as a root once a red node has no
//! children left, and attach to the neighbour offering the highest root.

mod tree;

#[rustfmt::skip]
pub use {
  tree::Channel,
  tree::Color,
  tree::TreeNode,
  tree::TreeState,
};
