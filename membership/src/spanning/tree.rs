use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Color {
  /// Attached to a live root.
  Green,
  /// The path to the root broke. Red spreads down the tree until it reaches the leaves, which then
  /// restart as their own roots.
  Red,
}

/// What a node advertises to its neighbours.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TreeState {
  pub root: i32,
  pub parent: Option<i32>,
  pub color: Color,
}

/// The last state heard from one adjacent node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Channel {
  pub peer: i32,
  pub state: TreeState,
}

/// One node of a spanning tree rooted at the highest reachable id.
#[derive(Clone, Debug)]
pub struct TreeNode {
  id: i32,
  root: i32,
  parent: Option<i32>,
  color: Color,
  adjacent: BTreeMap<i32, Channel>,
}
impl TreeNode {
  pub fn new(id: i32) -> TreeNode {
    TreeNode {
      id: id,
      root: id,
      parent: None,
      color: Color::Green,
      adjacent: BTreeMap::new(),
    }
  }

  pub fn id(&self) -> i32 {
    self.id
  }

  pub fn root(&self) -> i32 {
    self.root
  }

  pub fn parent(&self) -> Option<i32> {
    self.parent
  }

  pub fn color(&self) -> Color {
    self.color
  }

  pub fn state(&self) -> TreeState {
    TreeState {
      root: self.root,
      parent: self.parent,
      color: self.color,
    }
  }

  /// Records the latest state advertised by `peer`, adding it to the adjacent set.
  pub fn update(&mut self, peer: i32, state: TreeState) {
    if peer != self.id {
      self.adjacent.insert(peer, Channel { peer: peer, state: state });
    }
  }

  /// Drops `peer` from the adjacent set.
  pub fn remove(&mut self, peer: i32) -> Option<Channel> {
    self.adjacent.remove(&peer)
  }

  pub fn adjacent(&self) -> impl Iterator<Item = &Channel> {
    self.adjacent.values()
  }

  /// Adjacent nodes that name this node as their parent.
  pub fn children(&self) -> impl Iterator<Item = i32> + '_ {
    let id = self.id;
    self
      .adjacent
      .values()
      .filter(move |c| c.state.parent == Some(id))
      .map(|c| c.peer)
  }

  /// Turns red if the parent is red or no longer adjacent.
  pub fn color_red(&mut self) -> bool {
    let parent = match (self.color, self.parent) {
      (Color::Green, Some(parent)) => parent,
      _ => return false,
    };
    let broken = match self.adjacent.get(&parent) {
      None => true,
      Some(c) => c.state.color == Color::Red,
    };
    if broken {
      debug!("tree node {} lost its path through {}", self.id, parent);
      self.color = Color::Red;
    }
    broken
  }

  /// A red leaf leaves its parent and becomes a green root of its own.
  pub fn disown_parent(&mut self) -> bool {
    if self.color != Color::Red || self.children().next().is_some() {
      return false;
    }
    debug!("tree node {} restarts as a root", self.id);
    self.parent = None;
    self.root = self.id;
    self.color = Color::Green;
    true
  }

  /// A green node attaches to the green neighbour advertising the highest root, if that root is
  /// higher than its own. Among neighbours with equal roots the lowest id is chosen.
  pub fn merge(&mut self) -> bool {
    if self.color != Color::Green {
      return false;
    }
    let best = self
      .adjacent
      .values()
      .filter(|c| c.state.color == Color::Green)
      .fold(None::<&Channel>, |best, c| match best {
        Some(b) if b.state.root >= c.state.root => Some(b),
        _ => Some(c),
      });
    match best {
      Some(c) if c.state.root > self.root => {
        debug!("tree node {} joins root {} via {}", self.id, c.state.root, c.peer);
        self.root = c.state.root;
        self.parent = Some(c.peer);
        true
      }
      _ => false,
    }
  }

  /// One round of the protocol. Returns whether the advertised state changed.
  pub fn step(&mut self) -> bool {
    let before = self.state();
    self.color_red();
    self.disown_parent();
    self.merge();
    self.state() != before
  }
}

#[cfg(test)]
fn exchange(nodes: &mut [TreeNode], edges: &[(usize, usize)]) {
  let states = nodes.iter().map(|n| (n.id(), n.state())).collect::<Vec<_>>();
  for &(a, b) in edges {
    nodes[a].update(states[b].0, states[b].1);
    nodes[b].update(states[a].0, states[a].1);
  }
}

#[cfg(test)]
fn settle(nodes: &mut [TreeNode], edges: &[(usize, usize)]) {
  for _ in 0..20 {
    exchange(nodes, edges);
    for n in nodes.iter_mut() {
      n.step();
    }
  }
  exchange(nodes, edges);
}

#[test]
fn test_red_parent_spreads_red() {
  let mut n = TreeNode::new(1);
  let green = TreeState {
    root: 5,
    parent: None,
    color: Color::Green,
  };
  n.update(5, green);
  assert!(n.merge());
  assert_eq!(n.parent(), Some(5));
  assert!(!n.color_red());
  n.update(
    5,
    TreeState {
      color: Color::Red,
      ..green
    },
  );
  assert!(n.color_red());
  assert_eq!(n.color(), Color::Red);
}

#[test]
fn test_absent_parent_spreads_red() {
  let mut n = TreeNode::new(1);
  n.update(
    4,
    TreeState {
      root: 4,
      parent: None,
      color: Color::Green,
    },
  );
  n.merge();
  n.remove(4);
  assert!(n.color_red());
}

#[test]
fn test_red_leaf_disowns_parent() {
  let mut n = TreeNode::new(2);
  n.update(
    7,
    TreeState {
      root: 7,
      parent: None,
      color: Color::Green,
    },
  );
  n.merge();
  n.update(
    0,
    TreeState {
      root: 7,
      parent: Some(2),
      color: Color::Green,
    },
  );
  n.remove(7);
  n.color_red();
  // Still has a child.
  assert!(!n.disown_parent());
  n.update(
    0,
    TreeState {
      root: 0,
      parent: None,
      color: Color::Green,
    },
  );
  assert!(n.disown_parent());
  assert_eq!(n.state(), TreeState {
    root: 2,
    parent: None,
    color: Color::Green
  });
}

#[test]
fn test_merge_prefers_highest_green_root_then_lowest_id() {
  let mut n = TreeNode::new(0);
  let state = |root, color| TreeState {
    root: root,
    parent: None,
    color: color,
  };
  n.update(3, state(9, Color::Red));
  n.update(5, state(6, Color::Green));
  n.update(4, state(6, Color::Green));
  n.update(1, state(2, Color::Green));
  assert!(n.merge());
  assert_eq!(n.root(), 6);
  assert_eq!(n.parent(), Some(4));
  assert!(!n.merge());
}

#[test]
fn test_tree_converges_and_recovers() {
  let mut nodes = (0..4).map(TreeNode::new).collect::<Vec<_>>();
  let edges = [(0, 1), (1, 2), (2, 3)];
  settle(&mut nodes, &edges);
  assert!(nodes.iter().all(|n| n.root() == 3 && n.color() == Color::Green));
  assert_eq!(nodes[0].parent(), Some(1));
  assert_eq!(nodes[2].children().collect::<Vec<_>>(), vec![1]);

  // Node 3 disappears.
  nodes[2].remove(3);
  let survivors = &mut nodes[..3];
  settle(survivors, &edges[..2]);
  assert!(survivors.iter().all(|n| n.root() == 2 && n.color() == Color::Green));
  assert_eq!(survivors[2].parent(), None);
}
