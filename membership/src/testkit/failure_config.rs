use im::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Faults injected into packets sent over a [`MemoryNetwork`](crate::testkit::MemoryNetwork).
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a packet is lost.
  pub drop_prob: f64,
  /// Every surviving packet is held back for a uniformly chosen time within this range. Delayed
  /// packets may overtake each other.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn lossy(drop_prob: f64) -> FailureConfig {
    FailureConfig {
      drop_prob: drop_prob,
      delay: None,
    }
  }

  pub fn should_drop<R: Rng>(&self, rng: &mut R) -> bool {
    self.drop_prob > 0.0 && rng.gen::<f64>() < self.drop_prob
  }

  pub fn sample_delay<R: Rng>(&self, rng: &mut R) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      let range = min.as_millis()..=max.as_millis().max(min.as_millis());
      Duration::from_millis(rng.gen_range(range) as u64)
    })
  }
}

/// Per destination overrides on top of a cluster wide [`FailureConfig`].
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<SocketAddr, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, dest: &SocketAddr) -> &FailureConfig {
    self.node_wide.get(dest).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_config_sampling() {
  use rand::rngs::SmallRng;
  use rand::SeedableRng;
  let mut rng = SmallRng::seed_from_u64(3);
  let none = FailureConfig::default();
  assert!((0..100).all(|_| !none.should_drop(&mut rng)));
  assert_eq!(none.sample_delay(&mut rng), None);
  let all = FailureConfig::lossy(1.0);
  assert!((0..100).all(|_| all.should_drop(&mut rng)));
  let slow = FailureConfig {
    drop_prob: 0.0,
    delay: Some((Duration::from_millis(5), Duration::from_millis(10))),
  };
  for _ in 0..100 {
    let d = slow.sample_delay(&mut rng).unwrap();
    assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(10));
  }
}
