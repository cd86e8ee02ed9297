use crate::core::Timestamp;
use crate::detection::FailureDetector;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Empirical-distribution failure detector.
///
/// Keeps the most recent inter-arrival intervals both in arrival order (for eviction) and as a
/// sorted multiset (for counting). The peer is convicted once the fraction of intervals no longer
/// than `scale * Δ` reaches `conviction_threshold`, i.e. once the silence `Δ` is long compared to
/// what this peer has shown so far.
#[derive(Debug)]
pub struct Adaptive {
  capacity: usize,
  scale: f64,
  conviction_threshold: f64,
  min_samples: usize,
  min_interval: i64,
  arrivals: VecDeque<i64>,
  sorted: BTreeMap<i64, usize>,
  latest: Option<Timestamp>,
}
impl Adaptive {
  pub fn new(
    capacity: usize,
    scale: f64,
    conviction_threshold: f64,
    min_samples: usize,
    min_interval: Duration,
  ) -> Adaptive {
    Adaptive {
      capacity: capacity,
      scale: scale,
      conviction_threshold: conviction_threshold,
      min_samples: min_samples,
      min_interval: min_interval.as_millis() as i64,
      arrivals: VecDeque::with_capacity(capacity),
      sorted: BTreeMap::new(),
      latest: None,
    }
  }

  fn insert(&mut self, interval: i64) {
    while self.arrivals.len() >= self.capacity {
      match self.arrivals.pop_front() {
        Some(old) => self.remove(old),
        None => break,
      }
    }
    self.arrivals.push_back(interval);
    *self.sorted.entry(interval).or_insert(0) += 1;
  }

  fn remove(&mut self, interval: i64) {
    if let Some(count) = self.sorted.get_mut(&interval) {
      *count -= 1;
      if *count == 0 {
        self.sorted.remove(&interval);
      }
    }
  }

  /// Fraction of recorded intervals that are at most `scale * delta`.
  pub fn fraction_within(&self, delta: i64) -> f64 {
    if self.arrivals.is_empty() {
      return 0.0;
    }
    let bound = (self.scale * delta as f64).floor() as i64;
    let within: usize = self.sorted.range(..=bound).map(|(_, c)| *c).sum();
    within as f64 / self.arrivals.len() as f64
  }

  pub fn samples(&self) -> usize {
    self.arrivals.len()
  }
}
impl FailureDetector for Adaptive {
  fn record(&mut self, now: Timestamp, delay: i64) {
    let at = now - delay;
    match self.latest {
      Some(latest) if at <= latest => {}
      Some(latest) => {
        self.latest = Some(at);
        if at - latest >= self.min_interval {
          self.insert(at - latest);
        }
      }
      None => self.latest = Some(at),
    }
  }

  fn should_convict(&self, now: Timestamp) -> bool {
    let latest = match self.latest {
      Some(latest) if self.arrivals.len() >= self.min_samples.max(1) => latest,
      _ => return false,
    };
    let fraction = self.fraction_within(now - latest);
    if fraction >= self.conviction_threshold {
      debug!(
        fraction = fraction,
        threshold = self.conviction_threshold,
        "adaptive conviction"
      );
      true
    } else {
      false
    }
  }

  fn last_sample(&self) -> Option<Timestamp> {
    self.latest
  }
}

#[test]
fn test_adaptive_needs_samples() {
  let mut fd = Adaptive::new(10, 1.0, 0.9, 3, Duration::from_millis(5));
  fd.record(0, 0);
  fd.record(100, 0);
  fd.record(200, 0);
  assert_eq!(fd.samples(), 2);
  assert!(!fd.should_convict(100_000));
  fd.record(300, 0);
  assert!(fd.should_convict(100_000));
}

#[test]
fn test_adaptive_percentile() {
  let mut fd = Adaptive::new(10, 0.5, 0.8, 1, Duration::from_millis(5));
  let mut at = 0;
  fd.record(at, 0);
  for dur in [100, 100, 100, 100, 200, 100, 100, 100, 300, 100].iter() {
    at += dur;
    fd.record(at, 0);
  }
  // 8 of 10 intervals are at most 100, reached when 0.5 * Δ >= 100.
  assert!(!fd.should_convict(at + 199));
  assert_eq!(fd.fraction_within(200), 0.8);
  assert!(fd.should_convict(at + 200));
}

#[test]
fn test_adaptive_evicts_oldest() {
  let mut fd = Adaptive::new(3, 1.0, 1.0, 1, Duration::from_millis(5));
  let mut at = 0;
  fd.record(at, 0);
  for dur in [1000, 10, 10, 10].iter() {
    at += dur;
    fd.record(at, 0);
  }
  assert_eq!(fd.samples(), 3);
  // The 1000ms outlier is gone, so a 10ms silence already covers every sample.
  assert!(fd.should_convict(at + 10));
  fd.record(at + 2, 0);
  assert_eq!(fd.samples(), 3);
}
