use crate::core::Timestamp;
use crate::detection::{Estimator, FailureDetector};
use itertools::Itertools;
use statrs::distribution::{Exponential, Univariate};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::iter::repeat;
use std::time::Duration;
use tracing::debug;

/// A bounded window of heartbeat inter-arrival intervals, in milliseconds. The newest interval is
/// at the front.
pub struct IntervalStorage {
  capacity: usize,
  intervals: VecDeque<u64>,
  sum: u64,
  min_interval: u64,
  latest: Option<Timestamp>,
}
impl IntervalStorage {
  /// Creates a window already holding `times` synthetic intervals of length `init`.
  pub fn new(cap: usize, init: Duration, times: usize, min_interval: Duration) -> IntervalStorage {
    let intervals = repeat(dur2u64(&init))
      .take(times.min(cap))
      .collect::<VecDeque<_>>();
    let sum = intervals.iter().sum();
    IntervalStorage {
      capacity: cap,
      intervals: intervals,
      sum: sum,
      min_interval: dur2u64(&min_interval),
      latest: None,
    }
  }

  /// Records a heartbeat sent at `at`. Returns whether a new interval entered the window.
  pub fn push(&mut self, at: Timestamp) -> bool {
    let latest = match self.latest {
      None => {
        self.latest = Some(at);
        return false;
      }
      Some(latest) if at <= latest => return false,
      Some(latest) => latest,
    };
    self.latest = Some(at);
    let interval = (at - latest) as u64;
    if interval < self.min_interval {
      return false;
    }
    while self.intervals.len() >= self.capacity {
      if let Some(last) = self.intervals.pop_back() {
        self.sum -= last;
      }
    }
    self.intervals.push_front(interval);
    self.sum += interval;
    true
  }

  pub fn latest(&self) -> Option<Timestamp> {
    self.latest
  }

  pub fn len(&self) -> usize {
    self.intervals.len()
  }

  pub fn mean(&self) -> f64 {
    if self.intervals.is_empty() {
      return 0.0;
    }
    self.sum as f64 / self.intervals.len() as f64
  }

  pub fn median(&self) -> f64 {
    let sorted = self.intervals.iter().copied().sorted().collect::<Vec<_>>();
    match sorted.len() {
      0 => 0.0,
      n if n % 2 == 1 => sorted[n / 2] as f64,
      n => (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0,
    }
  }

  pub fn intervals(&self) -> impl Iterator<Item = &u64> {
    self.intervals.iter()
  }
}
impl Debug for IntervalStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IntervalStorage")
      .field("len", &self.intervals.len())
      .field("mean", &self.mean())
      .field("latest", &self.latest)
      .finish()
  }
}

fn dur2u64(dur: &Duration) -> u64 {
  dur.as_millis() as u64
}

/// Accrual failure detector assuming exponentially distributed inter-arrival times.
///
/// `phi = -log10(P(no heartbeat for Δ))` where `Δ` is the time since the last heartbeat was sent.
/// With an exponential distribution of mean `m` this is `-log10(exp(-Δ/m))`, so a `phi` of 1
/// means a 10% chance the peer is still alive, 2 means 1%, and so on.
#[derive(Debug)]
pub struct PhiAccrual {
  threshold: f64,
  storage: IntervalStorage,
  estimator: Estimator,
}
impl PhiAccrual {
  pub fn new(threshold: f64, storage: IntervalStorage, estimator: Estimator) -> PhiAccrual {
    PhiAccrual {
      threshold: threshold,
      storage: storage,
      estimator: estimator,
    }
  }

  fn estimate(&self) -> f64 {
    match self.estimator {
      Estimator::Mean => self.storage.mean(),
      Estimator::Median => self.storage.median(),
    }
  }

  /// Suspicion level at `now`. Zero before the first heartbeat.
  pub fn phi(&self, now: Timestamp) -> f64 {
    match self.storage.latest() {
      None => 0.0,
      Some(latest) => self.phi_delta((now - latest).max(0) as f64),
    }
  }

  fn phi_delta(&self, delta: f64) -> f64 {
    let mean = self.estimate();
    if mean <= 0.0 {
      return if delta > 0.0 { f64::INFINITY } else { 0.0 };
    }
    match Exponential::new(1.0 / mean) {
      Ok(dist) => {
        let survival: f64 = 1.0 - dist.cdf(delta);
        -survival.log10()
      }
      Err(_) => 0.0,
    }
  }
}
impl FailureDetector for PhiAccrual {
  fn record(&mut self, now: Timestamp, delay: i64) {
    self.storage.push(now - delay);
  }

  fn should_convict(&self, now: Timestamp) -> bool {
    let phi = self.phi(now);
    if phi > self.threshold {
      debug!(phi = phi, threshold = self.threshold, "phi accrual conviction");
      true
    } else {
      false
    }
  }

  fn last_sample(&self) -> Option<Timestamp> {
    self.storage.latest()
  }
}

#[cfg(test)]
fn storage(cap: usize, init: u64, times: usize) -> IntervalStorage {
  IntervalStorage::new(cap, Duration::from_millis(init), times, Duration::from_millis(5))
}

#[test]
fn test_interval_storage_window() {
  let mut test = storage(10, 1000, 2);
  assert_eq!(test.len(), 2);
  assert!(!test.push(50_000));
  let mut at = 50_000;
  for dur in (4500..=5500).step_by(100) {
    at += dur;
    assert!(test.push(at));
  }
  assert_eq!(test.len(), 10);
  // 4500 was evicted along with the synthetic samples.
  assert_eq!(test.mean(), 5050.0);
  assert_eq!(test.median(), 5050.0);
  assert_eq!(test.intervals().next(), Some(&5500));
}

#[test]
fn test_interval_storage_drops_bursts_and_stale() {
  let mut test = storage(10, 100, 3);
  test.push(1000);
  assert!(!test.push(1002));
  assert!(!test.push(900));
  assert_eq!(test.latest(), Some(1002));
  assert_eq!(test.len(), 3);
  assert!(test.push(1102));
  assert_eq!(test.len(), 4);
}

#[test]
fn test_phi_grows_with_silence() {
  let mut fd = PhiAccrual::new(2.0, storage(100, 100, 5), Estimator::Mean);
  assert!(!fd.should_convict(1_000_000));
  fd.record(1000, 0);
  for i in 1..=20 {
    fd.record(1000 + i * 100, 0);
  }
  let last = 3000;
  let phi_short = fd.phi(last + 50);
  let phi_long = fd.phi(last + 400);
  assert!(phi_short < phi_long);
  // phi(Δ) = Δ / (mean · ln 10)
  let expected = 400.0 / (100.0 * std::f64::consts::LN_10);
  assert!((phi_long - expected).abs() < 1e-6, "{} vs {}", phi_long, expected);
  assert!(!fd.should_convict(last + 400));
  assert!(fd.should_convict(last + 500));
}

#[test]
fn test_phi_median_resists_outliers() {
  let mut mean = PhiAccrual::new(2.0, storage(10, 100, 0), Estimator::Mean);
  let mut median = PhiAccrual::new(2.0, storage(10, 100, 0), Estimator::Median);
  let mut at = 0;
  for dur in [100, 100, 100, 100, 5000].iter() {
    at += dur;
    mean.record(at, 0);
    median.record(at, 0);
  }
  assert!(median.phi(at + 600) > mean.phi(at + 600));
  assert!(median.should_convict(at + 600));
  assert!(!mean.should_convict(at + 600));
}
