use crate::core::Timestamp;
use crate::detection::FailureDetector;
use std::time::Duration;

/// Convicts when nothing has been heard for longer than `timeout`.
#[derive(Debug)]
pub struct FixedTimeout {
  timeout: i64,
  last: Option<Timestamp>,
}
impl FixedTimeout {
  pub fn new(timeout: Duration) -> FixedTimeout {
    FixedTimeout {
      timeout: timeout.as_millis() as i64,
      last: None,
    }
  }
}
impl FailureDetector for FixedTimeout {
  fn record(&mut self, now: Timestamp, delay: i64) {
    let sample = now - delay;
    if self.last.filter(|last| *last >= sample).is_none() {
      self.last = Some(sample);
    }
  }

  fn should_convict(&self, now: Timestamp) -> bool {
    self.last.map(|last| now - last > self.timeout).unwrap_or(false)
  }

  fn last_sample(&self) -> Option<Timestamp> {
    self.last
  }
}

#[test]
fn test_fixed_timeout_bound() {
  for timeout in [1i64, 7, 250, 3000].iter() {
    let mut fd = FixedTimeout::new(Duration::from_millis(*timeout as u64));
    fd.record(10_000, 0);
    for now in 9_000..=10_000 + timeout {
      assert!(!fd.should_convict(now), "timeout {} now {}", timeout, now);
    }
    assert!(fd.should_convict(10_000 + timeout + 1));
  }
}

#[test]
fn test_fixed_timeout_ignores_stale_samples() {
  let mut fd = FixedTimeout::new(Duration::from_millis(100));
  fd.record(1000, 0);
  fd.record(900, 0);
  fd.record(1000, 0);
  assert_eq!(fd.last_sample(), Some(1000));
  // A sample that travelled 50ms was sent at 1150.
  fd.record(1200, 50);
  assert_eq!(fd.last_sample(), Some(1150));
  assert!(!fd.should_convict(1250));
  assert!(fd.should_convict(1251));
}
