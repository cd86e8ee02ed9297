//! Failure detectors decide, from the arrival history of one peer's heartbeats, whether that peer
//! should be considered dead.
//!
//! Each detector is fed with [`record`](FailureDetector::record) whenever a heartbeat is accepted
//! and asked [`should_convict`](FailureDetector::should_convict) by the periodic sweep. A sample's
//! time is `now - delay`. For clock-skew measuring protocols `delay` is the gap between our clock
//! and the sender's timestamp. Ping protocols trust only the local clock and record every heartbeat
//! at its arrival with a zero delay.
//!
//! Three families are provided:
//! - [`FixedTimeout`]: convicts once nothing has been heard for a fixed time.
//! - [`PhiAccrual`]: converts the time since the last heartbeat into a continuous suspicion level
//!   `phi` using the mean (or median) inter-arrival interval, and convicts above a threshold.
//! - [`Adaptive`]: convicts when the silence is long compared to an empirical percentile of recent
//!   inter-arrival intervals.

use crate::core::{ConfigError, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod adaptive;
mod interval_storage;
mod timeout;

#[rustfmt::skip]
pub use {
  adaptive::Adaptive,
  interval_storage::IntervalStorage,
  interval_storage::PhiAccrual,
  timeout::FixedTimeout,
};

pub trait FailureDetector: Send + 'static {
  /// Records a heartbeat that arrived at `now` after travelling for `delay` milliseconds.
  /// Out-of-order or duplicate samples are ignored.
  fn record(&mut self, now: Timestamp, delay: i64);

  /// Whether the peer should be considered dead at `now`. Never true before any sample.
  fn should_convict(&self, now: Timestamp) -> bool;

  /// The send time of the latest recorded heartbeat, in local time.
  fn last_sample(&self) -> Option<Timestamp>;
}

/// How the typical inter-arrival interval is estimated by [`PhiAccrual`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Estimator {
  Mean,
  Median,
}

/// Selects and parameterizes the failure detector built for every peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DetectorConfig {
  FixedTimeout {
    timeout: Duration,
  },
  PhiAccrual {
    /// Convict once `phi` exceeds this.
    threshold: f64,
    /// Number of intervals kept.
    capacity: usize,
    /// Synthetic intervals the window starts with.
    initial_samples: usize,
    /// The interval used for the synthetic samples, usually the heartbeat interval.
    expected_interval: Duration,
    /// Intervals shorter than this are dropped.
    min_interval: Duration,
    estimator: Estimator,
  },
  Adaptive {
    /// Number of intervals kept.
    capacity: usize,
    /// The silence is multiplied by this before comparing it against the samples.
    scale: f64,
    /// Convict once this fraction of samples is at most the scaled silence.
    conviction_threshold: f64,
    /// No conviction before this many real samples.
    min_samples: usize,
    /// Intervals shorter than this are dropped.
    min_interval: Duration,
  },
}
impl DetectorConfig {
  pub fn phi_accrual(expected_interval: Duration) -> DetectorConfig {
    DetectorConfig::PhiAccrual {
      threshold: 2.0,
      capacity: 100,
      initial_samples: 5,
      expected_interval: expected_interval,
      min_interval: Duration::from_millis(5),
      estimator: Estimator::Mean,
    }
  }

  pub fn adaptive() -> DetectorConfig {
    DetectorConfig::Adaptive {
      capacity: 100,
      scale: 0.5,
      conviction_threshold: 0.99,
      min_samples: 5,
      min_interval: Duration::from_millis(5),
    }
  }

  pub fn build(&self) -> Box<dyn FailureDetector> {
    match self {
      DetectorConfig::FixedTimeout { timeout } => Box::new(FixedTimeout::new(*timeout)),
      DetectorConfig::PhiAccrual {
        threshold,
        capacity,
        initial_samples,
        expected_interval,
        min_interval,
        estimator,
      } => Box::new(PhiAccrual::new(
        *threshold,
        IntervalStorage::new(*capacity, *expected_interval, *initial_samples, *min_interval),
        *estimator,
      )),
      DetectorConfig::Adaptive {
        capacity,
        scale,
        conviction_threshold,
        min_samples,
        min_interval,
      } => Box::new(Adaptive::new(
        *capacity,
        *scale,
        *conviction_threshold,
        *min_samples,
        *min_interval,
      )),
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    match self {
      DetectorConfig::FixedTimeout { timeout } if timeout.as_millis() == 0 => {
        Err(ConfigError::Zero("detector timeout"))
      }
      DetectorConfig::PhiAccrual { capacity: 0, .. }
      | DetectorConfig::Adaptive { capacity: 0, .. } => Err(ConfigError::Zero("detector capacity")),
      DetectorConfig::PhiAccrual { threshold, .. } if *threshold <= 0.0 => {
        Err(ConfigError::Zero("phi threshold"))
      }
      DetectorConfig::Adaptive {
        scale,
        conviction_threshold,
        ..
      } if *scale <= 0.0 || *conviction_threshold <= 0.0 => {
        Err(ConfigError::Zero("adaptive scale and threshold"))
      }
      _ => Ok(()),
    }
  }
}

#[test]
fn test_detector_config_validation() {
  assert!(DetectorConfig::phi_accrual(Duration::from_millis(100))
    .validate()
    .is_ok());
  assert!(DetectorConfig::adaptive().validate().is_ok());
  assert_eq!(
    DetectorConfig::FixedTimeout {
      timeout: Duration::from_millis(0)
    }
    .validate(),
    Err(ConfigError::Zero("detector timeout"))
  );
}

#[test]
fn test_built_detectors_start_unconvicted() {
  let configs = vec![
    DetectorConfig::FixedTimeout {
      timeout: Duration::from_millis(100),
    },
    DetectorConfig::phi_accrual(Duration::from_millis(100)),
    DetectorConfig::adaptive(),
  ];
  for cfg in configs {
    let fd = cfg.build();
    assert_eq!(fd.last_sample(), None);
    assert!(!fd.should_convict(i64::MAX / 2));
  }
}
