//! Tools for testing clusters in a single process.

mod failure_config;
mod logging;
mod memory_network;
mod recorder;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::init_logging,
  memory_network::MemoryNetwork,
  memory_network::MemoryTransport,
  recorder::drain,
  recorder::eventually,
  recorder::Event,
  recorder::Recorder,
};
