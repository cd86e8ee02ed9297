//! Upcalls to the application.
//!
//! The [`PartitionManager`] fans view changes and application messages out to every registered
//! [`PartitionListener`]. Each upcall runs on its own thread, timed by a [`Watchdog`] and isolated
//! with `catch_unwind`. The manager waits at most the upcall timeout for each listener, so one
//! misbehaving listener cannot starve the others or the membership engine.

mod manager;
mod watchdog;

#[rustfmt::skip]
pub use {
  manager::Delivery,
  manager::PartitionListener,
  manager::PartitionManager,
  watchdog::Watchdog,
  watchdog::WatchGuard,
};
