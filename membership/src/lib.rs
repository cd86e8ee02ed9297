//! Group membership and partition detection for a cluster of numbered nodes.
//!
//! Nodes exchange heartbeats over unicast or multicast, each derives a [`View`](core::View) of the
//! nodes it can reach, and every connected component elects a leader. Listeners registered with a
//! [`Node`](cluster::Node) are told whenever the view, its stability or its leader changes, and
//! receive the application messages sent over message connections.
//!
//! The layers, bottom up:
//! - [`core`]: identities, views, configuration, the wire codec, authentication and transports.
//! - [`detection`]: pluggable failure detectors.
//! - [`election`]: candidates and the leader election.
//! - [`cluster`]: the per-peer heartbeat protocol, the connection set and the node runtime.
//! - [`partition`]: upcalls to the application, guarded by a watchdog.
//! - [`spanning`]: a spanning tree over the reachable nodes.

pub mod cluster;
pub mod core;
pub mod detection;
pub mod election;
pub mod partition;
pub mod spanning;
pub mod testkit;
