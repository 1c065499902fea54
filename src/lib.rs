//! Multi-server placement and link provisioning for namespace-based network
//! emulation.
//!
//! A [`topology::Topology`] is placed onto the physical servers of a
//! [`server::ServerRegistry`], nodes are created through an
//! [`engine::EmulationEngine`], and every link becomes either a veth pair or,
//! when its ends live on different servers, an ssh Ethernet tunnel.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod node;
pub mod placement;
pub mod remote;
pub mod server;
pub mod topology;
