//! Assisted-installer swarm.
//!
//! Drives large numbers of simulated infrastructure hosts through the
//! multi-stage cluster bring-up workflow against an assisted-installer
//! control plane, exercising it at load. The orchestration engine — the
//! retrying state machine, the bounded worker pools with their admission
//! gate chain, and the snapshot cache of externally observed state — is
//! library code; the swarm/cluster/agent entities are built on top of it.

pub mod agent;
pub mod cache;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod container_config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod manifests;
pub mod pool;
pub mod state_machine;
pub mod swarm;
