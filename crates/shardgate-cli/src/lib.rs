//! # Shardgate CLI
//!
//! Library side of the `shardgate` binary.
//!
//! - `shardgate simulate`: drives a scripted workload through a [`Router`]
//!   backed by an in-memory cluster and reports what happened
//! - `shardgate config`: prints the effective router configuration
//!
//! [`Router`]: shardgate_router::Router

pub mod simulate;
