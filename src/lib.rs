//! Public interface to the Rookery core library, linked by the node
//! executable and by integration tests.
//!
//! A Rookery deployment is a fixed set of backend nodes plus one front-door
//! balancer. Backends host the social-network repositories and run the full
//! coordination stack (discovery, bully election, berkeley clock sync, and
//! asynchronous write replication); the balancer forwards client requests
//! round-robin over the live backends and runs only a reduced sync responder.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod balancer;
pub mod berkeley;
pub mod clock;
pub mod context;
pub mod discovery;
pub mod election;
pub mod message;
pub mod node;
pub mod peers;
pub mod replication;
pub mod repository;
pub mod service;
pub mod transport;

pub use context::{CoordinationContext, NodeId};
pub use node::{BackendNode, BalancerNode, GenericNode, NodeConfig};
pub use utils::RookeryError;
