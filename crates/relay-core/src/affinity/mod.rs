//! Worker identity and load accounting for the affinity pool.

pub mod balancer;

pub use balancer::{LoadBalancer, WorkerId};
