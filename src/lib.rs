//! Knit-Internal is the run lifecycle engine of a Kubernetes-hosted data
//! pipeline platform: immutable content-tagged data, declarative plans,
//! the projection that derives runs from them, and the loop schedulers
//! and data agents that execute those runs on a cluster.
pub mod cluster;
pub mod config;
pub mod domain;
pub mod errors;
pub mod graph;
pub mod handlers;
pub mod keychain;
pub mod projection;
pub mod store;
pub mod worker;
