//! Collects GCP Pub/Sub topics and subscriptions across projects into a local
//! SQLite cache and renders them as a graph clustered by project.
//!
//! # Module Structure
//!
//! - [`gcp`] - authentication, REST plumbing and the Pub/Sub client
//! - [`collector`] - rate-limited, retried collection across many projects
//! - [`storage`] - the resource store and its SQLite implementation
//! - [`graph`] - graph model and builder
//! - [`render`] - DOT, JSON and Graphviz image output
//! - [`config`] - YAML configuration with environment overrides
//! - [`commands`] - the CLI commands

pub mod collector;
pub mod commands;
pub mod config;
pub mod error;
pub mod gcp;
pub mod graph;
pub mod render;
pub mod storage;

/// Version injected at compile time via GCP_PUBSUB_GRAPH_VERSION env var (set
/// by CI/CD), or the crate version for local builds.
pub const VERSION: &str = match option_env!("GCP_PUBSUB_GRAPH_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
