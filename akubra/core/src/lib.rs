//! Akubra Core - Replicating Proxy Engine
//!
//! This crate provides the routing and replication logic of the Akubra S3
//! proxy, completely independent of any HTTP server framework. The daemon
//! wires it to an inbound server; tests drive it directly.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Inbound server                          │
//! │                    (akubra-daemon, axum)                       │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 │ ProxyRequest
//! ┌───────────────────────────────┼───────────────────────────────┐
//! │                        AKUBRA CORE                             │
//! │  ┌────────────────────────────┴─────────────────────────────┐ │
//! │  │                       ShardsRing                          │ │
//! │  │   consistent hash · bucket ops · regression chain         │ │
//! │  └──────┬──────────────────────────────────────┬────────────┘ │
//! │         │ one cluster                          │ all clusters │
//! │  ┌──────┴───────┐                       ┌──────┴───────┐      │
//! │  │MultiTransport│  ...per cluster...    │MultiTransport│      │
//! │  └──────┬───────┘                       └──────┬───────┘      │
//! │         │ fan-out: multiplexed body, ceiling,  │              │
//! │         │ per-backend deadlines                │              │
//! │  ┌──────┴──────────────────────────────────────┴────────────┐ │
//! │  │              PickResponse + sync records                  │ │
//! │  └──────────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Config`]: the YAML configuration, validated at load time
//! - [`RoundTrip`]: the capability every transport variant implements
//! - [`MultiTransport`]: parallel fan-out over one backend set
//! - [`ShardsRing`]: consistent-hash routing with regression fallback
//! - [`SyncRecord`]: one divergence, one line for the repair process
//!
//! # Module Overview
//!
//! - [`config`]: YAML options, duration strings, validation
//! - [`transport`]: body multiplexer, read deadlines, fan-out, selection
//! - [`sharding`]: hash ring, clusters, ring factory, regression
//! - [`synclog`]: divergence records and the reporting channel

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod sharding;
pub mod synclog;
pub mod transport;

// Re-exports for convenience
pub use config::{load_config_from_path, ClientConfig, ClusterConfig, Config, ConfigError};
pub use sharding::{is_bucket_path, Cluster, RingError, RingFactory, RingTarget, ShardsRing};
pub use synclog::{spawn_writer, SyncRecord, SyncReporter};
pub use transport::{
    BackendReply, BackendResult, ByteStream, ConnectionCounter, FirstSuccessPicker,
    MultiTransport, PickResponse, ProxyRequest, ProxyResponse, RoundTrip, SharedTransport,
    TransportError,
};
