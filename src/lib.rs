//! A DNS forwarder that relays client queries to upstream resolvers over
//! DNS-over-TLS.
//!
//! # Architecture
//!
//! - [`dns`] - DNS message parsing, construction, and framing
//! - [`query`] - per-request state shared between the proxy and resolvers
//! - [`framed`] - TCP length-prefix framing and UDP datagram reads
//! - [`resolver`] - one persistent, pipelined upstream DoT connection
//! - [`dispatcher`] - latency-aware ranking and dispatch across upstreams
//! - [`proxy`] - client-facing UDP/TCP handling
//! - [`config`] - CLI and configuration file parsing
//! - [`worker`] - per-thread wiring of the above
//! - [`stats`] - per-worker counters

pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod framed;
pub mod proxy;
pub mod query;
pub mod resolver;
pub mod stats;
pub mod worker;
