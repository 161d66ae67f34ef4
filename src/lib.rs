//! Library crate for node-probe-rs: subscription decoding, descriptor
//! parsing, bounded-concurrency probing and latency ranking.
pub mod aggregate;
pub mod config;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod server;
pub mod sink;
pub mod subscription;
pub mod types;
