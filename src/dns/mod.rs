//! DNS stub proxy implementation
//!
//! The serving pipeline for a query is: listener (`server`) reads raw bytes,
//! the `handler` parses and consults the `cache`, misses go through the
//! `resolve` policy over the `client` transports, the answer section is
//! collapsed by `filter`, and the result is cached and written back.

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// TTL-aware response caching
pub mod cache;

/// DNS client for queries to upstream servers
pub mod client;

/// resolved.conf compatible configuration loading
pub mod config;

/// Per-type single-record answer filtering
pub mod filter;

/// Per-query orchestration from bytes to bytes
pub mod handler;

/// Network utilities for TCP length framing
pub mod netutil;

/// Bounded worker pool backing the listeners
pub mod pool;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Upstream server walk across primary and fallback tiers
pub mod resolve;

/// UDP and TCP stub listener implementations
pub mod server;
