//! Turnstile - Request Rate Limiting Engine
//!
//! This crate implements fixed-window request rate limiting for API
//! services. Counters live in a sharded in-process store, or in an external
//! backend shared by every instance, with automatic failover to the local
//! store whenever the backend is unreachable.

pub mod config;
pub mod error;
pub mod ratelimit;
