//! Gatekeeper - Admission Control for HTTP Services
//!
//! This crate decides, per request, whether a client may proceed. Clients are
//! identified by source address or API token; tokens may carry a tier with
//! its own quota. A client that crosses its limit is blocked for a fixed
//! cooldown, after which its count starts again from zero. Counters live in
//! a shared backend (Redis) or in process memory.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
