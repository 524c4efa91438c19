//! Floodgate - In-process admission control
//!
//! This crate implements a per-client, fixed-window request limiter that sits
//! in front of a request-handling pipeline. Each process enforces its own
//! limit; there is no coordination between instances.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
