//! Floodgate - Distributed Rate Limiting Engine
//!
//! This crate decides whether a request identified by a key may proceed under
//! a configured rate. Four algorithms are available (fixed counter, sliding
//! window, token bucket, leaky bucket); each makes its decision in a single
//! atomic script execution against a shared store, so any number of replicas
//! can enforce one limit together. A plugin pipeline runs before enforcement
//! and can let a request bypass the limit or reject it outright.

pub mod clock;
pub mod config;
pub mod error;
pub mod plugin;
pub mod ratelimit;
pub mod store;
