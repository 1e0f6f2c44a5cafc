//! metersrv - energy meter Modbus to Home Assistant bridge
//!
//! # Module tree
//!
//! - [`register`] - register descriptors and decoded results
//! - [`strategy`] - per-device-class decode strategies
//! - [`cache`] - last-known-good results with TTL
//! - [`executor`] - strategy dispatch with cache fallback
//! - [`calculated`] - formula registers evaluated from the cache
//! - [`grouping`] - batched reads over contiguous registers
//! - [`scheduler`] - per-group polling under one bus lock
//! - [`health`] - grace-period online/offline tracking
//! - [`publisher`] - Home Assistant discovery, state and availability
//! - [`bridge`] - glue between group outcomes, health and publisher
//! - [`config`] - YAML + environment configuration
//! - [`service`] - runtime wiring

pub mod bridge;
pub mod cache;
pub mod calculated;
pub mod config;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod health;
pub mod publisher;
pub mod register;
pub mod scheduler;
pub mod service;
pub mod strategy;

pub use error::{MeterError, Result};
