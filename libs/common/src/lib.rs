//! Shared building blocks for the metersrv workspace
//!
//! - logging setup (console + rolling file)
//! - shutdown signal handling and cancellation
//! - hex encoding/validation for the gateway tunnel

pub mod hex;
pub mod logging;
pub mod shutdown;

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
