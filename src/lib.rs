//! Ticklog Backend Library
//!
//! Reliable per-stream message logging into rotating storage targets:
//! stream writers with a circuit breaker, replay and rotation buffers, and a
//! rotation orchestrator that swaps targets, archives the rotated-out
//! generation and drops it once the archive verified.

pub mod archive;
pub mod clock;
pub mod config;
pub mod feed;
pub mod models;
pub mod reliability;
pub mod rotation;
pub mod signal;
pub mod storage;
pub mod writer;

pub use config::AppConfig;
pub use models::{Message, MessageKind, StreamId};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
