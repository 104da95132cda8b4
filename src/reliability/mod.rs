//! Write-path reliability: circuit breaker, the two buffers and counters.

pub mod health;
pub mod replay_buffer;
pub mod rotation_buffer;
pub mod stats;

pub use health::{CircuitState, HealthConfig, HealthMonitor, HealthSnapshot};
pub use replay_buffer::{DrainReport, ReplayBuffer};
pub use rotation_buffer::RotationBuffer;
pub use stats::{LossReason, StreamStats};
