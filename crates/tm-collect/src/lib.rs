pub mod collector;
pub mod config;
pub mod shutdown;

pub use collector::{Collector, CollectorConfig, PollMode, StopReason};
pub use config::Settings;
pub use shutdown::ShutdownToken;
