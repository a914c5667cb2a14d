//! Async serving core: batch scheduling, latency monitoring, and the engine facade.

pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
mod scheduler;

pub use config::{ConfigError, EngineConfig, MonitorConfig};
pub use engine::{Engine, InferenceRequest, Ticket};
pub use error::{EngineError, ErrorKind};
pub use monitor::{Admission, HealthState, LatencyMonitor, MonitorSnapshot};
pub use scheduler::SchedulerStats;
