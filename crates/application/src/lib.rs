//! Application layer - Device orchestration and value production

pub mod device;
pub mod manager;
pub mod telemetry;

pub use device::{DeviceCommand, DeviceRuntime, ProxyDevice, RuntimeSettings};
pub use manager::{DeviceManager, EngineStatsSnapshot};
pub use telemetry::{Generator, HandlerRegistry};
