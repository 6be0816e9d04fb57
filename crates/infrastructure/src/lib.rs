//! Infrastructure layer - External integrations

pub mod adapters;
pub mod config;
pub mod model_store;
pub mod proxy;
pub mod sink;

pub use adapters::{Publish, PublishHandle, PublishOutcome, ProtocolAdapter};
pub use config::EngineConfig;
pub use model_store::ModelStore;
pub use proxy::MqttIngress;
pub use sink::MetricsSink;
