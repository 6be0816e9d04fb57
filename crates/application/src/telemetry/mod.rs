//! Telemetry value production. One generator instance per attribute per
//! device, created at device start and dropped at stop.

mod generator;
mod registry;
mod replay;

pub use generator::{GeneratedValue, Generator};
pub use registry::{HandlerFn, HandlerRegistry};
pub use replay::ReplayGenerator;
