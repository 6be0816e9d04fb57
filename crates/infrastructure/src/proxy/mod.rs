//! Proxy ingress. MQTT bindings subscribe on an external broker and pump
//! received payloads into the owning proxy device; HTTP bindings are served
//! by the control plane's webhook route and need no adapter task here.

mod mqtt;

pub use mqtt::MqttIngress;
