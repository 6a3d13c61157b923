//! Posterrama Server - HTTP/WebSocket 服务与 MQTT 桥接

pub mod device_api;
pub mod gateway;
pub mod mqtt;
pub mod ws_hub;

pub use device_api::{ApiError, DeviceApiState, create_device_router};
pub use gateway::*;
pub use mqtt::{MqttBridge, MqttTopics};
pub use ws_hub::{ClientFrame, ServerFrame, WsHub, ws_router};
