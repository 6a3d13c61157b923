//! 命令通道抽象
//!
//! 把指令推送给在线的显示客户端。投递是尽力而为的：设备离线时
//! 实现可以排队或直接丢弃，能力层不关心结果。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::device::DeviceMode;
use crate::error::DeviceResult;

pub const PLAYBACK_PAUSE: &str = "playback.pause";
pub const PLAYBACK_RESUME: &str = "playback.resume";
pub const PLAYBACK_NEXT: &str = "playback.next";
pub const PLAYBACK_PREVIOUS: &str = "playback.previous";
pub const PLAYBACK_TOGGLE: &str = "playback.toggle";
pub const PLAYBACK_PIN: &str = "playback.pin";
pub const PLAYBACK_UNPIN: &str = "playback.unpin";
pub const POWER_ON: &str = "power.on";
pub const POWER_OFF: &str = "power.off";
pub const MODE_NAVIGATE: &str = "mode.navigate";
pub const MGMT_RELOAD: &str = "core.mgmt.reload";
pub const MGMT_RESET: &str = "core.mgmt.reset";

/// 发往客户端的指令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    json!({})
}

impl DeviceCommand {
    pub fn new(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
        }
    }

    /// 空载荷指令
    pub fn simple(command_type: impl Into<String>) -> Self {
        Self::new(command_type, empty_payload())
    }

    pub fn navigate(mode: DeviceMode) -> Self {
        Self::new(MODE_NAVIGATE, json!({ "mode": mode.as_str() }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// 已写入在线连接
    Sent,
    /// 设备离线，已排队等待下次心跳
    Queued,
    /// 设备离线且该消息不排队
    Dropped,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send_command(&self, device_id: &str, command: DeviceCommand) -> DeviceResult<DeliveryStatus>;

    async fn send_apply_settings(&self, device_id: &str, settings_patch: Value) -> DeviceResult<DeliveryStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = DeviceCommand::navigate(DeviceMode::Wallart);
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value, json!({ "type": "mode.navigate", "payload": { "mode": "wallart" } }));

        let parsed: DeviceCommand = serde_json::from_value(json!({ "type": "power.off" })).unwrap();
        assert_eq!(parsed, DeviceCommand::simple(POWER_OFF));
    }
}
