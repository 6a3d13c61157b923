//! 设备记录模型
//!
//! `DeviceRecord` 是设备存储持有的快照；能力注册表只读取它，
//! 所有修改都经由 [`DevicePatch`] 交给存储完成。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::DeviceCommand;

/// 显示模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Screensaver,
    Cinema,
    Wallart,
}

impl DeviceMode {
    pub const ALL: [DeviceMode; 3] = [DeviceMode::Screensaver, DeviceMode::Wallart, DeviceMode::Cinema];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Screensaver => "screensaver",
            DeviceMode::Cinema => "cinema",
            DeviceMode::Wallart => "wallart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "screensaver" => Some(DeviceMode::Screensaver),
            "cinema" => Some(DeviceMode::Cinema),
            "wallart" => Some(DeviceMode::Wallart),
            _ => None,
        }
    }

    /// 该模式在 settingsOverride 中对应的子对象键；屏保设置位于根部
    pub fn settings_key(&self) -> Option<&'static str> {
        match self {
            DeviceMode::Screensaver => None,
            DeviceMode::Cinema => Some("cinema"),
            DeviceMode::Wallart => Some("wallartMode"),
        }
    }
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenInfo {
    #[serde(default)]
    pub w: Option<u32>,
    #[serde(default)]
    pub h: Option<u32>,
    #[serde(default)]
    pub dpr: Option<f64>,
}

/// 客户端自报信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenInfo>,
}

/// 服务端缓存的设备运行状态 (含当前媒体元数据镜像)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powered_off: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    /// 片长 (分钟)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_rating: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    #[default]
    Offline,
}

/// 设备记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub secret_hash: String,
    #[serde(default)]
    pub client_info: ClientInfo,
    #[serde(default)]
    pub current_state: CurrentState,
    #[serde(default = "empty_object")]
    pub settings_override: Value,
    #[serde(default)]
    pub pending_commands: Vec<DeviceCommand>,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub ws_connected: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            location: None,
            groups: Vec::new(),
            preset: None,
            secret_hash: String::new(),
            client_info: ClientInfo::default(),
            current_state: CurrentState::default(),
            settings_override: empty_object(),
            pending_commands: Vec::new(),
            status: ConnectionStatus::Offline,
            ws_connected: false,
            created_at: Utc::now(),
            last_seen_at: None,
        }
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    pub fn with_current_state(mut self, current_state: CurrentState) -> Self {
        self.current_state = current_state;
        self
    }

    pub fn with_settings_override(mut self, settings_override: Value) -> Self {
        self.settings_override = settings_override;
        self
    }

    /// 未上报电源状态时视为开机
    pub fn is_powered_on(&self) -> bool {
        !self.current_state.powered_off.unwrap_or(false)
    }

    pub fn is_pinned(&self) -> bool {
        self.current_state.pinned.unwrap_or(false)
    }

    /// 用于展示的名称，未命名时退回到 id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// 顶层字段的浅合并补丁
///
/// 嵌套的 `settingsOverride` 必须由调用方预先计算好完整值。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<CurrentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_override: Option<Value>,
}

impl DevicePatch {
    pub fn settings_override(value: Value) -> Self {
        Self {
            settings_override: Some(value),
            ..Self::default()
        }
    }

    pub fn apply_to(self, device: &mut DeviceRecord) {
        if let Some(name) = self.name {
            device.name = name;
        }
        if let Some(location) = self.location {
            device.location = Some(location);
        }
        if let Some(groups) = self.groups {
            device.groups = groups;
        }
        if let Some(preset) = self.preset {
            device.preset = Some(preset);
        }
        if let Some(client_info) = self.client_info {
            device.client_info = client_info;
        }
        if let Some(current_state) = self.current_state {
            device.current_state = current_state;
        }
        if let Some(settings_override) = self.settings_override {
            device.settings_override = settings_override;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_power_defaults_to_on() {
        let device = DeviceRecord::new("d1");
        assert!(device.is_powered_on());
        assert!(!device.is_pinned());

        let off = DeviceRecord::new("d2").with_current_state(CurrentState {
            powered_off: Some(true),
            ..Default::default()
        });
        assert!(!off.is_powered_on());
    }

    #[test]
    fn test_record_deserializes_sparse_json() {
        let device: DeviceRecord = serde_json::from_value(json!({
            "id": "d1",
            "clientInfo": { "mode": "cinema", "userAgent": "Mozilla/5.0" },
            "currentState": { "poweredOff": false, "genres": ["Drama"] }
        }))
        .unwrap();

        assert_eq!(device.client_info.mode.as_deref(), Some("cinema"));
        assert_eq!(device.current_state.genres, vec!["Drama".to_string()]);
        assert_eq!(device.settings_override, json!({}));
        assert_eq!(device.status, ConnectionStatus::Offline);
    }

    #[test]
    fn test_patch_is_shallow() {
        let mut device = DeviceRecord::new("d1")
            .with_settings_override(json!({ "cinema": { "header": { "enabled": true } } }));
        device.name = "Lobby".to_string();

        DevicePatch::settings_override(json!({ "mode": "wallart" })).apply_to(&mut device);

        assert_eq!(device.settings_override, json!({ "mode": "wallart" }));
        assert_eq!(device.name, "Lobby");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(DeviceMode::parse("Cinema"), Some(DeviceMode::Cinema));
        assert_eq!(DeviceMode::parse("bogus"), None);
        assert_eq!(DeviceMode::Wallart.settings_key(), Some("wallartMode"));
        assert_eq!(DeviceMode::Screensaver.settings_key(), None);
    }
}
