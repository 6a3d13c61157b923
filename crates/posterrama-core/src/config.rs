//! 配置管理
//!
//! 配置以 JSON 形式保存在磁盘上；文件不存在时使用默认值。

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{PosterramaError, Result};

/// 主配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PosterramaConfig {
    /// 服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 设备存储配置
    #[serde(default)]
    pub devices: DevicesConfig,
    /// MQTT 桥接配置
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 全局显示配置 (cinema / wallartMode / 屏保键位于根部)
    #[serde(default = "default_display")]
    pub display: Value,
}

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 设备存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// 没有 WebSocket 连接时，超过该秒数未心跳即视为离线
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: u64,
}

fn default_store_path() -> PathBuf {
    PosterramaConfig::base_dir().join("devices.json")
}

fn default_offline_after() -> u64 {
    60
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            offline_after_secs: default_offline_after(),
        }
    }
}

/// MQTT 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "posterrama".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_publish_interval() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: default_broker(),
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            discovery_prefix: default_discovery_prefix(),
            publish_interval_secs: default_publish_interval(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// 出厂显示配置，作为设备覆盖之后的全局回退
pub fn default_display() -> Value {
    json!({
        "transitionIntervalSeconds": 15,
        "transitionEffect": "kenburns",
        "showClearLogo": true,
        "showRottenTomatoes": true,
        "showMetadata": true,
        "showPoster": true,
        "clockWidget": true,
        "cinemaMode": false,
        "cinema": {
            "header": { "enabled": true, "style": "classic" },
            "footer": { "enabled": true, "type": "metadata" },
            "ambilight": { "enabled": true, "strength": 60 }
        },
        "wallartMode": {
            "enabled": false,
            "density": "medium",
            "refreshRate": 6,
            "randomness": 3,
            "animationType": "fade",
            "layoutVariant": "classic",
            "ambientGradient": false,
            "layoutSettings": {
                "heroGrid": { "heroSide": "left", "heroRotationMinutes": 10 }
            }
        }
    })
}

impl PosterramaConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default_with_display());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| PosterramaError::Config(format!("读取配置失败: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PosterramaError::Config(format!("解析配置失败: {}", e)))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PosterramaError::Config(format!("创建目录失败: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PosterramaError::Config(format!("序列化配置失败: {}", e)))?;

        fs::write(path, content)
            .map_err(|e| PosterramaError::Config(format!("写入配置失败: {}", e)))?;

        Ok(())
    }

    /// `#[derive(Default)]` 给出的 display 是 `Null`，这里补上出厂显示配置
    pub fn default_with_display() -> Self {
        Self {
            display: default_display(),
            ..Self::default()
        }
    }

    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".posterrama")
    }

    pub fn default_path() -> PathBuf {
        Self::base_dir().join("config.json")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
