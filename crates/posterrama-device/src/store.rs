//! 设备存储
//!
//! 持久化设备记录 (id、设置覆盖、客户端信息、连接/电源/固定状态)。
//! 能力层只通过 [`DeviceStore`] 读写设备，不持有任何设备状态。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::device::{ClientInfo, ConnectionStatus, CurrentState, DevicePatch, DeviceRecord};
use crate::error::{DeviceError, DeviceResult};
use crate::transport::DeviceCommand;

/// 客户端心跳上报
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub current_state: Option<CurrentState>,
}

/// 设备注册请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> DeviceResult<Option<DeviceRecord>>;

    async fn get_all(&self) -> DeviceResult<Vec<DeviceRecord>>;

    /// 浅合并顶层字段并返回更新后的记录
    async fn patch_device(&self, id: &str, patch: DevicePatch) -> DeviceResult<DeviceRecord>;

    async fn verify_device(&self, id: &str, secret: &str) -> DeviceResult<bool>;

    /// 取出并清空排队的指令
    async fn pop_commands(&self, id: &str) -> DeviceResult<Vec<DeviceCommand>>;

    async fn queue_command(&self, id: &str, command: DeviceCommand) -> DeviceResult<()>;

    /// 记录心跳并返回待投递的指令
    async fn update_heartbeat(&self, id: &str, heartbeat: Heartbeat) -> DeviceResult<Vec<DeviceCommand>>;

    /// 注册新设备，返回记录和明文密钥 (只返回这一次)
    async fn register_device(&self, request: RegisterRequest) -> DeviceResult<(DeviceRecord, String)>;

    async fn set_connection(&self, id: &str, connected: bool) -> DeviceResult<()>;
}

pub fn hash_secret(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// 基于 JSON 文件的设备存储
///
/// 内存中以 `RwLock<HashMap>` 保存，每次修改后整体写回磁盘
/// (先写临时文件再重命名)。`path` 为 `None` 时只在内存中工作。
pub struct FileDeviceStore {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
    path: Option<PathBuf>,
}

impl FileDeviceStore {
    pub fn in_memory() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            path: None,
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> DeviceResult<Self> {
        let path = path.into();
        let devices = Self::load(&path).await?;
        info!("Loaded {} device(s) from {}", devices.len(), path.display());

        Ok(Self {
            devices: Arc::new(RwLock::new(devices)),
            path: Some(path),
        })
    }

    pub async fn from_config(config: &posterrama_core::DevicesConfig) -> DeviceResult<Self> {
        Self::open(config.store_path.clone()).await
    }

    /// 直接放入一条记录 (测试与数据迁移使用)
    pub async fn insert(&self, device: DeviceRecord) -> DeviceResult<()> {
        let mut devices = self.devices.write().await;
        devices.insert(device.id.clone(), device);
        self.persist(&devices).await
    }

    async fn load(path: &Path) -> DeviceResult<HashMap<String, DeviceRecord>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let records: Vec<DeviceRecord> = serde_json::from_str(&content)?;
        // 启动时不存在任何连接
        Ok(records
            .into_iter()
            .map(|mut d| {
                d.ws_connected = false;
                d.status = ConnectionStatus::Offline;
                (d.id.clone(), d)
            })
            .collect())
    }

    async fn persist(&self, devices: &HashMap<String, DeviceRecord>) -> DeviceResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut records: Vec<&DeviceRecord> = devices.values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let content = serde_json::to_string_pretty(&records)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Persisted {} device(s) to {}", records.len(), path.display());
        Ok(())
    }

    async fn mutate<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut DeviceRecord) -> T + Send,
    ) -> DeviceResult<T> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        let result = f(device);
        self.persist(&devices).await?;
        Ok(result)
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn get_by_id(&self, id: &str) -> DeviceResult<Option<DeviceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices.get(id).cloned())
    }

    async fn get_all(&self) -> DeviceResult<Vec<DeviceRecord>> {
        let devices = self.devices.read().await;
        let mut all: Vec<DeviceRecord> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn patch_device(&self, id: &str, patch: DevicePatch) -> DeviceResult<DeviceRecord> {
        self.mutate(id, |device| {
            patch.apply_to(device);
            device.clone()
        })
        .await
    }

    async fn verify_device(&self, id: &str, secret: &str) -> DeviceResult<bool> {
        let devices = self.devices.read().await;
        let Some(device) = devices.get(id) else {
            return Ok(false);
        };
        if device.secret_hash.is_empty() {
            warn!("Device {} has no secret, refusing verification", id);
            return Ok(false);
        }
        Ok(device.secret_hash == hash_secret(secret))
    }

    async fn pop_commands(&self, id: &str) -> DeviceResult<Vec<DeviceCommand>> {
        self.mutate(id, |device| std::mem::take(&mut device.pending_commands))
            .await
    }

    async fn queue_command(&self, id: &str, command: DeviceCommand) -> DeviceResult<()> {
        self.mutate(id, |device| device.pending_commands.push(command))
            .await
    }

    async fn update_heartbeat(&self, id: &str, heartbeat: Heartbeat) -> DeviceResult<Vec<DeviceCommand>> {
        self.mutate(id, |device| {
            if let Some(client_info) = heartbeat.client_info {
                device.client_info = client_info;
            }
            if let Some(current_state) = heartbeat.current_state {
                device.current_state = current_state;
            }
            device.last_seen_at = Some(Utc::now());
            device.status = ConnectionStatus::Online;
            std::mem::take(&mut device.pending_commands)
        })
        .await
    }

    async fn register_device(&self, request: RegisterRequest) -> DeviceResult<(DeviceRecord, String)> {
        let secret = generate_secret();
        let mut device = DeviceRecord::new(uuid::Uuid::new_v4().to_string());
        device.name = request.name.unwrap_or_default();
        device.location = request.location;
        device.client_info = request.client_info.unwrap_or_default();
        device.secret_hash = hash_secret(&secret);

        let mut devices = self.devices.write().await;
        devices.insert(device.id.clone(), device.clone());
        self.persist(&devices).await?;

        info!("Registered device {} ({})", device.id, device.display_name());
        Ok((device, secret))
    }

    async fn set_connection(&self, id: &str, connected: bool) -> DeviceResult<()> {
        self.mutate(id, |device| {
            device.ws_connected = connected;
            if connected {
                device.status = ConnectionStatus::Online;
                device.last_seen_at = Some(Utc::now());
            } else {
                device.status = ConnectionStatus::Offline;
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceCommand, PLAYBACK_NEXT, POWER_OFF};
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_verify() {
        let store = FileDeviceStore::in_memory();
        let (device, secret) = store
            .register_device(RegisterRequest {
                name: Some("Lobby".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(secret.len(), 32);
        assert!(store.verify_device(&device.id, &secret).await.unwrap());
        assert!(!store.verify_device(&device.id, "wrong").await.unwrap());
        assert!(!store.verify_device("ghost", &secret).await.unwrap());
    }

    #[tokio::test]
    async fn test_patch_unknown_device() {
        let store = FileDeviceStore::in_memory();
        let err = store
            .patch_device("ghost", DevicePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_patch_replaces_top_level_override() {
        let store = FileDeviceStore::in_memory();
        store
            .insert(DeviceRecord::new("d1").with_settings_override(json!({ "cinema": { "header": { "enabled": true } } })))
            .await
            .unwrap();

        let updated = store
            .patch_device("d1", DevicePatch::settings_override(json!({ "mode": "cinema" })))
            .await
            .unwrap();
        assert_eq!(updated.settings_override, json!({ "mode": "cinema" }));
    }

    #[tokio::test]
    async fn test_queue_and_heartbeat_drain() {
        let store = FileDeviceStore::in_memory();
        store.insert(DeviceRecord::new("d1")).await.unwrap();

        store.queue_command("d1", DeviceCommand::simple(PLAYBACK_NEXT)).await.unwrap();
        store.queue_command("d1", DeviceCommand::simple(POWER_OFF)).await.unwrap();

        let pending = store
            .update_heartbeat(
                "d1",
                Heartbeat {
                    current_state: Some(CurrentState {
                        title: Some("Alien".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].command_type, PLAYBACK_NEXT);

        let device = store.get_by_id("d1").await.unwrap().unwrap();
        assert_eq!(device.current_state.title.as_deref(), Some("Alien"));
        assert!(device.last_seen_at.is_some());
        assert!(store.pop_commands("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let id = {
            let store = FileDeviceStore::open(&path).await.unwrap();
            let (device, _) = store.register_device(RegisterRequest::default()).await.unwrap();
            store
                .patch_device(&device.id, DevicePatch::settings_override(json!({ "mode": "wallart" })))
                .await
                .unwrap();
            device.id
        };

        let reopened = FileDeviceStore::open(&path).await.unwrap();
        let device = reopened.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(device.settings_override, json!({ "mode": "wallart" }));
        assert_eq!(reopened.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_resets_connection_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        {
            let store = FileDeviceStore::open(&path).await.unwrap();
            store.insert(DeviceRecord::new("d1")).await.unwrap();
            store.set_connection("d1", true).await.unwrap();
        }

        let reopened = FileDeviceStore::open(&path).await.unwrap();
        let device = reopened.get_by_id("d1").await.unwrap().unwrap();
        assert!(!device.ws_connected);
        assert_eq!(device.status, ConnectionStatus::Offline);
        assert!(device.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_set_connection() {
        let store = FileDeviceStore::in_memory();
        store.insert(DeviceRecord::new("d1")).await.unwrap();

        store.set_connection("d1", true).await.unwrap();
        let device = store.get_by_id("d1").await.unwrap().unwrap();
        assert!(device.ws_connected);
        assert_eq!(device.status, ConnectionStatus::Online);

        store.set_connection("d1", false).await.unwrap();
        let device = store.get_by_id("d1").await.unwrap().unwrap();
        assert_eq!(device.status, ConnectionStatus::Offline);
    }
}
