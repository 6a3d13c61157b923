//! 测试替身：记录调用的内存存储与命令通道

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::device::{ConnectionStatus, DevicePatch, DeviceRecord};
use crate::error::{DeviceError, DeviceResult};
use crate::store::{DeviceStore, Heartbeat, RegisterRequest, hash_secret};
use crate::transport::{CommandTransport, DeliveryStatus, DeviceCommand};

/// 内存设备存储，记录每一次 `patch_device` 调用
#[derive(Clone, Default)]
pub struct RecordingStore {
    devices: Arc<Mutex<HashMap<String, DeviceRecord>>>,
    patches: Arc<Mutex<Vec<(String, DevicePatch)>>>,
    should_fail: Arc<Mutex<bool>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: DeviceRecord) {
        self.devices.lock().unwrap().insert(device.id.clone(), device);
    }

    pub fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().get(id).cloned()
    }

    pub fn patches(&self) -> Vec<(String, DevicePatch)> {
        self.patches.lock().unwrap().clone()
    }

    /// 读写都失败
    pub fn set_should_fail(&self, should_fail: bool) {
        *self.should_fail.lock().unwrap() = should_fail;
    }

    /// 只有 `patch_device` 失败
    pub fn set_fail_writes(&self, fail_writes: bool) {
        *self.fail_writes.lock().unwrap() = fail_writes;
    }

    fn check_failure(&self, id: &str, write: bool) -> DeviceResult<()> {
        if *self.should_fail.lock().unwrap() || (write && *self.fail_writes.lock().unwrap()) {
            return Err(DeviceError::Store(format!("mock store failure for {}", id)));
        }
        Ok(())
    }

    fn with_device<T>(&self, id: &str, f: impl FnOnce(&mut DeviceRecord) -> T) -> DeviceResult<T> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        Ok(f(device))
    }
}

#[async_trait]
impl DeviceStore for RecordingStore {
    async fn get_by_id(&self, id: &str) -> DeviceResult<Option<DeviceRecord>> {
        self.check_failure(id, false)?;
        Ok(self.get(id))
    }

    async fn get_all(&self) -> DeviceResult<Vec<DeviceRecord>> {
        let mut all: Vec<DeviceRecord> = self.devices.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn patch_device(&self, id: &str, patch: DevicePatch) -> DeviceResult<DeviceRecord> {
        self.check_failure(id, true)?;
        let recorded = patch.clone();
        let device = self.with_device(id, |device| {
            patch.apply_to(device);
            device.clone()
        })?;
        self.patches.lock().unwrap().push((id.to_string(), recorded));
        Ok(device)
    }

    async fn verify_device(&self, id: &str, secret: &str) -> DeviceResult<bool> {
        Ok(self
            .get(id)
            .map(|device| !device.secret_hash.is_empty() && device.secret_hash == hash_secret(secret))
            .unwrap_or(false))
    }

    async fn pop_commands(&self, id: &str) -> DeviceResult<Vec<DeviceCommand>> {
        self.with_device(id, |device| std::mem::take(&mut device.pending_commands))
    }

    async fn queue_command(&self, id: &str, command: DeviceCommand) -> DeviceResult<()> {
        self.with_device(id, |device| device.pending_commands.push(command))
    }

    async fn update_heartbeat(&self, id: &str, heartbeat: Heartbeat) -> DeviceResult<Vec<DeviceCommand>> {
        self.with_device(id, |device| {
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
    }

    async fn register_device(&self, request: RegisterRequest) -> DeviceResult<(DeviceRecord, String)> {
        let secret = "test-secret".to_string();
        let mut device = DeviceRecord::new(format!("device-{}", self.devices.lock().unwrap().len() + 1));
        device.name = request.name.unwrap_or_default();
        device.location = request.location;
        device.client_info = request.client_info.unwrap_or_default();
        device.secret_hash = hash_secret(&secret);
        self.insert(device.clone());
        Ok((device, secret))
    }

    async fn set_connection(&self, id: &str, connected: bool) -> DeviceResult<()> {
        self.with_device(id, |device| {
            device.ws_connected = connected;
            device.status = if connected {
                ConnectionStatus::Online
            } else {
                ConnectionStatus::Offline
            };
        })
    }
}

/// 记录所有发出的指令与设置推送
#[derive(Clone, Default)]
pub struct RecordingTransport {
    commands: Arc<Mutex<Vec<(String, DeviceCommand)>>>,
    applied: Arc<Mutex<Vec<(String, Value)>>>,
    should_fail: Arc<Mutex<bool>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<(String, DeviceCommand)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<(String, Value)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn set_should_fail(&self, should_fail: bool) {
        *self.should_fail.lock().unwrap() = should_fail;
    }

    fn check_failure(&self, device_id: &str) -> DeviceResult<()> {
        if *self.should_fail.lock().unwrap() {
            return Err(DeviceError::Transport(format!("mock transport failure for {}", device_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn send_command(&self, device_id: &str, command: DeviceCommand) -> DeviceResult<DeliveryStatus> {
        self.check_failure(device_id)?;
        self.commands.lock().unwrap().push((device_id.to_string(), command));
        Ok(DeliveryStatus::Sent)
    }

    async fn send_apply_settings(&self, device_id: &str, settings_patch: Value) -> DeviceResult<DeliveryStatus> {
        self.check_failure(device_id)?;
        self.applied.lock().unwrap().push((device_id.to_string(), settings_patch));
        Ok(DeliveryStatus::Sent)
    }
}
