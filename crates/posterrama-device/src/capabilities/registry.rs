//! 能力注册表
//!
//! 保存能力 id → 能力的映射，负责注册、查询、按设备过滤可用能力，
//! 以及把命令转交给能力的处理器。映射在 `init()`/`register()` 时写入，
//! 之后以读为主，用读写锁保护。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Capability, CapabilityInfo, CapabilitySpec, control, display, sensors};
use crate::device::{DevicePatch, DeviceRecord};
use crate::error::{DeviceError, DeviceResult};
use crate::settings::deep_merge_settings;
use crate::store::DeviceStore;
use crate::transport::{CommandTransport, DeliveryStatus, DeviceCommand};

/// 处理器运行时依赖
#[derive(Clone)]
pub struct CapabilityContext {
    pub store: Arc<dyn DeviceStore>,
    pub transport: Arc<dyn CommandTransport>,
    /// 全局显示配置，设置解析的回退层
    pub display_defaults: Arc<Value>,
    /// 无 WebSocket 时判定离线的心跳超时
    pub offline_after_secs: u64,
}

impl CapabilityContext {
    pub fn new(store: Arc<dyn DeviceStore>, transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            store,
            transport,
            display_defaults: Arc::new(posterrama_core::default_display()),
            offline_after_secs: 60,
        }
    }

    pub fn with_display_defaults(mut self, display: Value) -> Self {
        self.display_defaults = Arc::new(display);
        self
    }

    pub fn with_offline_after(mut self, secs: u64) -> Self {
        self.offline_after_secs = secs;
        self
    }

    /// 读取设备，不存在时返回 `Device not found: <id>`
    pub async fn load_device(&self, device_id: &str) -> DeviceResult<DeviceRecord> {
        self.store
            .get_by_id(device_id)
            .await?
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))
    }

    /// 读-改-写：把 `change` 深合并进设备的 settingsOverride 并持久化
    ///
    /// 同一设备的并发调用之间没有互斥，后写入者覆盖先写入者。
    pub async fn merge_settings_override(&self, device_id: &str, change: &Value) -> DeviceResult<DeviceRecord> {
        let device = self.load_device(device_id).await?;
        let merged = deep_merge_settings(&device.settings_override, change);
        self.store
            .patch_device(device_id, DevicePatch::settings_override(merged))
            .await
    }

    pub async fn relay(&self, device_id: &str, command: DeviceCommand) -> DeviceResult<DeliveryStatus> {
        debug!(device = %device_id, command = %command.command_type, "Relaying command");
        self.transport.send_command(device_id, command).await
    }
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<Arc<Capability>>,
    index: HashMap<String, usize>,
}

pub struct CapabilityRegistry {
    ctx: CapabilityContext,
    inner: RwLock<RegistryInner>,
    initialized: AtomicBool,
}

impl CapabilityRegistry {
    pub fn new(ctx: CapabilityContext) -> Self {
        Self {
            ctx,
            inner: RwLock::new(RegistryInner::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// 创建并注册内置能力
    pub fn with_builtins(ctx: CapabilityContext) -> Self {
        let registry = Self::new(ctx);
        registry.init();
        registry
    }

    pub fn context(&self) -> &CapabilityContext {
        &self.ctx
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 注册内置能力集；重复调用只记录警告
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Capability registry already initialized, skipping");
            return;
        }

        control::register_playback(self);
        control::register_power(self);
        control::register_navigation(self);
        control::register_management(self);
        control::register_mode(self);
        display::register_display_settings(self);
        sensors::register_camera(self);
        sensors::register_media_sensors(self);
        sensors::register_device_sensors(self);

        info!("Capability registry initialized with {} capabilities", self.len());
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 插入或覆盖；覆盖时保留原位置并返回旧能力
    pub fn register(&self, id: impl Into<String>, spec: CapabilitySpec) -> Option<Arc<Capability>> {
        let id = id.into();
        let capability = Arc::new(Capability::from_spec(id.clone(), spec));
        let mut inner = self.write();

        match inner.index.get(&id).copied() {
            Some(position) => {
                warn!(capability = %id, "Capability already registered, overwriting");
                Some(std::mem::replace(&mut inner.order[position], capability))
            }
            None => {
                info!(capability = %id, entity = capability.entity.name(), "Registered capability");
                let position = inner.order.len();
                inner.order.push(capability);
                inner.index.insert(id, position);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Capability>> {
        let inner = self.read();
        inner.index.get(id).map(|&position| inner.order[position].clone())
    }

    pub fn has(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全量快照，按注册顺序
    pub fn get_all_capabilities(&self) -> Vec<Arc<Capability>> {
        self.read().order.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().order.iter().map(|c| c.id.clone()).collect()
    }

    pub fn infos(&self) -> Vec<CapabilityInfo> {
        self.read().order.iter().map(|c| c.info()).collect()
    }

    /// 过滤出对该设备当前可用的能力
    ///
    /// 判断失败 (返回错误或 panic) 的能力被排除并记录日志，不会中断枚举。
    pub fn get_available_capabilities(&self, device: &DeviceRecord) -> Vec<Arc<Capability>> {
        self.get_all_capabilities()
            .into_iter()
            .filter(|capability| capability.is_available(device))
            .collect()
    }

    /// 读取能力在该设备上的当前状态；未知能力或无状态读取器时为 `None`
    pub fn state_of(&self, capability_id: &str, device: &DeviceRecord) -> Option<Value> {
        self.get(capability_id).and_then(|capability| capability.state(device))
    }

    /// 按 id 执行命令
    pub async fn execute(&self, capability_id: &str, device_id: &str, value: Value) -> DeviceResult<()> {
        let capability = self
            .get(capability_id)
            .ok_or_else(|| DeviceError::UnknownCapability(capability_id.to_string()))?;

        debug!(capability = %capability_id, device = %device_id, value = %value, "Executing capability");
        capability.execute(device_id, value).await
    }
}
