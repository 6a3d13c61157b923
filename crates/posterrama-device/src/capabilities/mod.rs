//! 设备能力模型
//!
//! 每个能力 (capability) 是一个可独立控制/观测的单元，例如“暂停”或
//! “影院底栏开关”。能力由 [`CapabilitySpec`] 声明，注册到
//! [`CapabilityRegistry`] 后成为不可变的 [`Capability`]。

mod coerce;
mod control;
mod display;
mod registry;
mod sensors;

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::device::DeviceRecord;
use crate::error::{DeviceError, DeviceResult};

pub use coerce::{coerce_number, coerce_select, coerce_switch};
pub use registry::{CapabilityContext, CapabilityRegistry};
pub use sensors::{connection_status, sniff_client_type};

pub type Predicate = Arc<dyn Fn(&DeviceRecord) -> DeviceResult<bool> + Send + Sync>;
pub type StateGetter = Arc<dyn Fn(&DeviceRecord) -> Value + Send + Sync>;
pub type CommandHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, DeviceResult<()>> + Send + Sync>;

/// 能力分组，仅用于 UI 展示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Playback,
    Power,
    Navigation,
    Management,
    Mode,
    Settings,
    Camera,
    Sensor,
}

/// 控件形态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "lowercase")]
pub enum EntityKind {
    /// 一次性触发，无值
    Button,
    /// 布尔开关
    Switch,
    Select {
        options: Vec<String>,
    },
    Number {
        min: f64,
        max: f64,
        step: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// 只读
    Sensor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// 只读图片引用
    Camera,
}

impl EntityKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Button => "button",
            EntityKind::Switch => "switch",
            EntityKind::Select { .. } => "select",
            EntityKind::Number { .. } => "number",
            EntityKind::Sensor { .. } => "sensor",
            EntityKind::Camera => "camera",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, EntityKind::Sensor { .. } | EntityKind::Camera)
    }
}

/// 已注册的能力
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: CapabilityCategory,
    pub entity: EntityKind,
    pub icon: Option<String>,
    available_when: Predicate,
    command_handler: Option<CommandHandler>,
    state_getter: Option<StateGetter>,
}

/// 可序列化的能力描述 (不含闭包)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: String,
    pub name: String,
    pub category: CapabilityCategory,
    #[serde(flatten)]
    pub entity: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Capability {
    fn from_spec(id: String, spec: CapabilitySpec) -> Self {
        Self {
            name: spec.name.unwrap_or_else(|| id.clone()),
            id,
            category: spec.category.unwrap_or(CapabilityCategory::Settings),
            entity: spec.entity.unwrap_or(EntityKind::Button),
            icon: spec.icon,
            available_when: spec.available_when.unwrap_or_else(|| Arc::new(|_| Ok(true))),
            command_handler: spec.command_handler,
            state_getter: spec.state_getter,
        }
    }

    /// 原始的可用性判断，错误原样返回
    pub fn try_available(&self, device: &DeviceRecord) -> DeviceResult<bool> {
        match catch_unwind(AssertUnwindSafe(|| (self.available_when)(device))) {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Predicate(format!("{} panicked", self.id))),
        }
    }

    /// 枚举边界使用的安全包装：任何失败都视为不可用
    pub fn is_available(&self, device: &DeviceRecord) -> bool {
        match self.try_available(device) {
            Ok(available) => available,
            Err(e) => {
                error!(capability = %self.id, device = %device.id, "availableWhen failed: {}", e);
                false
            }
        }
    }

    pub fn state(&self, device: &DeviceRecord) -> Option<Value> {
        self.state_getter.as_ref().map(|getter| getter(device))
    }

    pub fn has_state(&self) -> bool {
        self.state_getter.is_some()
    }

    pub fn has_handler(&self) -> bool {
        self.command_handler.is_some()
    }

    /// 执行命令处理器；未声明处理器的能力 (传感器等) 为空操作
    pub fn execute(&self, device_id: &str, value: Value) -> BoxFuture<'static, DeviceResult<()>> {
        match &self.command_handler {
            Some(handler) => handler(device_id.to_string(), value),
            None => Box::pin(async { Ok(()) }),
        }
    }

    pub fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category,
            entity: self.entity.clone(),
            icon: self.icon.clone(),
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("entity", &self.entity)
            .field("has_handler", &self.has_handler())
            .field("has_state", &self.has_state())
            .finish()
    }
}

/// 能力声明
///
/// 未设置的字段在注册时补默认值：名称取 id，分组为 `settings`，
/// 形态为 `button`，始终可用，无处理器 (空操作)，无状态。
#[derive(Default)]
pub struct CapabilitySpec {
    name: Option<String>,
    category: Option<CapabilityCategory>,
    entity: Option<EntityKind>,
    icon: Option<String>,
    available_when: Option<Predicate>,
    command_handler: Option<CommandHandler>,
    state_getter: Option<StateGetter>,
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn category(mut self, category: CapabilityCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn entity(mut self, entity: EntityKind) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn button(self) -> Self {
        self.entity(EntityKind::Button)
    }

    pub fn switch(self) -> Self {
        self.entity(EntityKind::Switch)
    }

    pub fn select<S: Into<String>>(self, options: impl IntoIterator<Item = S>) -> Self {
        self.entity(EntityKind::Select {
            options: options.into_iter().map(Into::into).collect(),
        })
    }

    pub fn number(self, min: f64, max: f64, step: f64, unit: Option<&str>) -> Self {
        self.entity(EntityKind::Number {
            min,
            max,
            step,
            unit: unit.map(str::to_string),
        })
    }

    pub fn sensor(self, unit: Option<&str>) -> Self {
        self.entity(EntityKind::Sensor {
            unit: unit.map(str::to_string),
        })
    }

    pub fn camera(self) -> Self {
        self.entity(EntityKind::Camera)
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn available_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DeviceRecord) -> bool + Send + Sync + 'static,
    {
        self.available_when = Some(Arc::new(move |device| Ok(predicate(device))));
        self
    }

    pub fn try_available_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DeviceRecord) -> DeviceResult<bool> + Send + Sync + 'static,
    {
        self.available_when = Some(Arc::new(predicate));
        self
    }

    pub fn state<F>(mut self, getter: F) -> Self
    where
        F: Fn(&DeviceRecord) -> Value + Send + Sync + 'static,
    {
        self.state_getter = Some(Arc::new(getter));
        self
    }

    pub fn on_command<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DeviceResult<()>> + Send + 'static,
    {
        self.command_handler = Some(Arc::new(move |device_id, value| Box::pin(handler(device_id, value))));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_defaults() {
        let cap = Capability::from_spec("x".to_string(), CapabilitySpec::default());
        assert_eq!(cap.name, "x");
        assert_eq!(cap.category, CapabilityCategory::Settings);
        assert_eq!(cap.entity, EntityKind::Button);
        assert!(cap.is_available(&DeviceRecord::new("d1")));
        assert!(cap.state(&DeviceRecord::new("d1")).is_none());
        assert!(!cap.has_handler());
        assert!(tokio_test::block_on(cap.execute("d1", Value::Null)).is_ok());
    }

    #[tokio::test]
    async fn test_missing_handler_is_noop() {
        let cap = Capability::from_spec("media.title".to_string(), CapabilitySpec::new("Title").sensor(None));
        assert!(cap.execute("d1", Value::Null).await.is_ok());
    }

    #[test]
    fn test_panicking_predicate_is_unavailable() {
        let cap = Capability::from_spec(
            "boom".to_string(),
            CapabilitySpec::new("Boom").available_when(|_| panic!("third-party bug")),
        );
        assert!(!cap.is_available(&DeviceRecord::new("d1")));
        assert!(matches!(cap.try_available(&DeviceRecord::new("d1")), Err(DeviceError::Predicate(_))));
    }

    #[test]
    fn test_info_serializes_flat() {
        let cap = Capability::from_spec(
            "settings.cinema.ambilight.strength".to_string(),
            CapabilitySpec::new("Ambilight Strength")
                .category(CapabilityCategory::Settings)
                .number(0.0, 100.0, 5.0, Some("%")),
        );
        let value = serde_json::to_value(cap.info()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "settings.cinema.ambilight.strength",
                "name": "Ambilight Strength",
                "category": "settings",
                "entityType": "number",
                "min": 0.0,
                "max": 100.0,
                "step": 5.0,
                "unit": "%"
            })
        );
    }
}
