//! Posterrama Device - 设备能力注册与命令路由
//!
//! 提供设备记录模型、设置解析、设备存储、命令通道抽象，
//! 以及按设备状态过滤的能力注册表。

pub mod capabilities;
pub mod device;
pub mod error;
pub mod settings;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capabilities::{
    Capability, CapabilityCategory, CapabilityContext, CapabilityInfo, CapabilityRegistry, CapabilitySpec,
    EntityKind,
};
pub use device::*;
pub use error::*;
pub use store::{DeviceStore, FileDeviceStore, Heartbeat, RegisterRequest};
pub use transport::*;
