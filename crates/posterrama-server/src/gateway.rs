//! 网关服务

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use posterrama_core::{PosterramaConfig, PosterramaError};
use posterrama_device::{CapabilityContext, CapabilityRegistry, DeviceStore, FileDeviceStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::device_api::{DeviceApiState, create_device_router};
use crate::mqtt::MqttBridge;
use crate::ws_hub::{WsHub, ws_router};

/// 组装 HTTP 路由：能力 API + 设备 WebSocket
pub fn create_router(registry: Arc<CapabilityRegistry>, hub: Arc<WsHub>) -> Router {
    Router::new()
        .merge(create_device_router(DeviceApiState::new(registry)))
        .merge(ws_router(hub))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

pub struct Gateway {
    config: PosterramaConfig,
    registry: Arc<CapabilityRegistry>,
    hub: Arc<WsHub>,
}

impl Gateway {
    /// 打开设备存储并构建注册表；WebSocket 通道即注册表的命令通道
    pub async fn new(config: PosterramaConfig) -> posterrama_core::Result<Self> {
        let store: Arc<dyn DeviceStore> = Arc::new(
            FileDeviceStore::from_config(&config.devices)
                .await
                .map_err(|e| PosterramaError::Device(format!("打开设备存储失败: {}", e)))?,
        );
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: PosterramaConfig, store: Arc<dyn DeviceStore>) -> Self {
        let hub = Arc::new(WsHub::new(store.clone()));
        let ctx = CapabilityContext::new(store, hub.clone())
            .with_display_defaults(config.display.clone())
            .with_offline_after(config.devices.offline_after_secs);
        let registry = Arc::new(CapabilityRegistry::with_builtins(ctx));

        Self { config, registry, hub }
    }

    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Router {
        create_router(self.registry.clone(), self.hub.clone())
    }

    /// 启动服务
    pub async fn start(&self) -> posterrama_core::Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|e| PosterramaError::Config(format!("无效的监听地址 {}: {}", self.config.bind_addr(), e)))?;

        let _mqtt = if self.config.mqtt.enabled {
            Some(MqttBridge::start(&self.config.mqtt, self.registry.clone()))
        } else {
            None
        };

        tracing::info!("Posterrama gateway starting on {}", addr);
        tracing::info!(
            "Capabilities registered: {}, MQTT bridge: {}",
            self.registry.len(),
            if self.config.mqtt.enabled { "enabled" } else { "disabled" }
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PosterramaError::Network(format!("绑定地址失败: {}", e)))?;

        axum::serve(listener, self.router())
            .await
            .map_err(|e| PosterramaError::Unknown(e.to_string()))?;

        Ok(())
    }
}
