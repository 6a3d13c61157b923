//! MQTT / Home Assistant 桥接
//!
//! 把每台设备的可用能力发布为 Home Assistant 自动发现实体，周期性
//! 推送状态，并把 `.../set` 主题上的命令转交给能力注册表执行。
//! 设备离开某个模式后不再可用的能力，会收到空的保留发现消息以移除实体。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use posterrama_core::MqttConfig;
use posterrama_device::capabilities::{Capability, EntityKind, coerce_switch, connection_status};
use posterrama_device::{CapabilityRegistry, DeviceError, DeviceRecord, DeviceResult, DeviceStore};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, Publish, QoS};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 主题布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTopics {
    pub prefix: String,
    pub discovery_prefix: String,
}

impl MqttTopics {
    pub fn new(prefix: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(&config.topic_prefix, &config.discovery_prefix)
    }

    pub fn state(&self, device_id: &str, capability_id: &str) -> String {
        format!("{}/device/{}/{}/state", self.prefix, device_id, capability_id)
    }

    pub fn command(&self, device_id: &str, capability_id: &str) -> String {
        format!("{}/device/{}/{}/set", self.prefix, device_id, capability_id)
    }

    pub fn availability(&self, device_id: &str) -> String {
        format!("{}/device/{}/availability", self.prefix, device_id)
    }

    pub fn bridge_availability(&self) -> String {
        format!("{}/bridge/availability", self.prefix)
    }

    /// 订阅所有设备命令的通配主题
    pub fn command_filter(&self) -> String {
        format!("{}/device/+/+/set", self.prefix)
    }

    pub fn discovery(&self, component: &str, device_id: &str, capability_id: &str) -> String {
        format!(
            "{}/{}/posterrama_{}/{}/config",
            self.discovery_prefix,
            component,
            device_id,
            capability_id.replace('.', "_")
        )
    }

    /// 从命令主题中解析出 (设备 id, 能力 id)
    pub fn parse_command(&self, topic: &str) -> Option<(String, String)> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix("/device/")?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(capability), Some("set"), None) if !device.is_empty() && !capability.is_empty() => {
                Some((device.to_string(), capability.to_string()))
            }
            _ => None,
        }
    }
}

/// Home Assistant 组件类型
pub fn component_for(entity: &EntityKind) -> &'static str {
    match entity {
        EntityKind::Camera => "image",
        other => other.name(),
    }
}

/// 生成单个能力的自动发现配置
pub fn discovery_payload(topics: &MqttTopics, device: &DeviceRecord, capability: &Capability) -> Value {
    let object_id = format!("posterrama_{}_{}", device.id, capability.id.replace('.', "_"));
    let mut device_block = json!({
        "identifiers": [format!("posterrama_{}", device.id)],
        "name": format!("Posterrama {}", device.display_name()),
        "manufacturer": "Posterrama",
        "model": "Display",
    });
    if let Some(location) = &device.location {
        device_block["suggested_area"] = json!(location);
    }

    let mut obj = Map::new();
    obj.insert("name".to_string(), json!(capability.name));
    obj.insert("unique_id".to_string(), json!(object_id));
    obj.insert("object_id".to_string(), json!(object_id));
    obj.insert("availability_mode".to_string(), json!("all"));
    obj.insert(
        "availability".to_string(),
        json!([
            { "topic": topics.bridge_availability() },
            { "topic": topics.availability(&device.id) }
        ]),
    );
    obj.insert("device".to_string(), device_block);
    if let Some(icon) = &capability.icon {
        obj.insert("icon".to_string(), json!(icon));
    }

    let state_topic = topics.state(&device.id, &capability.id);
    match &capability.entity {
        EntityKind::Camera => {
            obj.insert("url_topic".to_string(), json!(state_topic));
        }
        _ if capability.has_state() => {
            obj.insert("state_topic".to_string(), json!(state_topic));
        }
        _ => {}
    }

    if !capability.entity.is_read_only() {
        obj.insert("command_topic".to_string(), json!(topics.command(&device.id, &capability.id)));
    }

    match &capability.entity {
        EntityKind::Switch => {
            obj.insert("payload_on".to_string(), json!("ON"));
            obj.insert("payload_off".to_string(), json!("OFF"));
        }
        EntityKind::Select { options } => {
            obj.insert("options".to_string(), json!(options));
        }
        EntityKind::Number { min, max, step, unit } => {
            obj.insert("min".to_string(), json!(min));
            obj.insert("max".to_string(), json!(max));
            obj.insert("step".to_string(), json!(step));
            obj.insert("mode".to_string(), json!("box"));
            if let Some(unit) = unit {
                obj.insert("unit_of_measurement".to_string(), json!(unit));
            }
        }
        EntityKind::Sensor { unit: Some(unit) } => {
            obj.insert("unit_of_measurement".to_string(), json!(unit));
        }
        _ => {}
    }

    Value::Object(obj)
}

/// 把命令载荷按实体类型解码成注册表接受的值
pub fn decode_command(capability: &Capability, payload: &[u8]) -> DeviceResult<Value> {
    let text = String::from_utf8_lossy(payload).trim().to_string();
    match &capability.entity {
        EntityKind::Button => Ok(Value::Null),
        EntityKind::Switch => coerce_switch(&capability.id, &json!(text)).map(Value::Bool),
        EntityKind::Number { .. } => text
            .parse::<f64>()
            .map(|n| json!(n))
            .map_err(|_| DeviceError::invalid(&capability.id, format!("expected number, got '{}'", text))),
        EntityKind::Select { .. } => Ok(Value::String(text)),
        EntityKind::Sensor { .. } | EntityKind::Camera => Err(DeviceError::invalid(&capability.id, "read-only entity")),
    }
}

/// 状态值转 MQTT 载荷
pub fn encode_state(entity: &EntityKind, value: &Value) -> String {
    match (entity, value) {
        (_, Value::Null) => String::new(),
        (EntityKind::Switch, Value::Bool(on)) => (if *on { "ON" } else { "OFF" }).to_string(),
        (_, Value::String(s)) => s.clone(),
        (_, other) => other.to_string(),
    }
}

pub struct MqttBridge {
    client: AsyncClient,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn DeviceStore>,
    topics: MqttTopics,
    offline_after_secs: u64,
    /// 每台设备已发布的 (能力 id → 组件)，用于移除失效实体
    published: Mutex<HashMap<String, HashMap<String, &'static str>>>,
}

const REQUEST_CAPACITY: usize = 64;

impl MqttBridge {
    /// 建立客户端并启动事件循环与周期发布任务
    pub fn start(
        config: &MqttConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (bridge, eventloop) = Self::build(config, registry, REQUEST_CAPACITY);
        let bridge = Arc::new(bridge);

        info!("MQTT bridge connecting to {}:{}", config.broker, config.port);
        let interval = Duration::from_secs(config.publish_interval_secs.max(1));
        let handles = vec![
            tokio::spawn(bridge.clone().run_eventloop(eventloop)),
            tokio::spawn(bridge.clone().run_publisher(interval)),
        ];
        (bridge, handles)
    }

    fn build(config: &MqttConfig, registry: Arc<CapabilityRegistry>, capacity: usize) -> (Self, EventLoop) {
        let topics = MqttTopics::from_config(config);
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("posterrama-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

        let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_last_will(LastWill::new(
            topics.bridge_availability(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, capacity);
        let ctx = registry.context();
        let bridge = Self {
            client,
            store: ctx.store.clone(),
            offline_after_secs: ctx.offline_after_secs,
            registry,
            topics,
            published: Mutex::new(HashMap::new()),
        };
        (bridge, eventloop)
    }

    async fn run_eventloop(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    if let Err(e) = self.on_connected().await {
                        warn!("MQTT post-connect setup failed: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let bridge = self.clone();
                    tokio::spawn(async move { bridge.on_publish(publish).await });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}, retrying in 5s", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn on_connected(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(self.topics.command_filter(), QoS::AtLeastOnce)
            .await?;
        self.client
            .publish(self.topics.bridge_availability(), QoS::AtLeastOnce, true, "online")
            .await?;
        // 重连后 broker 可能丢失了非保留状态，强制整体重发
        self.published.lock().await.clear();
        Ok(())
    }

    async fn on_publish(&self, publish: Publish) {
        let Some((device_id, capability_id)) = self.topics.parse_command(&publish.topic) else {
            debug!(topic = %publish.topic, "Ignoring MQTT message");
            return;
        };

        match self.handle_command(&device_id, &capability_id, &publish.payload).await {
            Ok(()) => {
                // 立即回推该设备状态，HA 不必等下一轮
                if let Err(e) = self.publish_device_by_id(&device_id).await {
                    debug!(device = %device_id, "State refresh after command failed: {}", e);
                }
            }
            Err(e) => warn!(device = %device_id, capability = %capability_id, "MQTT command failed: {}", e),
        }
    }

    pub async fn handle_command(&self, device_id: &str, capability_id: &str, payload: &[u8]) -> DeviceResult<()> {
        let capability = self
            .registry
            .get(capability_id)
            .ok_or_else(|| DeviceError::UnknownCapability(capability_id.to_string()))?;
        let value = decode_command(&capability, payload)?;
        info!(device = %device_id, capability = %capability_id, "Capability command via MQTT");
        capability.execute(device_id, value).await
    }

    async fn run_publisher(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.publish_all().await {
                error!("MQTT publish cycle failed: {}", e);
            }
        }
    }

    pub async fn publish_all(&self) -> DeviceResult<()> {
        for device in self.store.get_all().await? {
            if let Err(e) = self.publish_device(&device).await {
                warn!(device = %device.id, "MQTT publish failed: {}", e);
            }
        }
        Ok(())
    }

    async fn publish_device_by_id(&self, device_id: &str) -> DeviceResult<()> {
        match self.store.get_by_id(device_id).await? {
            Some(device) => self.publish_device(&device).await,
            None => Ok(()),
        }
    }

    async fn publish(&self, topic: String, retain: bool, payload: impl Into<Vec<u8>>) -> DeviceResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| DeviceError::Transport(format!("MQTT publish failed: {}", e)))
    }

    /// 发布设备可用性、发现配置与状态；移除不再可用的实体
    ///
    /// 全部发布成功后才记录本轮实体集合，失败的部分在下一轮重发。
    pub async fn publish_device(&self, device: &DeviceRecord) -> DeviceResult<()> {
        let status = connection_status(device, self.offline_after_secs);
        self.publish(self.topics.availability(&device.id), true, status).await?;

        let available = self.registry.get_available_capabilities(device);
        let current: HashMap<String, &'static str> = available
            .iter()
            .map(|c| (c.id.clone(), component_for(&c.entity)))
            .collect();

        let previous = self
            .published
            .lock()
            .await
            .get(&device.id)
            .cloned()
            .unwrap_or_default();

        for (capability_id, component) in &previous {
            if !current.contains_key(capability_id) {
                debug!(device = %device.id, capability = %capability_id, "Removing MQTT entity");
                self.publish(self.topics.discovery(component, &device.id, capability_id), true, Vec::<u8>::new())
                    .await?;
            }
        }

        let already: HashSet<&String> = previous.keys().collect();
        for capability in &available {
            if !already.contains(&capability.id) {
                let config = discovery_payload(&self.topics, device, capability);
                self.publish(
                    self.topics.discovery(component_for(&capability.entity), &device.id, &capability.id),
                    true,
                    config.to_string(),
                )
                .await?;
            }

            if let Some(state) = capability.state(device) {
                self.publish(
                    self.topics.state(&device.id, &capability.id),
                    true,
                    encode_state(&capability.entity, &state),
                )
                .await?;
            }
        }

        self.published.lock().await.insert(device.id.clone(), current);
        Ok(())
    }

    #[cfg(test)]
    async fn published_for(&self, device_id: &str) -> Option<HashMap<String, &'static str>> {
        self.published.lock().await.get(device_id).cloned()
    }
}
