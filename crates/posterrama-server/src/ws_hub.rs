//! 设备 WebSocket 通道
//!
//! 每台在线设备持有一个出站帧队列。能力层通过 [`CommandTransport`]
//! 下发指令：设备在线时直接写入连接，离线时指令进入设备存储排队，
//! 等下一次 hello/心跳时投递；离线设备的设置推送直接丢弃 (覆盖已持久化)。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{Sink, SinkExt, StreamExt};
use posterrama_device::{
    ClientInfo, CommandTransport, CurrentState, DeliveryStatus, DeviceCommand, DeviceError, DeviceResult,
    DeviceStore, Heartbeat,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientFrame {
    Hello {
        #[serde(rename = "deviceId")]
        device_id: String,
        secret: String,
    },
    Heartbeat {
        #[serde(default, rename = "clientInfo")]
        client_info: Option<ClientInfo>,
        #[serde(default, rename = "currentState")]
        current_state: Option<CurrentState>,
    },
    Ack {
        id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Ping,
}

/// 服务端 → 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerFrame {
    HelloAck {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Command {
        id: String,
        #[serde(rename = "type")]
        command_type: String,
        payload: Value,
    },
    ApplySettings {
        payload: Value,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn command(command: DeviceCommand) -> Self {
        ServerFrame::Command {
            id: uuid::Uuid::new_v4().to_string(),
            command_type: command.command_type,
            payload: command.payload,
        }
    }

    /// 未送达的指令帧可以重新排队，设置推送不保留
    fn into_command(self) -> Option<DeviceCommand> {
        match self {
            ServerFrame::Command {
                command_type, payload, ..
            } => Some(DeviceCommand::new(command_type, payload)),
            _ => None,
        }
    }
}

/// hello 通过后的会话：连接已登记，`frames` 待写回客户端
#[derive(Debug)]
pub struct HelloSession {
    pub conn_id: u64,
    pub outbound: mpsc::UnboundedReceiver<ServerFrame>,
    pub frames: Vec<ServerFrame>,
}

struct Connection {
    conn_id: u64,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

pub struct WsHub {
    store: Arc<dyn DeviceStore>,
    connections: RwLock<HashMap<String, Connection>>,
    next_conn_id: AtomicU64,
}

impl WsHub {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// 绑定一条新连接；同一设备的旧连接被替换
    pub async fn attach(&self, device_id: &str) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);

        let previous = self
            .connections
            .write()
            .await
            .insert(device_id.to_string(), Connection { conn_id, sender });
        if previous.is_some() {
            warn!(device = %device_id, "Replacing existing device connection");
        }
        (conn_id, receiver)
    }

    /// 只移除仍属于 `conn_id` 的连接，避免断开重连后的新连接
    pub async fn detach(&self, device_id: &str, conn_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        let owned = connections
            .get(device_id)
            .is_some_and(|conn| conn.conn_id == conn_id);
        if owned {
            connections.remove(device_id);
        }
        owned
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.connections.read().await.contains_key(device_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 写入在线连接，返回帧是否被接受
    async fn push(&self, device_id: &str, frame: ServerFrame) -> bool {
        match self.connections.read().await.get(device_id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// 校验 hello，登记连接，标记在线并取出排队指令
    ///
    /// 返回的会话必须以 [`WsHub::close_session`] 结束。
    pub async fn on_hello(&self, device_id: &str, secret: &str) -> DeviceResult<HelloSession> {
        if !self.store.verify_device(device_id, secret).await? {
            return Err(DeviceError::Unauthorized(device_id.to_string()));
        }

        let (conn_id, outbound) = self.attach(device_id).await;
        let queued = match self.mark_online(device_id).await {
            Ok(queued) => queued,
            Err(e) => {
                self.detach(device_id, conn_id).await;
                return Err(e);
            }
        };
        if !queued.is_empty() {
            info!(device = %device_id, "Flushing {} queued command(s)", queued.len());
        }

        let mut frames = vec![ServerFrame::HelloAck {
            device_id: device_id.to_string(),
        }];
        frames.extend(queued.into_iter().map(ServerFrame::command));
        Ok(HelloSession {
            conn_id,
            outbound,
            frames,
        })
    }

    async fn mark_online(&self, device_id: &str) -> DeviceResult<Vec<DeviceCommand>> {
        self.store.set_connection(device_id, true).await?;
        self.store.pop_commands(device_id).await
    }

    /// 处理已认证连接上的一帧，返回需要回写的帧
    pub async fn on_frame(&self, device_id: &str, frame: ClientFrame) -> DeviceResult<Vec<ServerFrame>> {
        match frame {
            ClientFrame::Hello { .. } => Ok(vec![ServerFrame::Error {
                message: "already authenticated".to_string(),
            }]),
            ClientFrame::Heartbeat {
                client_info,
                current_state,
            } => {
                let pending = self
                    .store
                    .update_heartbeat(
                        device_id,
                        Heartbeat {
                            client_info,
                            current_state,
                        },
                    )
                    .await?;
                Ok(pending.into_iter().map(ServerFrame::command).collect())
            }
            ClientFrame::Ack { id, status } => {
                debug!(device = %device_id, command = %id, status = ?status, "Command acknowledged");
                Ok(Vec::new())
            }
            ClientFrame::Ping => Ok(vec![ServerFrame::Pong]),
        }
    }

    /// 结束会话：未写出的指令 (含出站队列里残留的) 重新排队，再标记离线
    pub async fn close_session(
        &self,
        device_id: &str,
        conn_id: u64,
        unsent: Vec<ServerFrame>,
        mut outbound: mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let owned = self.detach(device_id, conn_id).await;

        outbound.close();
        let mut pending = unsent;
        while let Ok(frame) = outbound.try_recv() {
            pending.push(frame);
        }

        let commands: Vec<DeviceCommand> = pending.into_iter().filter_map(ServerFrame::into_command).collect();
        if !commands.is_empty() {
            info!(device = %device_id, "Re-queueing {} undelivered command(s)", commands.len());
        }
        for command in commands {
            if let Err(e) = self.store.queue_command(device_id, command).await {
                warn!(device = %device_id, "Failed to re-queue command: {}", e);
                break;
            }
        }

        if !owned {
            return;
        }
        if let Err(e) = self.store.set_connection(device_id, false).await {
            warn!(device = %device_id, "Failed to mark device offline: {}", e);
        }
        let online = self.connected_count().await;
        info!(device = %device_id, online, "Device disconnected");
    }
}

#[async_trait]
impl CommandTransport for WsHub {
    async fn send_command(&self, device_id: &str, command: DeviceCommand) -> DeviceResult<DeliveryStatus> {
        if self.push(device_id, ServerFrame::command(command.clone())).await {
            return Ok(DeliveryStatus::Sent);
        }

        debug!(device = %device_id, command = %command.command_type, "Device offline, queueing command");
        self.store.queue_command(device_id, command).await?;
        Ok(DeliveryStatus::Queued)
    }

    async fn send_apply_settings(&self, device_id: &str, settings_patch: Value) -> DeviceResult<DeliveryStatus> {
        if self
            .push(device_id, ServerFrame::ApplySettings { payload: settings_patch })
            .await
        {
            return Ok(DeliveryStatus::Sent);
        }

        debug!(device = %device_id, "Device offline, dropping apply-settings");
        Ok(DeliveryStatus::Dropped)
    }
}

/// 设备 WebSocket 路由
pub fn ws_router(hub: Arc<WsHub>) -> Router {
    Router::new()
        .route("/ws/devices", get(device_websocket))
        .with_state(hub)
}

async fn device_websocket(State(hub): State<Arc<WsHub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device_ws(socket, hub))
}

fn encode(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            None
        }
    }
}

fn decode(text: &str) -> Option<ClientFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Ignoring malformed frame: {}", e);
            None
        }
    }
}

/// 依次写出帧；失败时返回失败的那一帧及其后所有未写出的帧
async fn flush<S>(tx: &mut S, frames: Vec<ServerFrame>) -> Result<(), Vec<ServerFrame>>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut frames = frames.into_iter();
    while let Some(frame) = frames.next() {
        let Some(msg) = encode(&frame) else { continue };
        if let Err(e) = tx.send(msg).await {
            warn!("Failed to send to WebSocket: {}", e);
            let mut unsent = vec![frame];
            unsent.extend(frames);
            return Err(unsent);
        }
    }
    Ok(())
}

async fn handle_device_ws(socket: WebSocket, hub: Arc<WsHub>) {
    let (mut tx, mut rx) = socket.split();

    // 首帧必须是 hello
    let (device_id, session) = loop {
        match rx.next().await {
            Some(Ok(Message::Text(text))) => match decode(&text) {
                Some(ClientFrame::Hello { device_id, secret }) => match hub.on_hello(&device_id, &secret).await {
                    Ok(session) => break (device_id, session),
                    Err(e) => {
                        warn!(device = %device_id, "Device hello rejected: {}", e);
                        let reply = ServerFrame::Error {
                            message: "authentication failed".to_string(),
                        };
                        if let Some(msg) = encode(&reply) {
                            let _ = tx.send(msg).await;
                        }
                        return;
                    }
                },
                Some(ClientFrame::Ping) => {
                    if let Some(msg) = encode(&ServerFrame::Pong) {
                        let _ = tx.send(msg).await;
                    }
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            _ => {}
        }
    };

    let HelloSession {
        conn_id,
        mut outbound,
        frames,
    } = session;
    let online = hub.connected_count().await;
    info!(device = %device_id, online, "Device connected");

    let mut unsent = match flush(&mut tx, frames).await {
        Ok(()) => Vec::new(),
        Err(rest) => rest,
    };

    while unsent.is_empty() {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(frame) = decode(&text) else { continue };
                        let replies = match hub.on_frame(&device_id, frame).await {
                            Ok(replies) => replies,
                            Err(e) => {
                                warn!(device = %device_id, "Failed to handle frame: {}", e);
                                vec![ServerFrame::Error { message: e.to_string() }]
                            }
                        };
                        if let Err(rest) = flush(&mut tx, replies).await {
                            unsent = rest;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(device = %device_id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(rest) = flush(&mut tx, vec![frame]).await {
                    unsent = rest;
                }
            }
        }
    }

    hub.close_session(&device_id, conn_id, unsent, outbound).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use posterrama_device::DeviceRecord;
    use posterrama_device::store::hash_secret;
    use posterrama_device::testing::RecordingStore;
    use posterrama_device::transport::{MODE_NAVIGATE, PLAYBACK_NEXT, POWER_OFF};
    use serde_json::json;

    fn hub_with_device() -> (Arc<RecordingStore>, WsHub) {
        let store = Arc::new(RecordingStore::new());
        let mut device = DeviceRecord::new("d1");
        device.secret_hash = hash_secret("s3cret");
        store.insert(device);
        let hub = WsHub::new(store.clone());
        (store, hub)
    }

    #[test]
    fn test_frame_wire_shape() {
        let hello: ClientFrame = serde_json::from_str(r#"{"kind":"hello","deviceId":"d1","secret":"x"}"#).unwrap();
        assert_eq!(
            hello,
            ClientFrame::Hello {
                device_id: "d1".to_string(),
                secret: "x".to_string()
            }
        );

        let frame = ServerFrame::Command {
            id: "c1".to_string(),
            command_type: MODE_NAVIGATE.to_string(),
            payload: json!({ "mode": "cinema" }),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "kind": "command", "id": "c1", "type": "mode.navigate", "payload": { "mode": "cinema" } })
        );
        assert_eq!(
            serde_json::to_value(ServerFrame::ApplySettings { payload: json!({}) }).unwrap(),
            json!({ "kind": "apply-settings", "payload": {} })
        );
    }

    #[tokio::test]
    async fn test_offline_command_is_queued() {
        let (store, hub) = hub_with_device();

        let status = hub
            .send_command("d1", DeviceCommand::simple(PLAYBACK_NEXT))
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Queued);
        assert_eq!(store.get("d1").unwrap().pending_commands.len(), 1);

        let status = hub.send_apply_settings("d1", json!({ "clockWidget": false })).await.unwrap();
        assert_eq!(status, DeliveryStatus::Dropped);
    }

    #[tokio::test]
    async fn test_offline_command_for_unknown_device_fails() {
        let (_, hub) = hub_with_device();
        let err = hub
            .send_command("ghost", DeviceCommand::simple(PLAYBACK_NEXT))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_online_delivery() {
        let (_, hub) = hub_with_device();
        let (_, mut rx) = hub.attach("d1").await;

        let status = hub
            .send_command("d1", DeviceCommand::simple(PLAYBACK_NEXT))
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Sent);
        match rx.recv().await.unwrap() {
            ServerFrame::Command { command_type, .. } => assert_eq!(command_type, PLAYBACK_NEXT),
            other => panic!("unexpected frame {:?}", other),
        }

        hub.send_apply_settings("d1", json!({ "cinema": { "footer": { "enabled": false } } }))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerFrame::ApplySettings {
                payload: json!({ "cinema": { "footer": { "enabled": false } } })
            }
        );
    }

    #[tokio::test]
    async fn test_hello_flushes_queue() {
        let (store, hub) = hub_with_device();
        hub.send_command("d1", DeviceCommand::simple(PLAYBACK_NEXT)).await.unwrap();

        let session = hub.on_hello("d1", "s3cret").await.unwrap();
        let frames = &session.frames;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerFrame::HelloAck { .. }));
        assert!(matches!(&frames[1], ServerFrame::Command { command_type, .. } if command_type == PLAYBACK_NEXT));

        let device = store.get("d1").unwrap();
        assert!(device.pending_commands.is_empty());
        assert!(device.ws_connected);
        assert!(hub.is_connected("d1").await);
        assert_eq!(hub.connected_count().await, 1);
    }

    #[tokio::test]
    async fn test_broken_socket_requeues_and_goes_offline() {
        let (store, hub) = hub_with_device();
        hub.send_command("d1", DeviceCommand::simple(PLAYBACK_NEXT)).await.unwrap();
        let session = hub.on_hello("d1", "s3cret").await.unwrap();

        // 连接已登记，新指令进入出站队列
        let status = hub.send_command("d1", DeviceCommand::simple(POWER_OFF)).await.unwrap();
        assert_eq!(status, DeliveryStatus::Sent);

        // 客户端在 hello-ack 之前断开
        let (mut tx, rx) = futures::channel::mpsc::channel::<Message>(4);
        drop(rx);
        let unsent = flush(&mut tx, session.frames).await.unwrap_err();
        assert_eq!(unsent.len(), 2);

        hub.close_session("d1", session.conn_id, unsent, session.outbound).await;

        let device = store.get("d1").unwrap();
        assert!(!device.ws_connected);
        let pending: Vec<&str> = device.pending_commands.iter().map(|c| c.command_type.as_str()).collect();
        assert_eq!(pending, vec![PLAYBACK_NEXT, POWER_OFF]);
        assert!(!hub.is_connected("d1").await);
        assert_eq!(hub.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_writes_all_frames() {
        let (mut tx, mut rx) = futures::channel::mpsc::channel::<Message>(4);
        flush(&mut tx, vec![ServerFrame::Pong, ServerFrame::ApplySettings { payload: json!({}) }])
            .await
            .unwrap();
        drop(tx);

        let mut kinds = Vec::new();
        while let Some(Message::Text(text)) = rx.next().await {
            let value: Value = serde_json::from_str(&text).unwrap();
            kinds.push(value["kind"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["pong", "apply-settings"]);
    }

    #[tokio::test]
    async fn test_hello_wrong_secret() {
        let (store, hub) = hub_with_device();
        let err = hub.on_hello("d1", "nope").await.unwrap_err();
        assert!(matches!(err, DeviceError::Unauthorized(_)));
        assert!(!store.get("d1").unwrap().ws_connected);
        assert!(!hub.is_connected("d1").await);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_state_and_pings() {
        let (store, hub) = hub_with_device();
        let replies = hub
            .on_frame(
                "d1",
                ClientFrame::Heartbeat {
                    client_info: Some(ClientInfo {
                        mode: Some("wallart".to_string()),
                        ..Default::default()
                    }),
                    current_state: None,
                },
            )
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(store.get("d1").unwrap().client_info.mode.as_deref(), Some("wallart"));

        assert_eq!(hub.on_frame("d1", ClientFrame::Ping).await.unwrap(), vec![ServerFrame::Pong]);
    }

    #[tokio::test]
    async fn test_stale_detach_keeps_new_connection() {
        let (_, hub) = hub_with_device();
        let (old, _old_rx) = hub.attach("d1").await;
        let (new, _new_rx) = hub.attach("d1").await;

        assert!(!hub.detach("d1", old).await);
        assert!(hub.is_connected("d1").await);
        assert!(hub.detach("d1", new).await);
        assert!(!hub.is_connected("d1").await);
    }
}
