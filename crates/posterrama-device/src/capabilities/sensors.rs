//! 只读能力：海报图片、当前媒体元数据、设备诊断信息

use chrono::{Duration, Utc};
use serde_json::{Value, json};

use super::{CapabilityCategory, CapabilityRegistry, CapabilitySpec};
use crate::device::DeviceRecord;

pub(super) fn register_camera(registry: &CapabilityRegistry) {
    registry.register(
        "camera.poster",
        CapabilitySpec::new("Current Poster")
            .category(CapabilityCategory::Camera)
            .camera()
            .icon("mdi:image")
            .state(|device| {
                let state = &device.current_state;
                state
                    .poster_url
                    .as_ref()
                    .or(state.thumbnail_url.as_ref())
                    .map(|url| json!(url))
                    .unwrap_or(Value::Null)
            }),
    );
}

fn opt<T: serde::Serialize>(value: Option<T>) -> Value {
    value.map(|v| json!(v)).unwrap_or(Value::Null)
}

pub(super) fn register_media_sensors(registry: &CapabilityRegistry) {
    type Getter = fn(&DeviceRecord) -> Value;

    let sensors: [(&str, &str, Option<&str>, &str, Getter); 7] = [
        ("media.title", "Title", None, "mdi:movie-open", |d| opt(d.current_state.title.as_ref())),
        ("media.year", "Year", None, "mdi:calendar", |d| opt(d.current_state.year)),
        ("media.rating", "Rating", None, "mdi:star", |d| opt(d.current_state.rating)),
        ("media.runtime", "Runtime", Some("min"), "mdi:timer-outline", |d| opt(d.current_state.runtime)),
        ("media.genres", "Genres", None, "mdi:tag-multiple", |d| {
            let genres = &d.current_state.genres;
            if genres.is_empty() { Value::Null } else { json!(genres.join(", ")) }
        }),
        ("media.tagline", "Tagline", None, "mdi:format-quote-close", |d| {
            opt(d.current_state.tagline.as_ref())
        }),
        ("media.contentRating", "Content Rating", None, "mdi:shield-account", |d| {
            opt(d.current_state.content_rating.as_ref())
        }),
    ];

    for (id, name, unit, icon, getter) in sensors {
        registry.register(
            id,
            CapabilitySpec::new(name)
                .category(CapabilityCategory::Sensor)
                .sensor(unit)
                .icon(icon)
                .state(getter),
        );
    }
}

/// 根据 User-Agent 粗略判断客户端类型，按顺序首个命中即返回
pub fn sniff_client_type(user_agent: &str) -> &'static str {
    const PATTERNS: &[(&[&str], &str)] = &[
        (&["electron", "posterrama-desktop"], "Desktop App"),
        (&["android tv", "aftb", "aftm", "afts", "aftt", "bravia", "shield", "googletv", "chromecast"], "Android TV"),
        (&["smart-tv", "smarttv", "tizen", "webos", "netcast", "hbbtv", "roku", "appletv"], "Smart TV"),
        (&["raspbian", "raspberry", "armv7l", "aarch64; linux"], "Raspberry Pi"),
        (&["ipad", "tablet"], "Tablet"),
        (&["iphone", "android", "mobile"], "Mobile"),
        (&["windows", "macintosh", "mac os x", "linux", "cros"], "Desktop"),
    ];

    let ua = user_agent.to_ascii_lowercase();
    if ua.trim().is_empty() {
        return "Unknown";
    }

    PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| ua.contains(needle)))
        .map(|(_, label)| *label)
        .unwrap_or("Unknown")
}

/// 有 WebSocket 连接即在线；否则看最近一次心跳是否在超时窗口内
pub fn connection_status(device: &DeviceRecord, offline_after_secs: u64) -> &'static str {
    if device.ws_connected {
        return "online";
    }
    let window = Duration::seconds(offline_after_secs.min(u32::MAX as u64) as i64);
    match device.last_seen_at {
        Some(seen) if Utc::now() - seen <= window => "online",
        _ => "offline",
    }
}

pub(super) fn register_device_sensors(registry: &CapabilityRegistry) {
    let offline_after = registry.context().offline_after_secs;

    registry.register(
        "device.status",
        CapabilitySpec::new("Status")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:lan-connect")
            .state(move |device| json!(connection_status(device, offline_after))),
    );

    registry.register(
        "device.resolution",
        CapabilitySpec::new("Resolution")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:monitor-screenshot")
            .state(|device| match &device.client_info.screen {
                Some(screen) => match (screen.w, screen.h) {
                    (Some(w), Some(h)) => json!(format!("{}x{}", w, h)),
                    _ => Value::Null,
                },
                None => Value::Null,
            }),
    );

    registry.register(
        "device.clientType",
        CapabilitySpec::new("Client Type")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:devices")
            .state(|device| {
                json!(sniff_client_type(device.client_info.user_agent.as_deref().unwrap_or_default()))
            }),
    );

    registry.register(
        "device.groups",
        CapabilitySpec::new("Groups")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:group")
            .state(|device| {
                if device.groups.is_empty() {
                    Value::Null
                } else {
                    json!(device.groups.join(", "))
                }
            }),
    );

    registry.register(
        "device.preset",
        CapabilitySpec::new("Preset")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:palette")
            .state(|device| opt(device.preset.as_ref())),
    );

    registry.register(
        "device.location",
        CapabilitySpec::new("Location")
            .category(CapabilityCategory::Sensor)
            .sensor(None)
            .icon("mdi:map-marker")
            .state(|device| opt(device.location.as_ref())),
    );
}
