//! 各显示模式的设置能力
//!
//! id 形如 `settings.<mode>.<path>`，只在设备处于对应模式时可用。
//! 写入时把变更深合并进设备的覆盖树并持久化，再把同一片段推送给客户端。

use serde_json::{Value, json};

use super::coerce::number_value;
use super::{
    CapabilityCategory, CapabilityContext, CapabilityRegistry, CapabilitySpec, EntityKind, coerce_number,
    coerce_select, coerce_switch,
};
use crate::device::DeviceMode;
use crate::error::DeviceResult;
use crate::settings::{canonical_path, get_device_mode, mode_path, nested_document, resolve_setting};

#[derive(Debug, Clone, Copy)]
enum SettingKind {
    Switch,
    Select(&'static [&'static str]),
    Number {
        min: f64,
        max: f64,
        step: f64,
        unit: Option<&'static str>,
    },
}

struct SettingDef {
    mode: DeviceMode,
    path: &'static str,
    name: &'static str,
    kind: SettingKind,
    default: fn() -> Value,
}

const HEADER_STYLES: &[&str] = &["classic", "neon", "minimal", "theatre"];
const FOOTER_TYPES: &[&str] = &["metadata", "marquee", "tagline"];
const DENSITIES: &[&str] = &["low", "medium", "high", "ludicrous"];
const ANIMATIONS: &[&str] = &["fade", "slide", "zoom", "flip", "shuffle", "random"];
const LAYOUTS: &[&str] = &["classic", "heroGrid"];
const HERO_SIDES: &[&str] = &["left", "right"];
const TRANSITIONS: &[&str] = &["kenburns", "fade", "slide"];

fn setting_defs() -> Vec<SettingDef> {
    use DeviceMode::{Cinema, Screensaver, Wallart};
    use SettingKind::{Number, Select, Switch};

    vec![
        SettingDef { mode: Cinema, path: "header.enabled", name: "Cinema Header", kind: Switch, default: || json!(true) },
        SettingDef { mode: Cinema, path: "header.style", name: "Cinema Header Style", kind: Select(HEADER_STYLES), default: || json!("classic") },
        SettingDef { mode: Cinema, path: "footer.enabled", name: "Cinema Footer", kind: Switch, default: || json!(true) },
        SettingDef { mode: Cinema, path: "footer.type", name: "Cinema Footer Type", kind: Select(FOOTER_TYPES), default: || json!("metadata") },
        SettingDef { mode: Cinema, path: "ambilight.enabled", name: "Ambilight", kind: Switch, default: || json!(true) },
        SettingDef {
            mode: Cinema,
            path: "ambilight.strength",
            name: "Ambilight Strength",
            kind: Number { min: 0.0, max: 100.0, step: 5.0, unit: Some("%") },
            default: || json!(60),
        },
        SettingDef { mode: Wallart, path: "density", name: "Wallart Density", kind: Select(DENSITIES), default: || json!("medium") },
        SettingDef {
            mode: Wallart,
            path: "refreshRate",
            name: "Wallart Refresh Rate",
            kind: Number { min: 1.0, max: 10.0, step: 1.0, unit: None },
            default: || json!(6),
        },
        SettingDef {
            mode: Wallart,
            path: "randomness",
            name: "Wallart Randomness",
            kind: Number { min: 0.0, max: 10.0, step: 1.0, unit: None },
            default: || json!(3),
        },
        SettingDef { mode: Wallart, path: "animationType", name: "Wallart Animation", kind: Select(ANIMATIONS), default: || json!("fade") },
        SettingDef { mode: Wallart, path: "layoutVariant", name: "Wallart Layout", kind: Select(LAYOUTS), default: || json!("classic") },
        SettingDef { mode: Wallart, path: "heroSide", name: "Hero Side", kind: Select(HERO_SIDES), default: || json!("left") },
        SettingDef {
            mode: Wallart,
            path: "heroRotationMinutes",
            name: "Hero Rotation",
            kind: Number { min: 1.0, max: 60.0, step: 1.0, unit: Some("min") },
            default: || json!(10),
        },
        SettingDef { mode: Wallart, path: "ambientGradient", name: "Ambient Gradient", kind: Switch, default: || json!(false) },
        SettingDef {
            mode: Screensaver,
            path: "transitionIntervalSeconds",
            name: "Transition Interval",
            kind: Number { min: 5.0, max: 300.0, step: 1.0, unit: Some("s") },
            default: || json!(15),
        },
        SettingDef { mode: Screensaver, path: "transitionEffect", name: "Transition Effect", kind: Select(TRANSITIONS), default: || json!("kenburns") },
        SettingDef { mode: Screensaver, path: "showClearLogo", name: "Show ClearLogo", kind: Switch, default: || json!(true) },
        SettingDef { mode: Screensaver, path: "showRottenTomatoes", name: "Show Rotten Tomatoes", kind: Switch, default: || json!(true) },
        SettingDef { mode: Screensaver, path: "showMetadata", name: "Show Metadata", kind: Switch, default: || json!(true) },
        SettingDef { mode: Screensaver, path: "showPoster", name: "Show Poster", kind: Switch, default: || json!(true) },
        SettingDef { mode: Screensaver, path: "clockWidget", name: "Clock Widget", kind: Switch, default: || json!(true) },
    ]
}

impl SettingKind {
    fn entity(&self) -> EntityKind {
        match *self {
            SettingKind::Switch => EntityKind::Switch,
            SettingKind::Select(options) => EntityKind::Select {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            SettingKind::Number { min, max, step, unit } => EntityKind::Number {
                min,
                max,
                step,
                unit: unit.map(str::to_string),
            },
        }
    }

    fn coerce(&self, capability: &str, value: &Value) -> DeviceResult<Value> {
        match *self {
            SettingKind::Switch => coerce_switch(capability, value).map(Value::Bool),
            SettingKind::Select(options) => {
                let options: Vec<String> = options.iter().map(|o| o.to_string()).collect();
                coerce_select(capability, value, &options).map(Value::String)
            }
            SettingKind::Number { min, max, step, .. } => {
                coerce_number(capability, value, min, max, step).map(|n| number_value(n, step))
            }
        }
    }
}

/// 写入单个模式设置：深合并进覆盖树后推送同一片段
async fn apply_setting(
    ctx: CapabilityContext,
    capability: String,
    mode: DeviceMode,
    path: &'static str,
    kind: SettingKind,
    device_id: String,
    value: Value,
) -> DeviceResult<()> {
    let value = kind.coerce(&capability, &value)?;
    let full_path = mode_path(mode, &canonical_path(mode, path));
    let change = nested_document(&full_path, value);

    ctx.merge_settings_override(&device_id, &change).await?;
    ctx.transport.send_apply_settings(&device_id, change).await?;
    Ok(())
}

pub(super) fn register_display_settings(registry: &CapabilityRegistry) {
    for def in setting_defs() {
        let id = format!("settings.{}.{}", def.mode.as_str(), def.path);
        let SettingDef { mode, path, name, kind, default } = def;

        let state_ctx = registry.context().clone();
        let handler_ctx = registry.context().clone();
        let handler_id = id.clone();

        registry.register(
            id,
            CapabilitySpec::new(name)
                .category(CapabilityCategory::Settings)
                .entity(kind.entity())
                .available_when(move |device| get_device_mode(device) == mode)
                .state(move |device| resolve_setting(device, &state_ctx.display_defaults, mode, path, default()))
                .on_command(move |device_id, value| {
                    apply_setting(handler_ctx.clone(), handler_id.clone(), mode, path, kind, device_id, value)
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::device::{ClientInfo, DeviceRecord};
    use crate::testing::{RecordingStore, RecordingTransport};
    use std::sync::Arc;

    fn fixture() -> (Arc<RecordingStore>, Arc<RecordingTransport>, CapabilityRegistry) {
        let store = Arc::new(RecordingStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let ctx = CapabilityContext::new(store.clone(), transport.clone()).with_display_defaults(json!({
            "cinema": { "ambilight": { "strength": 35 } },
            "wallartMode": { "heroSide": "right" }
        }));
        (store, transport, CapabilityRegistry::with_builtins(ctx))
    }

    #[test]
    fn test_ids_follow_mode_namespace() {
        let (_, _, registry) = fixture();
        assert!(registry.has("settings.cinema.footer.enabled"));
        assert!(registry.has("settings.wallart.heroRotationMinutes"));
        assert!(registry.has("settings.screensaver.showPoster"));
    }

    #[test]
    fn test_state_resolution_chain() {
        let (_, _, registry) = fixture();
        let strength = registry.get("settings.cinema.ambilight.strength").unwrap();
        let hero = registry.get("settings.wallart.heroSide").unwrap();
        let header = registry.get("settings.cinema.header.enabled").unwrap();

        let plain = DeviceRecord::new("d1");
        assert_eq!(strength.state(&plain), Some(json!(35)));
        assert_eq!(hero.state(&plain), Some(json!("right")));
        assert_eq!(header.state(&plain), Some(json!(true)));

        let overridden = DeviceRecord::new("d1").with_settings_override(json!({
            "cinema": { "ambilight": { "strength": 80 } },
            "wallartMode": { "heroSide": "left" }
        }));
        assert_eq!(strength.state(&overridden), Some(json!(80)));
        assert_eq!(hero.state(&overridden), Some(json!("left")));
    }

    #[tokio::test]
    async fn test_setting_write_merges_and_applies() {
        let (store, transport, registry) = fixture();
        store.insert(
            DeviceRecord::new("d1")
                .with_client_info(ClientInfo {
                    mode: Some("cinema".to_string()),
                    ..Default::default()
                })
                .with_settings_override(json!({ "cinema": { "header": { "style": "neon" } }, "mode": "cinema" })),
        );

        registry
            .execute("settings.cinema.footer.enabled", "d1", json!("OFF"))
            .await
            .unwrap();

        let device = store.get("d1").unwrap();
        assert_eq!(
            device.settings_override,
            json!({
                "cinema": { "header": { "style": "neon" }, "footer": { "enabled": false } },
                "mode": "cinema"
            })
        );
        assert_eq!(
            transport.applied(),
            vec![("d1".to_string(), json!({ "cinema": { "footer": { "enabled": false } } }))]
        );
    }

    #[tokio::test]
    async fn test_hero_side_written_to_modern_path() {
        let (store, transport, registry) = fixture();
        store.insert(DeviceRecord::new("d1").with_settings_override(json!({ "wallartMode": { "heroSide": "left" } })));

        registry.execute("settings.wallart.heroSide", "d1", json!("right")).await.unwrap();

        let device = store.get("d1").unwrap();
        assert_eq!(
            device.settings_override["wallartMode"]["layoutSettings"]["heroGrid"]["heroSide"],
            json!("right")
        );
        assert_eq!(transport.applied().len(), 1);

        let hero = registry.get("settings.wallart.heroSide").unwrap();
        assert_eq!(hero.state(&device), Some(json!("right")));
    }

    #[tokio::test]
    async fn test_number_setting_is_clamped() {
        let (store, _, registry) = fixture();
        store.insert(DeviceRecord::new("d1"));

        registry
            .execute("settings.screensaver.transitionIntervalSeconds", "d1", json!(1000))
            .await
            .unwrap();

        let device = store.get("d1").unwrap();
        assert_eq!(device.settings_override["transitionIntervalSeconds"], json!(300));
    }

    #[tokio::test]
    async fn test_invalid_select_value_rejected() {
        let (store, transport, registry) = fixture();
        store.insert(DeviceRecord::new("d1"));

        let result = registry.execute("settings.wallart.density", "d1", json!("extreme")).await;
        assert!(result.is_err());
        assert!(store.patches().is_empty());
        assert!(transport.applied().is_empty());
    }
}
