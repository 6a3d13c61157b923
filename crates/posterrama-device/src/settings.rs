//! 设置解析工具
//!
//! 逐级解析某台设备在某个模式下的有效设置值：
//! 设备覆盖 → 模式子对象 → 嵌套路径 → 全局配置 → 调用方默认值。
//! 路径使用点号分隔 (例如 `footer.ambilight.strength`)，与持久化的
//! JSON 结构一一对应。

use serde_json::{Map, Value};

use crate::device::{DeviceMode, DeviceRecord};

/// 旧版扁平路径别名: (现代路径, 旧路径)，两者都相对于模式子对象
const WALLART_LEGACY_ALIASES: &[(&str, &str)] = &[
    ("layoutSettings.heroGrid.heroSide", "heroSide"),
    ("layoutSettings.heroGrid.heroRotationMinutes", "heroRotationMinutes"),
];

/// 解析设备当前模式
///
/// 客户端自报的 `clientInfo.mode` 优先于服务端缓存的 `currentState.mode`，
/// 两者都缺失 (或无法识别) 时为屏保模式。
pub fn get_device_mode(device: &DeviceRecord) -> DeviceMode {
    device
        .client_info
        .mode
        .as_deref()
        .and_then(DeviceMode::parse)
        .or_else(|| device.current_state.mode.as_deref().and_then(DeviceMode::parse))
        .unwrap_or_default()
}

/// 递归结构合并
///
/// 两侧都是对象时递归合并，其余情况 (数组、标量、`null`) 由 `source` 直接覆盖。
pub fn deep_merge_settings(target: &Value, source: &Value) -> Value {
    let mut merged = target.clone();
    merge_into(&mut merged, source);
    merged
}

fn merge_into(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                let recurse = source_value.is_object() && target_map.get(key).is_some_and(Value::is_object);
                match target_map.get_mut(key) {
                    Some(existing) if recurse => merge_into(existing, source_value),
                    _ => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

/// 按点号路径读取；任一段缺失或值为 `null` 时返回 `None`
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() { None } else { Some(current) }
}

/// 按点号路径写入，沿途缺失或非对象的节点会被替换成对象
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        current = ensure_object(current)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// 由点号路径构造一个嵌套文档，例如 `a.b` + 1 → `{"a":{"b":1}}`
pub fn nested_document(path: &str, value: Value) -> Value {
    let mut doc = Value::Object(Map::new());
    set_path(&mut doc, path, value);
    doc
}

/// 模式设置在整棵设置树中的完整路径
pub fn mode_path(mode: DeviceMode, path: &str) -> String {
    match mode.settings_key() {
        Some(key) if path.is_empty() => key.to_string(),
        Some(key) => format!("{}.{}", key, path),
        None => path.to_string(),
    }
}

/// 某个模式下某个设置的候选路径 (相对于模式子对象)，现代路径在前
pub fn candidate_paths(mode: DeviceMode, path: &str) -> Vec<String> {
    if mode != DeviceMode::Wallart {
        return vec![path.to_string()];
    }

    for (modern, legacy) in WALLART_LEGACY_ALIASES {
        if path == *modern || path == *legacy {
            return vec![modern.to_string(), legacy.to_string()];
        }
    }
    vec![path.to_string()]
}

/// 写入时使用的规范路径 (别名统一到现代路径)
pub fn canonical_path(mode: DeviceMode, path: &str) -> String {
    candidate_paths(mode, path).swap_remove(0)
}

fn lookup_mode_value<'a>(tree: &'a Value, mode: DeviceMode, path: &str) -> Option<&'a Value> {
    candidate_paths(mode, path)
        .iter()
        .find_map(|candidate| get_path(tree, &mode_path(mode, candidate)))
}

/// 只看设备覆盖，缺失时返回 `default`
pub fn get_mode_setting(device: &DeviceRecord, mode: DeviceMode, path: &str, default: Value) -> Value {
    lookup_mode_value(&device.settings_override, mode, path)
        .cloned()
        .unwrap_or(default)
}

pub fn get_cinema_setting(device: &DeviceRecord, path: &str, default: Value) -> Value {
    get_mode_setting(device, DeviceMode::Cinema, path, default)
}

pub fn get_wallart_setting(device: &DeviceRecord, path: &str, default: Value) -> Value {
    get_mode_setting(device, DeviceMode::Wallart, path, default)
}

pub fn get_screensaver_setting(device: &DeviceRecord, path: &str, default: Value) -> Value {
    get_mode_setting(device, DeviceMode::Screensaver, path, default)
}

/// 完整解析链：设备覆盖 → 全局显示配置 → `default`
pub fn resolve_setting(
    device: &DeviceRecord,
    global: &Value,
    mode: DeviceMode,
    path: &str,
    default: Value,
) -> Value {
    lookup_mode_value(&device.settings_override, mode, path)
        .or_else(|| lookup_mode_value(global, mode, path))
        .cloned()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ClientInfo, CurrentState};
    use serde_json::json;

    fn device_with_override(settings: Value) -> DeviceRecord {
        DeviceRecord::new("d1").with_settings_override(settings)
    }

    #[test]
    fn test_client_info_mode_wins() {
        let device = DeviceRecord::new("d1")
            .with_client_info(ClientInfo {
                mode: Some("cinema".to_string()),
                ..Default::default()
            })
            .with_current_state(CurrentState {
                mode: Some("wallart".to_string()),
                ..Default::default()
            });
        assert_eq!(get_device_mode(&device), DeviceMode::Cinema);
    }

    #[test]
    fn test_current_state_mode_fallback() {
        let device = DeviceRecord::new("d1").with_current_state(CurrentState {
            mode: Some("wallart".to_string()),
            ..Default::default()
        });
        assert_eq!(get_device_mode(&device), DeviceMode::Wallart);
        assert_eq!(get_device_mode(&DeviceRecord::new("d2")), DeviceMode::Screensaver);
    }

    #[test]
    fn test_unrecognized_client_mode_falls_through() {
        let device = DeviceRecord::new("d1")
            .with_client_info(ClientInfo {
                mode: Some("kiosk".to_string()),
                ..Default::default()
            })
            .with_current_state(CurrentState {
                mode: Some("cinema".to_string()),
                ..Default::default()
            });
        assert_eq!(get_device_mode(&device), DeviceMode::Cinema);
    }

    #[test]
    fn test_deep_merge_recurses_into_objects() {
        let target = json!({ "wallartMode": { "density": "high", "customProp": "value" }, "mode": "screensaver" });
        let source = json!({ "wallartMode": { "enabled": false }, "mode": "cinema" });

        let merged = deep_merge_settings(&target, &source);
        assert_eq!(
            merged,
            json!({
                "wallartMode": { "density": "high", "customProp": "value", "enabled": false },
                "mode": "cinema"
            })
        );
    }

    #[test]
    fn test_deep_merge_replaces_arrays_and_clears_with_null() {
        let target = json!({ "genres": ["a", "b"], "cinema": { "header": { "text": "Now Playing" } } });
        let source = json!({ "genres": ["c"], "cinema": { "header": null } });

        let merged = deep_merge_settings(&target, &source);
        assert_eq!(merged, json!({ "genres": ["c"], "cinema": { "header": null } }));
    }

    #[test]
    fn test_deep_merge_object_over_scalar() {
        let merged = deep_merge_settings(&json!({ "footer": true }), &json!({ "footer": { "enabled": true } }));
        assert_eq!(merged, json!({ "footer": { "enabled": true } }));
    }

    #[test]
    fn test_get_and_set_path() {
        let mut doc = json!({ "cinema": { "footer": "plain" } });
        set_path(&mut doc, "cinema.footer.ambilight.strength", json!(40));
        assert_eq!(get_path(&doc, "cinema.footer.ambilight.strength"), Some(&json!(40)));
        assert_eq!(get_path(&doc, "cinema.header.enabled"), None);

        assert_eq!(nested_document("a.b", json!(1)), json!({ "a": { "b": 1 } }));
    }

    #[test]
    fn test_mode_setting_with_default() {
        let device = device_with_override(json!({
            "cinema": { "footer": { "ambilight": { "strength": 80 } } },
            "transitionIntervalSeconds": 30
        }));

        assert_eq!(get_cinema_setting(&device, "footer.ambilight.strength", json!(10)), json!(80));
        assert_eq!(get_cinema_setting(&device, "header.enabled", json!(true)), json!(true));
        assert_eq!(get_screensaver_setting(&device, "transitionIntervalSeconds", json!(15)), json!(30));
    }

    #[test]
    fn test_hero_side_modern_path() {
        let device = device_with_override(json!({
            "wallartMode": { "layoutSettings": { "heroGrid": { "heroSide": "left" } } }
        }));
        assert_eq!(get_wallart_setting(&device, "heroSide", json!("right")), json!("left"));
    }

    #[test]
    fn test_hero_side_legacy_path() {
        let device = device_with_override(json!({ "wallartMode": { "heroSide": "right" } }));
        assert_eq!(get_wallart_setting(&device, "heroSide", json!("left")), json!("right"));
    }

    #[test]
    fn test_hero_side_modern_beats_legacy() {
        let device = device_with_override(json!({
            "wallartMode": {
                "heroSide": "right",
                "layoutSettings": { "heroGrid": { "heroSide": "left" } }
            }
        }));
        assert_eq!(get_wallart_setting(&device, "heroSide", json!("right")), json!("left"));
        assert_eq!(get_wallart_setting(&DeviceRecord::new("d2"), "heroSide", json!("right")), json!("right"));
    }

    #[test]
    fn test_resolve_falls_back_to_global() {
        let global = json!({ "wallartMode": { "density": "low", "heroSide": "right" } });
        let device = device_with_override(json!({ "wallartMode": { "refreshRate": 9 } }));

        let density = resolve_setting(&device, &global, DeviceMode::Wallart, "density", json!("medium"));
        assert_eq!(density, json!("low"));

        let refresh = resolve_setting(&device, &global, DeviceMode::Wallart, "refreshRate", json!(6));
        assert_eq!(refresh, json!(9));

        let side = resolve_setting(&device, &global, DeviceMode::Wallart, "heroSide", json!("left"));
        assert_eq!(side, json!("right"));

        let missing = resolve_setting(&device, &global, DeviceMode::Wallart, "animationType", json!("fade"));
        assert_eq!(missing, json!("fade"));
    }

    #[test]
    fn test_canonical_path() {
        assert_eq!(canonical_path(DeviceMode::Wallart, "heroSide"), "layoutSettings.heroGrid.heroSide");
        assert_eq!(canonical_path(DeviceMode::Cinema, "heroSide"), "heroSide");
        assert_eq!(mode_path(DeviceMode::Screensaver, "clockWidget"), "clockWidget");
        assert_eq!(mode_path(DeviceMode::Cinema, "header.enabled"), "cinema.header.enabled");
    }
}
