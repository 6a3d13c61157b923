//! Capabilities 命令

use std::sync::Arc;

use anyhow::Result;
use posterrama_device::{CapabilityContext, CapabilityInfo, CapabilityRegistry, EntityKind, FileDeviceStore};
use posterrama_server::WsHub;

/// 只用于枚举目录的注册表，存储与通道都不会被调用
fn catalog_registry() -> CapabilityRegistry {
    let store = Arc::new(FileDeviceStore::in_memory());
    let hub = Arc::new(WsHub::new(store.clone()));
    CapabilityRegistry::with_builtins(CapabilityContext::new(store, hub))
}

fn describe(entity: &EntityKind) -> String {
    match entity {
        EntityKind::Select { options } => format!("select [{}]", options.join("|")),
        EntityKind::Number { min, max, step, unit } => format!(
            "number {}..{} step {}{}",
            min,
            max,
            step,
            unit.as_deref().map(|u| format!(" {}", u)).unwrap_or_default()
        ),
        EntityKind::Sensor { unit: Some(unit) } => format!("sensor ({})", unit),
        other => other.name().to_string(),
    }
}

pub fn render_table(infos: &[CapabilityInfo]) -> String {
    let width = infos.iter().map(|i| i.id.len()).max().unwrap_or(0);
    infos
        .iter()
        .map(|info| {
            format!(
                "{:<width$}  {:<10}  {}",
                info.id,
                serde_json::to_value(info.category)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                describe(&info.entity),
                width = width
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn run(json: bool) -> Result<()> {
    let infos = catalog_registry().infos();
    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else {
        println!("{}", render_table(&infos));
        println!("\n{} capabilities", infos.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lists_every_capability() {
        let infos = catalog_registry().infos();
        let table = render_table(&infos);
        assert_eq!(table.lines().count(), infos.len());
        assert!(table.contains("mode.select"));
        assert!(table.contains("select [screensaver|wallart|cinema]"));
        assert!(table.contains("number 0..100 step 5 %"));
    }
}
