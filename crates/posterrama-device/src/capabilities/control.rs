//! 控制类能力：播放、电源、固定、管理、模式切换

use futures::future::BoxFuture;
use serde_json::{Value, json};

use super::{CapabilityCategory, CapabilityContext, CapabilityRegistry, CapabilitySpec, coerce_select, coerce_switch};
use crate::device::{DeviceMode, DeviceRecord};
use crate::error::{DeviceError, DeviceResult};
use crate::settings::get_device_mode;
use crate::transport::{self, DeviceCommand};

/// 直接转发一条空载荷指令的处理器
fn relay_handler(
    ctx: &CapabilityContext,
    command_type: &'static str,
) -> impl Fn(String, Value) -> BoxFuture<'static, DeviceResult<()>> + Send + Sync + 'static {
    let ctx = ctx.clone();
    move |device_id, _value| {
        let ctx = ctx.clone();
        Box::pin(async move {
            ctx.relay(&device_id, DeviceCommand::simple(command_type))
                .await
                .map(|_| ())
        })
    }
}

fn in_screensaver(device: &DeviceRecord) -> bool {
    get_device_mode(device) == DeviceMode::Screensaver
}

pub(super) fn register_playback(registry: &CapabilityRegistry) {
    let ctx = registry.context();
    let buttons = [
        ("playback.pause", "Pause", transport::PLAYBACK_PAUSE, "mdi:pause"),
        ("playback.resume", "Resume", transport::PLAYBACK_RESUME, "mdi:play"),
        ("playback.next", "Next Poster", transport::PLAYBACK_NEXT, "mdi:skip-next"),
        ("playback.previous", "Previous Poster", transport::PLAYBACK_PREVIOUS, "mdi:skip-previous"),
        ("playback.toggle", "Play/Pause", transport::PLAYBACK_TOGGLE, "mdi:play-pause"),
    ];

    for (id, name, command_type, icon) in buttons {
        registry.register(
            id,
            CapabilitySpec::new(name)
                .category(CapabilityCategory::Playback)
                .button()
                .icon(icon)
                .available_when(in_screensaver)
                .on_command(relay_handler(ctx, command_type)),
        );
    }
}

async fn toggle_power(ctx: CapabilityContext, device_id: String, value: Value) -> DeviceResult<()> {
    let on = coerce_switch("power.toggle", &value)?;
    let command_type = if on { transport::POWER_ON } else { transport::POWER_OFF };
    ctx.relay(&device_id, DeviceCommand::simple(command_type)).await?;
    Ok(())
}

pub(super) fn register_power(registry: &CapabilityRegistry) {
    let ctx = registry.context().clone();

    registry.register(
        "power.toggle",
        CapabilitySpec::new("Power")
            .category(CapabilityCategory::Power)
            .switch()
            .icon("mdi:power")
            .state(|device| json!(device.is_powered_on()))
            .on_command(move |device_id, value| toggle_power(ctx.clone(), device_id, value)),
    );

    registry.register(
        "power.on",
        CapabilitySpec::new("Power On")
            .category(CapabilityCategory::Power)
            .button()
            .icon("mdi:power-on")
            .available_when(|device| !device.is_powered_on())
            .on_command(relay_handler(registry.context(), transport::POWER_ON)),
    );

    registry.register(
        "power.off",
        CapabilitySpec::new("Power Off")
            .category(CapabilityCategory::Power)
            .button()
            .icon("mdi:power-off")
            .available_when(|device| device.is_powered_on())
            .on_command(relay_handler(registry.context(), transport::POWER_OFF)),
    );
}

/// 固定/取消固定当前海报，只在屏保模式下有意义
pub(super) fn register_navigation(registry: &CapabilityRegistry) {
    let ctx = registry.context();

    registry.register(
        "pin.current",
        CapabilitySpec::new("Pin Poster")
            .category(CapabilityCategory::Navigation)
            .button()
            .icon("mdi:pin")
            .available_when(|device| in_screensaver(device) && !device.is_pinned())
            .on_command(relay_handler(ctx, transport::PLAYBACK_PIN)),
    );

    registry.register(
        "pin.unpin",
        CapabilitySpec::new("Unpin Poster")
            .category(CapabilityCategory::Navigation)
            .button()
            .icon("mdi:pin-off")
            .available_when(|device| in_screensaver(device) && device.is_pinned())
            .on_command(relay_handler(ctx, transport::PLAYBACK_UNPIN)),
    );
}

/// 瞬时开关：OFF 不做任何事
async fn momentary(
    ctx: CapabilityContext,
    capability: &'static str,
    command_type: &'static str,
    device_id: String,
    value: Value,
) -> DeviceResult<()> {
    if coerce_switch(capability, &value)? {
        ctx.relay(&device_id, DeviceCommand::simple(command_type)).await?;
    }
    Ok(())
}

/// 瞬时开关：总是显示 OFF，只在收到 ON 时执行一次动作
pub(super) fn register_management(registry: &CapabilityRegistry) {
    let switches = [
        ("mgmt.reload", "Reload", transport::MGMT_RELOAD, "mdi:refresh"),
        ("mgmt.reset", "Reset", transport::MGMT_RESET, "mdi:restore"),
    ];

    for (id, name, command_type, icon) in switches {
        let ctx = registry.context().clone();
        registry.register(
            id,
            CapabilitySpec::new(name)
                .category(CapabilityCategory::Management)
                .switch()
                .icon(icon)
                .state(|_| json!(false))
                .on_command(move |device_id, value| momentary(ctx.clone(), id, command_type, device_id, value)),
        );
    }
}

/// 模式切换写入的覆盖片段
///
/// 三种模式用两个独立布尔值表达：cinemaMode 与 wallartMode.enabled，
/// 同一时刻至多一个为真，两者皆假即屏保。
pub fn mode_override_patch(mode: DeviceMode) -> Value {
    let (cinema, wallart) = match mode {
        DeviceMode::Cinema => (true, false),
        DeviceMode::Wallart => (false, true),
        DeviceMode::Screensaver => (false, false),
    };
    json!({
        "mode": mode.as_str(),
        "cinemaMode": cinema,
        "wallartMode": { "enabled": wallart }
    })
}

/// 持久化模式覆盖后再通知在线客户端跳转；设备不存在时直接失败
async fn select_mode(ctx: CapabilityContext, device_id: String, value: Value, options: Vec<String>) -> DeviceResult<()> {
    let choice = coerce_select("mode.select", &value, &options)?;
    let mode = DeviceMode::parse(&choice)
        .ok_or_else(|| DeviceError::invalid("mode.select", format!("unknown mode '{}'", choice)))?;

    ctx.merge_settings_override(&device_id, &mode_override_patch(mode)).await?;
    ctx.relay(&device_id, DeviceCommand::navigate(mode)).await?;
    Ok(())
}

pub(super) fn register_mode(registry: &CapabilityRegistry) {
    let ctx = registry.context().clone();
    let options: Vec<String> = DeviceMode::ALL.iter().map(|m| m.as_str().to_string()).collect();
    let handler_options = options.clone();

    registry.register(
        "mode.select",
        CapabilitySpec::new("Display Mode")
            .category(CapabilityCategory::Mode)
            .select(options)
            .icon("mdi:television-guide")
            .state(|device| json!(get_device_mode(device).as_str()))
            .on_command(move |device_id, value| select_mode(ctx.clone(), device_id, value, handler_options.clone())),
    );
}
