//! Serve 命令

use anyhow::Result;
use posterrama_core::PosterramaConfig;
use posterrama_server::Gateway;

/// 命令行参数覆盖配置文件中的监听地址
pub fn apply_overrides(config: &mut PosterramaConfig, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
}

pub async fn run(mut config: PosterramaConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    apply_overrides(&mut config, host, port);

    tracing::info!("Starting Posterrama gateway...");
    tracing::info!("Device store: {}", config.devices.store_path.display());

    let gateway = Gateway::new(config).await?;
    gateway.start().await?;

    Ok(())
}
