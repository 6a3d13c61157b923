//! Config 命令

use std::path::Path;

use anyhow::{Result, bail};
use posterrama_core::PosterramaConfig;

pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to overwrite", path.display());
    }

    let config = PosterramaConfig::default_with_display();
    config.save(path)?;

    println!("Configuration initialized at: {}", path.display());
    println!("  Server: http://{}", config.bind_addr());
    println!("  Device store: {}", config.devices.store_path.display());
    println!("  MQTT bridge: disabled (set mqtt.enabled to turn it on)");

    Ok(())
}
