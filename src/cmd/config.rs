//! Effective configuration: `runway config`.

use anyhow::Result;
use runway::config::RunwayConfig;

pub fn cmd_config(config: &RunwayConfig, validate: bool) -> Result<()> {
    if validate {
        config.validate()?;
        println!("Configuration is valid.");
        return Ok(());
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}
