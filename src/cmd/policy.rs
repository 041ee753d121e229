//! Offline policy evaluation: `runway policy check`.

use anyhow::{Result, bail};
use runway::config::RunwayConfig;
use runway::runtime::CommandPolicy;

pub fn cmd_policy_check(
    config: &RunwayConfig,
    command: &str,
    args: &[String],
    cwd: Option<&str>,
) -> Result<()> {
    let policy = CommandPolicy::from_config(&config.policy)?;
    match policy.validate(command, args, cwd) {
        Ok(()) => {
            println!("allowed");
            Ok(())
        }
        Err(violation) => bail!("rejected: {}", violation),
    }
}
