//! CLI command implementations.
//!
//! | Module      | Commands handled        |
//! |-------------|-------------------------|
//! | `serve`     | `Serve`                 |
//! | `reconcile` | `Reconcile`             |
//! | `config`    | `Config`                |
//! | `policy`    | `Policy check`          |

pub mod config;
pub mod policy;
pub mod reconcile;
pub mod serve;

pub use config::cmd_config;
pub use policy::cmd_policy_check;
pub use reconcile::cmd_reconcile;
pub use serve::cmd_serve;

use runway::config::{LogFormat, LoggingSection};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUNWAY_LOG` wins over the configured
/// filter; `--verbose` raises the configured filter to `debug`.
pub fn init_tracing(logging: &LoggingSection, verbose: bool) {
    let fallback = if verbose { "debug" } else { logging.filter.as_str() };
    let filter = EnvFilter::try_from_env("RUNWAY_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Pretty => {
            let _ = builder.with_target(false).try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
