use std::fs::OpenOptions;

use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::Config, errors::Error, Result};

/// Initialize tracing for the process.
///
/// `RUST_LOG` overrides the configured level. With LOG_OUTPUT=file the
/// subscriber appends to LOG_FILE_PATH without ANSI colors.
pub fn init(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,fwdbot={0},fwdbot_core={0},fwdbot_store={0},fwdbot_telegram={0}", cfg.log_level)));

    if cfg.log_output == "file" {
        let path = cfg
            .log_file_path
            .as_ref()
            .ok_or_else(|| Error::Config("LOG_FILE_PATH is not set".to_string()))?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Arc::new(file))
            .with_target(false)
            .with_ansi(false)
            .init();
        return Ok(());
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();

    Ok(())
}
