//! Command-line interface configuration
//!
//! Settings are read from `m4fboot.toml`, looked up in the current directory,
//! its parent, and finally the user's configuration directory. Command-line
//! arguments take precedence over anything configured here.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    image::hex::UnknownRecordPolicy,
    layout::MemoryLayout,
    protocol::{DEFAULT_TIMEOUT, MAX_HANDSHAKE_ATTEMPTS},
};

const CONFIG_FILE: &str = "m4fboot.toml";

/// Host updater configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Preferred serial port, in the same form accepted on the command line
    pub port: Option<String>,
    /// Bounded wait applied to each read from the device, in milliseconds
    pub timeout_ms: u64,
    /// Keyphrase transmissions before the device is declared missing
    pub handshake_retries: u32,
    /// Reject hex records of unknown type instead of treating them as the end
    /// of the file
    pub strict_records: bool,
    /// Memory map of the target device
    pub layout: MemoryLayout,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: None,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            handshake_retries: MAX_HANDSHAKE_ATTEMPTS,
            strict_records: false,
            layout: MemoryLayout::default(),
        }
    }
}

impl Config {
    /// Load the configuration file if one exists, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw_data = read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = toml::from_str(&raw_data)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse config {}", path.display()))?;
        debug!("Config: {:#?}", &config);

        config
            .layout
            .validate()
            .map_err(Error::from)
            .wrap_err_with(|| format!("Invalid [layout] in config {}", path.display()))?;

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn record_policy(&self) -> UnknownRecordPolicy {
        if self.strict_records {
            UnknownRecordPolicy::Reject
        } else {
            UnknownRecordPolicy::TreatAsEnd
        }
    }

    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;

        let local_config = current_dir.join(CONFIG_FILE);
        if local_config.exists() {
            return Some(local_config);
        }
        if let Some(parent_folder) = current_dir.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE);
            if workspace_config.exists() {
                return Some(workspace_config);
            }
        }

        ProjectDirs::from("", "", "m4fboot").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_the_protocol() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.handshake_retries, 30);
        assert_eq!(config.record_policy(), UnknownRecordPolicy::TreatAsEnd);
    }

    #[test]
    fn reads_port_and_layout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = "ttyACM0"
timeout_ms = 250
strict_records = true

[layout]
flash_size = "0x80000"
bootloader_size = "0x2000"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.port.as_deref(), Some("ttyACM0"));
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.handshake_retries, 30);
        assert_eq!(config.record_policy(), UnknownRecordPolicy::Reject);
        assert_eq!(config.layout.flash_size, 0x8_0000);
        assert_eq!(config.layout.app_base(), 0x2000);
        assert_eq!(config.layout.ram_base, 0x2000_0000);
    }

    #[test]
    fn overflowing_layout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[layout]
flash_base = "0xFFFF0000"
flash_size = "0x20000"
"#
        )
        .unwrap();

        let report = Config::load_from(file.path()).unwrap_err();

        assert!(report
            .chain()
            .any(|cause| cause.to_string().contains("address space")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("baud = 9600").is_err());
    }
}
