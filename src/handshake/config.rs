//! Handshake Configuration.

use std::{io, io::Write, path::Path, time::Duration};

use crate::{
    exchange::PeerId,
    utill::{get_handshake_dir, parse_field, parse_toml},
};

/// Handshake Configuration, shared by every handshake of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Interval between resubmissions of an unanswered protocol message.
    pub resubmit_interval_millis: u64,
    /// Deadline for the whole refund signature phase, counted from handshake start.
    pub refund_signature_timeout_millis: u64,
    /// Depth both commitment transactions must reach.
    pub required_confirmations: u32,
    /// Network address of the broker.
    pub broker_address: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            resubmit_interval_millis: 10_000,
            refund_signature_timeout_millis: 300_000,
            required_confirmations: 1,
            broker_address: "broker".to_string(),
        }
    }
}

impl HandshakeConfig {
    /// Constructs a [HandshakeConfig] from a config file. Or create default configs and load them.
    ///
    /// If the file doesn't exist or is empty, a default config is written there first.
    /// If no path is provided, the default location is used.
    ///
    /// Default config location: `~/.handshake/config.toml`.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_config_path = get_handshake_dir().join("config.toml");

        let config_path = config_path.unwrap_or(&default_config_path);
        let default_config = Self::default();

        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "Handshake config file not found, creating default config file at path: {}",
                config_path.display()
            );
            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;

        log::info!(
            "Successfully loaded config file from : {}",
            config_path.display()
        );

        let mut resubmit_interval_millis = parse_field(
            config_map.get("resubmit_interval_millis"),
            default_config.resubmit_interval_millis,
        );
        if resubmit_interval_millis == 0 {
            log::warn!(
                "resubmit_interval_millis must be positive, using default {}",
                default_config.resubmit_interval_millis
            );
            resubmit_interval_millis = default_config.resubmit_interval_millis;
        }

        Ok(HandshakeConfig {
            resubmit_interval_millis,
            refund_signature_timeout_millis: parse_field(
                config_map.get("refund_signature_timeout_millis"),
                default_config.refund_signature_timeout_millis,
            ),
            required_confirmations: parse_field(
                config_map.get("required_confirmations"),
                default_config.required_confirmations,
            ),
            broker_address: parse_field(
                config_map.get("broker_address"),
                default_config.broker_address,
            ),
        })
    }

    /// Never below one millisecond.
    pub fn resubmit_interval(&self) -> Duration {
        Duration::from_millis(self.resubmit_interval_millis.max(1))
    }

    pub fn refund_signature_timeout(&self) -> Duration {
        Duration::from_millis(self.refund_signature_timeout_millis)
    }

    pub fn broker(&self) -> PeerId {
        PeerId::new(self.broker_address.clone())
    }

    // Method to serialize the HandshakeConfig into a TOML string and write it to a file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let toml_data = format!(
            "resubmit_interval_millis = {}
refund_signature_timeout_millis = {}
required_confirmations = {}
broker_address = {}",
            self.resubmit_interval_millis,
            self.refund_signature_timeout_millis,
            self.required_confirmations,
            self.broker_address,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
