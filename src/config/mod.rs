//! Configuration management for Skylink.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::LinkConfiguration;
use crate::manager::ManagerConfig;
use crate::transport::{MockConfig, SerialConfig, TcpConfig, TransportKind, UdpConfig};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Link manager configuration.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Links created at startup.
    #[serde(default)]
    pub links: Vec<LinkConfiguration>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;

        if self.links.len() > self.manager.max_links {
            return Err(Error::InvalidConfig(format!(
                "{} links configured but max_links is {}",
                self.links.len(),
                self.manager.max_links
            )));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            link.validate()?;
            if !names.insert(link.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate link name: {}",
                    link.name
                )));
            }
        }

        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))
    }

    /// Create example configuration.
    pub fn example() -> Self {
        let radio = LinkConfiguration::new(
            "telemetry-radio",
            TransportKind::Serial(SerialConfig::new("/dev/ttyUSB0", 57600)),
        );

        let udp = LinkConfiguration::new(
            "udp-14550",
            TransportKind::Udp(UdpConfig::default()),
        )
        .persistent();

        let sitl = LinkConfiguration::new(
            "sitl",
            TransportKind::Tcp(TcpConfig {
                address: std::net::SocketAddr::from(([127, 0, 0, 1], 5760)),
                nodelay: true,
            }),
        )
        .with_connect_timeout(Duration::from_secs(5));

        let sim = LinkConfiguration::new(
            "simulator",
            TransportKind::Mock(MockConfig {
                vehicle_count: 2,
                ..MockConfig::default()
            }),
        )
        .persistent();

        Self {
            links: vec![radio, udp, sitl, sim],
            ..Default::default()
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use std::sync::Mutex;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file = config
        .file
        .as_ref()
        .map(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file {}: {e}", path.display())))
        })
        .transpose()?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match (config.format.as_str(), file) {
        ("json", Some(file)) => subscriber
            .with(fmt::layer().json().with_writer(Mutex::new(file)))
            .try_init(),
        ("json", None) => subscriber.with(fmt::layer().json()).try_init(),
        (_, Some(file)) => subscriber
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .try_init(),
        (_, None) => subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [manager]
        channel_pool_size = 8

        [logging]
        level = "debug"

        [[links]]
        name = "radio"
        [links.transport]
        kind = "serial"
        port_name = "/dev/ttyUSB0"

        [[links]]
        name = "flow-sensor"
        auxiliary = true
        [links.transport]
        kind = "udp"
        local_port = 14560
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.manager.channel_pool_size, 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.links.len(), 2);
        assert!(config.links[1].auxiliary);
        assert!(matches!(config.links[0].transport, TransportKind::Serial(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.links[0].name, "radio");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/skylink.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = Config::example();
        let first = config.links[0].clone();
        config.links.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let example = Config::example();
        assert!(example.validate().is_ok());

        let text = example.to_toml().unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.links.len(), example.links.len());
        assert!(parsed.links.iter().any(|l| l.persistent && l.name == "udp-14550"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.links.is_empty());
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.manager.channel_pool_size, 16);
    }
}
