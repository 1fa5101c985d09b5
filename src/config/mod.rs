//! Configuration module
//!
//! Handles loading and saving framelink configuration, and turns it into the
//! option structs the transports take.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{
    ConnectionOptions, MulticastOptions, MulticastTtl, MulticastTtlTable, SendOption, UdpOption,
    UdpOptions, DEFAULT_MAX_UNSENT_ASYNC_MESSAGES, DEFAULT_RESERVED_BUFFER_SIZE,
    DEFAULT_UDP_BUF_SIZE, UDP_DATAGRAM_MAX_SIZE,
};
use crate::protocol::{
    ArchiveType, DefaultMessageBuilder, Endpoint, FrameDecoder, MagicString, ProtocolError,
    DEFAULT_MAGIC_STRING, DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN,
};

/// Default TCP port
pub const DEFAULT_TCP_PORT: u16 = 22000;

/// Default UDP port
pub const DEFAULT_UDP_PORT: u16 = 22001;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid protocol settings: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Framing settings shared by every transport
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub tcp: TcpConfig,

    #[serde(default)]
    pub udp: UdpConfig,

    #[serde(default)]
    pub multicast: MulticastConfig,

    /// I/O thread group settings
    #[serde(default)]
    pub io: IoConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this host
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Magic string stamped on and expected in every header (1 to 15 bytes)
    #[serde(default = "default_magic_string")]
    pub magic_string: String,
    /// Largest accepted frame, header included
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Archive used by typed senders
    #[serde(default)]
    pub default_archive: ArchiveType,
}

fn default_magic_string() -> String {
    DEFAULT_MAGIC_STRING.to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            magic_string: default_magic_string(),
            max_message_size: default_max_message_size(),
            default_archive: ArchiveType::default(),
        }
    }
}

/// TCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Port the server listens on
    #[serde(default = "default_tcp_port")]
    pub listen_port: u16,
    /// Server a client connects to
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_tcp_port")]
    pub server_port: u16,
    #[serde(default)]
    pub send_option: SendOption,
    #[serde(default = "default_max_unsent")]
    pub max_unsent_async_messages: usize,
    /// Initial read buffer capacity per connection
    #[serde(default = "default_reserved_buffer_size")]
    pub reserved_buffer_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_unsent() -> usize {
    DEFAULT_MAX_UNSENT_ASYNC_MESSAGES
}

fn default_reserved_buffer_size() -> usize {
    DEFAULT_RESERVED_BUFFER_SIZE
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen_port: default_tcp_port(),
            server_host: default_server_host(),
            server_port: default_tcp_port(),
            send_option: SendOption::default(),
            max_unsent_async_messages: default_max_unsent(),
            reserved_buffer_size: default_reserved_buffer_size(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// UDP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_udp_port")]
    pub port: u16,
    #[serde(default)]
    pub udp_option: UdpOption,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Kernel socket buffer size
    #[serde(default = "default_udp_buffer_size")]
    pub buffer_size: usize,
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_max_datagram_size() -> usize {
    UDP_DATAGRAM_MAX_SIZE
}

fn default_udp_buffer_size() -> usize {
    DEFAULT_UDP_BUF_SIZE
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: default_udp_port(),
            udp_option: UdpOption::default(),
            max_datagram_size: default_max_datagram_size(),
            buffer_size: default_udp_buffer_size(),
        }
    }
}

/// Multicast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastConfig {
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_multicast_port")]
    pub port: u16,
    #[serde(default)]
    pub ttl: MulticastTtl,
    #[serde(default)]
    pub ttl_table: MulticastTtlTable,
    /// Local interface address (0.0.0.0 = any)
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_true")]
    pub loopback: bool,
    #[serde(default = "default_udp_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_udp_buffer_size")]
    pub recv_buffer_size: usize,
}

fn default_group() -> String {
    "239.255.0.1".to_string()
}

fn default_multicast_port() -> u16 {
    22002
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_true() -> bool {
    true
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_multicast_port(),
            ttl: MulticastTtl::default(),
            ttl_table: MulticastTtlTable::default(),
            interface: default_interface(),
            loopback: default_true(),
            send_buffer_size: default_udp_buffer_size(),
            recv_buffer_size: default_udp_buffer_size(),
        }
    }
}

/// I/O thread group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("framelink/config.toml")),
            Some(PathBuf::from("./framelink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> ConfigResult<()> {
        MagicString::new(&self.protocol.magic_string)?;

        if self.protocol.max_message_size < HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_message_size must be at least {} bytes",
                HEADER_LEN
            )));
        }
        if self.protocol.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "protocol.max_message_size does not fit the 32-bit length field".to_string(),
            ));
        }
        if self.tcp.max_unsent_async_messages == 0 {
            return Err(ConfigError::Invalid(
                "tcp.max_unsent_async_messages must be at least 1".to_string(),
            ));
        }
        if self.udp.max_datagram_size < HEADER_LEN || self.udp.max_datagram_size > UDP_DATAGRAM_MAX_SIZE {
            return Err(ConfigError::Invalid(format!(
                "udp.max_datagram_size must be between {} and {}",
                HEADER_LEN, UDP_DATAGRAM_MAX_SIZE
            )));
        }
        if self.io.worker_threads == 0 {
            return Err(ConfigError::Invalid("io.worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn magic_string(&self) -> ConfigResult<MagicString> {
        Ok(MagicString::new(&self.protocol.magic_string)?)
    }

    pub fn decoder(&self) -> ConfigResult<FrameDecoder> {
        Ok(FrameDecoder::new(self.magic_string()?, self.protocol.max_message_size))
    }

    pub fn message_builder(&self) -> ConfigResult<DefaultMessageBuilder> {
        Ok(DefaultMessageBuilder::new(
            self.magic_string()?,
            self.protocol.max_message_size,
        ))
    }

    pub fn server_endpoint(&self) -> Endpoint {
        Endpoint::new(self.tcp.server_host.clone(), self.tcp.server_port)
    }

    pub fn multicast_group(&self) -> Endpoint {
        Endpoint::new(self.multicast.group.clone(), self.multicast.port)
    }

    pub fn connection_options(&self) -> ConfigResult<ConnectionOptions> {
        Ok(ConnectionOptions {
            send_option: self.tcp.send_option,
            max_unsent: self.tcp.max_unsent_async_messages,
            reserved_buffer_size: self.tcp.reserved_buffer_size,
            decoder: self.decoder()?,
            connect_timeout: Duration::from_millis(self.tcp.connect_timeout_ms),
        })
    }

    pub fn udp_options(&self) -> ConfigResult<UdpOptions> {
        Ok(UdpOptions {
            udp_option: self.udp.udp_option,
            max_datagram_size: self.udp.max_datagram_size,
            buffer_size: self.udp.buffer_size,
            decoder: self.decoder()?,
        })
    }

    pub fn multicast_options(&self) -> ConfigResult<MulticastOptions> {
        Ok(MulticastOptions {
            ttl: self.multicast.ttl,
            ttl_table: self.multicast.ttl_table,
            interface: self.multicast.interface,
            loopback: self.multicast.loopback,
            max_datagram_size: self.udp.max_datagram_size,
            send_buffer_size: self.multicast.send_buffer_size,
            recv_buffer_size: self.multicast.recv_buffer_size,
            decoder: self.decoder()?,
        })
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "sensor-gateway".to_string(),
            verbose: false,
        },
        protocol: ProtocolConfig {
            default_archive: ArchiveType::Json,
            ..Default::default()
        },
        io: IoConfig { worker_threads: 4 },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.protocol.magic_string, "_BEGIN_MESSAGE_");
        assert_eq!(config.tcp.max_unsent_async_messages, 1000);
        assert_eq!(config.tcp.reserved_buffer_size, 512 * 1024);
        assert_eq!(config.udp.max_datagram_size, 65507);
        assert_eq!(config.udp.buffer_size, 8192);
        assert_eq!(config.multicast.ttl, MulticastTtl::SameSubnet);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.tcp.listen_port = 4100;
        config.protocol.default_archive = ArchiveType::Xml;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.tcp.listen_port, 4100);
        assert_eq!(loaded.protocol.default_archive, ArchiveType::Xml);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[tcp]\nsend_option = \"nagle_on\"\n[multicast]\nttl = \"same_site\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tcp.send_option, SendOption::NagleOn);
        assert_eq!(config.tcp.listen_port, DEFAULT_TCP_PORT);
        assert_eq!(config.multicast_options().unwrap().ttl_table.ttl(config.multicast.ttl), 32);
    }

    #[test]
    fn test_invalid_magic_string_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[protocol]\nmagic_string = \"THIS_IS_FAR_TOO_LONG\"").unwrap();

        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Protocol(ProtocolError::InvalidMagicString(_)))
        ));
    }

    #[test]
    fn test_zero_unsent_limit_rejected() {
        let mut config = Config::default();
        config.tcp.max_unsent_async_messages = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/framelink.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "sensor-gateway");
        assert_eq!(parsed.protocol.default_archive, ArchiveType::Json);
    }
}
