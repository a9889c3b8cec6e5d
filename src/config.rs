//! WolfTunnel Configuration
//!
//! This module provides configuration structures for the tunnel relay.
//! Everything is loaded from a single TOML file and validated before the
//! relay starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for `tunnel.buffer_size`
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Main WolfTunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfTunnelConfig {
    /// Tunnel / relay settings
    pub tunnel: TunnelConfig,

    /// Peer cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// WebSocket transport settings
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// TLS settings (wss and tls protocols)
    #[serde(default)]
    pub tls: TlsConfig,

    /// Virtual network interface settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport protocol spoken on the listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// WebSocket, one packet per binary message
    Ws,
    /// WebSocket over TLS
    Wss,
    /// Raw length-prefixed frames over plain TCP
    Tcp,
    /// Raw length-prefixed frames over TLS
    Tls,
}

impl Protocol {
    /// Whether the listener must terminate TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, Protocol::Wss | Protocol::Tls)
    }

    /// Whether sessions are message framed (WebSocket) rather than raw frames
    pub fn is_message_framed(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel / relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Pre-shared key; derives the auth key, obfuscation pad and cipher key
    pub key: String,

    /// Transport protocol
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Address to listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Enable the XOR obfuscation stage
    #[serde(default = "default_true")]
    pub obfuscate: bool,

    /// Enable LZ4 compression stage
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Enable the ChaCha20-Poly1305 stage (raw-frame transports only)
    #[serde(default = "default_true")]
    pub cipher: bool,

    /// Packet buffer size, also the largest accepted frame length
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Disable client-to-client forwarding through the relay
    #[serde(default)]
    pub isolate_clients: bool,

    /// WebSocket handshake timeout and idle wait between raw frames, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Deadline for each partial read inside a handshake or frame, in seconds
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,
}

/// Peer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Sliding TTL of an address binding, in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// How often expired bindings are physically removed, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// WebSocket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Upgrade path
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Interval between server pings, in seconds (0 disables)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: Option<PathBuf>,

    /// PEM private key
    pub key_path: Option<PathBuf>,
}

/// Virtual network interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Interface name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// IPv4 address/prefix assigned to the interface
    #[serde(default)]
    pub ipv4_cidr: Option<String>,

    /// IPv6 address/prefix assigned to the interface
    #[serde(default)]
    pub ipv6_cidr: Option<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_protocol() -> Protocol {
    Protocol::Ws
}

fn default_bind_address() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_buffer_size() -> usize {
    65535
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_frame_timeout_secs() -> u64 {
    9
}

fn default_cache_ttl_secs() -> u64 {
    15 * 60
}

fn default_sweep_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_keepalive_secs() -> u64 {
    25
}

fn default_device_name() -> String {
    "tun0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            mtu: default_mtu(),
            ipv4_cidr: None,
            ipv6_cidr: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    /// Build a tunnel section with defaults around the given key
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            protocol: default_protocol(),
            bind_address: default_bind_address(),
            obfuscate: true,
            compress: true,
            cipher: true,
            buffer_size: default_buffer_size(),
            isolate_clients: false,
            timeout_secs: default_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
        }
    }

    /// WebSocket handshake timeout / raw idle timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Per-partial-read deadline
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl WebSocketConfig {
    /// Server ping interval, `None` when keepalive is disabled (0)
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

impl WolfTunnelConfig {
    /// Configuration with every default around the given key
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            tunnel: TunnelConfig::with_key(key),
            cache: CacheConfig::default(),
            websocket: WebSocketConfig::default(),
            tls: TlsConfig::default(),
            device: DeviceConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfTunnelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.tunnel.key.is_empty() {
            return Err(crate::Error::Config("tunnel.key cannot be empty".into()));
        }

        if self.tunnel.bind_address.is_empty() {
            return Err(crate::Error::Config("tunnel.bind_address cannot be empty".into()));
        }

        if self.tunnel.buffer_size == 0 || self.tunnel.buffer_size > MAX_BUFFER_SIZE {
            return Err(crate::Error::Config(format!(
                "tunnel.buffer_size must be between 1 and {}",
                MAX_BUFFER_SIZE
            )));
        }

        if self.tunnel.frame_timeout_secs == 0 {
            return Err(crate::Error::Config("tunnel.frame_timeout_secs cannot be 0".into()));
        }

        if self.tunnel.timeout_secs == 0 {
            return Err(crate::Error::Config("tunnel.timeout_secs cannot be 0".into()));
        }

        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "cache.ttl_secs and cache.sweep_interval_secs must be positive".into(),
            ));
        }

        if self.tunnel.protocol.is_message_framed() && !self.websocket.path.starts_with('/') {
            return Err(crate::Error::Config("websocket.path must start with '/'".into()));
        }

        if self.tunnel.protocol.uses_tls()
            && (self.tls.cert_path.is_none() || self.tls.key_path.is_none())
        {
            return Err(crate::Error::Config(format!(
                "protocol {} requires tls.cert_path and tls.key_path",
                self.tunnel.protocol
            )));
        }

        Ok(())
    }
}

/// Sample configuration written by `wolftunnel init`
pub fn sample_config(key: &str) -> String {
    format!(
        r#"# WolfTunnel configuration

[tunnel]
# Pre-shared key, must match every client
key = "{key}"
# ws | wss | tcp | tls
protocol = "ws"
bind_address = "0.0.0.0:8443"
obfuscate = true
compress = true
# Only used by the raw-frame protocols (tcp, tls)
cipher = true
buffer_size = 65535
# Set to true to stop clients reaching each other through the relay
isolate_clients = false
timeout_secs = 60
frame_timeout_secs = 9

[cache]
ttl_secs = 900
sweep_interval_secs = 86400

[websocket]
path = "/"
keepalive_secs = 25

[tls]
# cert_path = "/etc/wolftunnel/cert.pem"
# key_path = "/etc/wolftunnel/key.pem"

[device]
name = "tun0"
mtu = 1500
# ipv4_cidr = "10.0.0.1/24"
# ipv6_cidr = "fd00::1/64"

[api]
enabled = true
bind_address = "127.0.0.1:8080"

[logging]
level = "info"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[tunnel]
key = "correct horse battery staple"
protocol = "tcp"
bind_address = "0.0.0.0:9000"
isolate_clients = true

[cache]
ttl_secs = 60
"#;

        let config = WolfTunnelConfig::from_str(toml).unwrap();
        assert_eq!(config.tunnel.protocol, Protocol::Tcp);
        assert!(config.tunnel.isolate_clients);
        assert_eq!(config.tunnel.buffer_size, 65535);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(86400));
        assert_eq!(config.websocket.path, "/");
    }

    #[test]
    fn test_empty_key_rejected() {
        let toml = r#"
[tunnel]
key = ""
"#;
        let err = WolfTunnelConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_tls_protocol_requires_certificate() {
        let toml = r#"
[tunnel]
key = "k"
protocol = "wss"
"#;
        assert!(WolfTunnelConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let toml = format!(
            "[tunnel]\nkey = \"k\"\nbuffer_size = {}\n",
            MAX_BUFFER_SIZE + 1
        );
        assert!(WolfTunnelConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = WolfTunnelConfig::from_str(&sample_config("secret")).unwrap();
        assert_eq!(config.tunnel.key, "secret");
        assert_eq!(config.tunnel.protocol, Protocol::Ws);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolftunnel.toml");
        std::fs::write(&path, sample_config("file-key")).unwrap();

        let config = WolfTunnelConfig::from_file(&path).unwrap();
        assert_eq!(config.tunnel.key, "file-key");
    }
}
