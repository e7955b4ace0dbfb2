//! Node configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Default protocol port for TCP and UDP.
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum frame payload size in bytes (64 MiB).
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Default payload size of one file part (100 KiB).
pub const DEFAULT_BUFFER_SIZE: u32 = 102_400;

/// Default directory for received files.
pub const DEFAULT_TEMP_DIR: &str = "./temp";

/// Default timeout for outbound TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by all three layers.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Protocol port. The TCP listener and the UDP socket bind to it,
    /// and outbound traffic targets it on the remote side.
    pub port: u16,

    /// Local bind address. A concrete address doubles as the node's
    /// identity on multi-homed hosts; `0.0.0.0` lets the routing table
    /// pick one.
    pub bind_ip: IpAddr,

    /// When false, UDP datagrams whose source address equals the local
    /// address are dropped before any event is emitted.
    pub forward_all: bool,

    /// Upper bound on a frame's length prefix. Connections announcing a
    /// larger frame are closed without allocating.
    pub max_frame_bytes: u32,

    /// Part payload size used when the caller does not pass one.
    pub default_buffer_size: u32,

    /// Directory where received files are written.
    pub temp_dir: PathBuf,

    /// Timeout for establishing outbound TCP connections.
    pub connect_timeout: Duration,

    /// Optional idle timeout on TCP reads. When it fires the connection
    /// is closed and the peer marked inactive. Off by default.
    pub idle_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            forward_all: false,
            max_frame_bytes: MAX_FRAME_BYTES,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl LinkConfig {
    /// Create a configuration with the given protocol port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Set the local bind address (and local identity).
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Deliver UDP datagrams that originate from the local address.
    pub fn with_forward_all(mut self, forward_all: bool) -> Self {
        self.forward_all = forward_all;
        self
    }

    /// Set the maximum accepted frame size.
    pub fn with_max_frame_bytes(mut self, max: u32) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Set the default file-part payload size.
    pub fn with_default_buffer_size(mut self, size: u32) -> Self {
        self.default_buffer_size = size;
        self
    }

    /// Set the directory for received files.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the outbound connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable an idle timeout on TCP reads.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_frame_bytes, MAX_FRAME_BYTES);
        assert_eq!(config.default_buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!config.forward_all);
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.temp_dir, PathBuf::from("./temp"));
    }

    #[test]
    fn test_config_builder() {
        let config = LinkConfig::new(9999)
            .with_bind_ip("127.0.0.1".parse().unwrap())
            .with_forward_all(true)
            .with_default_buffer_size(4096)
            .with_connect_timeout(Duration::from_secs(2))
            .with_idle_timeout(Duration::from_secs(30));

        assert_eq!(config.port, 9999);
        assert!(config.forward_all);
        assert_eq!(config.default_buffer_size, 4096);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }
}
