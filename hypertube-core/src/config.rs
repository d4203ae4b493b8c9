//! Centralized configuration for Hypertube.
//!
//! Built once at startup and passed down to the tracker clients, the peer
//! pool, the scheduler and the file writer.

use std::path::PathBuf;
use std::time::Duration;

use crate::tracing_setup::CliLogLevel;

/// Central configuration for all Hypertube components.
#[derive(Debug, Clone, Default)]
pub struct HypertubeConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

/// Peer wire and piece download parameters.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Prefix of the generated 20-byte peer id
    pub client_prefix: &'static str,
    /// Port announced to trackers
    pub peer_port: u16,
    /// Maximum outstanding block requests per piece
    pub max_backlog: usize,
    /// Largest block requested from a peer
    pub max_block_size: u32,
    /// Rolling deadline for each read while downloading a piece
    pub piece_read_timeout: Duration,
    /// Capacity of the verified piece results channel
    pub results_capacity: usize,
    /// How long a worker whose peer has none of the queued pieces waits for
    /// a `have` before popping again
    pub idle_peer_wait: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_prefix: "-HT0001-",
            peer_port: 6881,
            max_backlog: 5,
            max_block_size: 16384,
            piece_read_timeout: Duration::from_secs(30),
            results_capacity: 100,
            idle_peer_wait: Duration::from_millis(250),
        }
    }
}

/// Tracker and peer connection timing.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Whole-request timeout for HTTP trackers
    pub http_tracker_timeout: Duration,
    /// UDP connect round trip timeout
    pub udp_connect_timeout: Duration,
    /// UDP announce round trip timeout
    pub udp_announce_timeout: Duration,
    /// UDP scrape round trip timeout
    pub udp_scrape_timeout: Duration,
    /// TCP dial timeout for peers
    pub peer_dial_timeout: Duration,
    /// Deadline for the peer handshake exchange
    pub handshake_timeout: Duration,
    /// Deadline for the first message after the handshake
    pub bitfield_timeout: Duration,
    /// Capacity of the activated connections channel
    pub activated_connections_capacity: usize,
    /// Refresh period used when a tracker reports no interval
    pub default_refresh_interval: Duration,
    /// Lower bound on the peer set refresh period
    pub min_refresh_interval: Duration,
    /// Number of peers requested from UDP trackers, -1 lets the tracker decide
    pub desired_peers: i32,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_tracker_timeout: Duration::from_secs(15),
            udp_connect_timeout: Duration::from_secs(3),
            udp_announce_timeout: Duration::from_secs(10),
            udp_scrape_timeout: Duration::from_secs(10),
            peer_dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            activated_connections_capacity: 64,
            default_refresh_interval: Duration::from_secs(1800), // 30 minutes
            min_refresh_interval: Duration::from_secs(60),
            desired_peers: -1,
            user_agent: "hypertube/0.1.0",
        }
    }
}

/// Output location and write queue sizing.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory downloaded files are written into
    pub files_dir: PathBuf,
    /// Capacity of the write task queue feeding the file writer
    pub write_queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("./files"),
            write_queue_capacity: 256,
        }
    }
}

/// HTTP server and logging settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: CliLogLevel,
    /// Emit JSON log lines instead of the human format
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: CliLogLevel::Info,
            json_logs: false,
        }
    }
}

impl HypertubeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values keep their defaults and are reported with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("TORRENT_PEER_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.torrent.peer_port = port,
                Err(_) => tracing::warn!(
                    "Invalid TORRENT_PEER_PORT '{}', using {}",
                    port,
                    config.torrent.peer_port
                ),
            }
        }

        if let Ok(dir) = std::env::var("FILES_DIR") {
            config.storage.files_dir = PathBuf::from(dir);
        }

        if let Ok(timeout) = std::env::var("HYPERTUBE_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.http_tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(host) = std::env::var("HYPERTUBE_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("HYPERTUBE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            match level.parse::<CliLogLevel>() {
                Ok(level) => config.server.log_level = level,
                Err(e) => tracing::warn!("{}, using {}", e, config.server.log_level),
            }
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.server.json_logs = format.eq_ignore_ascii_case("json");
        }

        config
    }

    /// Creates a configuration with short timeouts for loopback tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.torrent.piece_read_timeout = Duration::from_secs(5);
        config.torrent.idle_peer_wait = Duration::from_millis(20);
        config.network.http_tracker_timeout = Duration::from_secs(2);
        config.network.udp_connect_timeout = Duration::from_millis(500);
        config.network.udp_announce_timeout = Duration::from_millis(500);
        config.network.udp_scrape_timeout = Duration::from_millis(500);
        config.network.peer_dial_timeout = Duration::from_secs(1);
        config.network.handshake_timeout = Duration::from_secs(1);
        config.network.bitfield_timeout = Duration::from_secs(1);
        config.network.min_refresh_interval = Duration::from_millis(100);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = HypertubeConfig::default();

        assert_eq!(config.torrent.client_prefix, "-HT0001-");
        assert_eq!(config.torrent.client_prefix.len(), 8);
        assert_eq!(config.torrent.peer_port, 6881);
        assert_eq!(config.torrent.max_backlog, 5);
        assert_eq!(config.torrent.max_block_size, 16384);
        assert_eq!(config.torrent.piece_read_timeout, Duration::from_secs(30));
        assert_eq!(config.torrent.idle_peer_wait, Duration::from_millis(250));
        assert_eq!(config.network.http_tracker_timeout, Duration::from_secs(15));
        assert_eq!(config.network.udp_connect_timeout, Duration::from_secs(3));
        assert_eq!(config.network.udp_announce_timeout, Duration::from_secs(10));
        assert_eq!(config.network.peer_dial_timeout, Duration::from_secs(10));
        assert_eq!(config.network.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.network.bitfield_timeout, Duration::from_secs(5));
        assert!(!config.server.json_logs);
    }

    #[test]
    fn test_testing_preset_shortens_timeouts() {
        let config = HypertubeConfig::for_testing();
        let defaults = HypertubeConfig::default();

        assert!(config.torrent.piece_read_timeout < defaults.torrent.piece_read_timeout);
        assert!(config.network.peer_dial_timeout < defaults.network.peer_dial_timeout);
        assert_eq!(config.torrent.max_backlog, defaults.torrent.max_backlog);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("TORRENT_PEER_PORT", "51413");
            std::env::set_var("FILES_DIR", "/tmp/hypertube-files");
            std::env::set_var("HYPERTUBE_TRACKER_TIMEOUT", "20");
            std::env::set_var("LOG_LEVEL", "debug");
            std::env::set_var("LOG_FORMAT", "JSON");
        }

        let config = HypertubeConfig::from_env();

        assert_eq!(config.torrent.peer_port, 51413);
        assert_eq!(config.storage.files_dir, PathBuf::from("/tmp/hypertube-files"));
        assert_eq!(config.network.http_tracker_timeout, Duration::from_secs(20));
        assert!(matches!(config.server.log_level, CliLogLevel::Debug));
        assert!(config.server.json_logs);

        unsafe {
            std::env::set_var("TORRENT_PEER_PORT", "not-a-port");
        }
        let config = HypertubeConfig::from_env();
        assert_eq!(config.torrent.peer_port, 6881);

        // Cleanup
        unsafe {
            std::env::remove_var("TORRENT_PEER_PORT");
            std::env::remove_var("FILES_DIR");
            std::env::remove_var("HYPERTUBE_TRACKER_TIMEOUT");
            std::env::remove_var("LOG_LEVEL");
            std::env::remove_var("LOG_FORMAT");
        }
    }
}
