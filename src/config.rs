use std::path::PathBuf;
use std::time::Duration;

use size::Size;

use crate::transfer::{PeerVerify, TransferConfig};

/// Settings of one measurement run
#[derive(Clone, Debug)]
pub struct Config {
    // Endpoints
    /// Reports the caller's address, location and provider
    pub config_url: String,
    /// Lists the measurement servers
    pub servers_url: String,
    /// Resource downloaded from the selected server, relative to its URL
    pub download_resource: String,
    /// Resource the upload is posted to, relative to the selected server's URL
    pub upload_resource: String,
    /// Host measured against when no server could be selected
    pub fallback_host: Option<String>,

    // Cache Settings
    /// Directory holding the server list cache
    pub cache_dir: PathBuf,
    /// Name of the cached server list
    pub cache_name: String,

    // Measurement Settings
    /// Download ceiling, and exact upload body size
    pub transfer_size: Size,
    /// Size of each upload fragment
    pub upload_fragment: usize,
    /// Byte the upload body is filled with
    pub upload_fill: u8,
    /// Resumptions allowed per download after a connection failure
    pub max_retries: usize,

    // Transport Settings
    /// Used for the config and server list endpoints
    pub secure: TransferConfig,
    /// Used for the measurement server
    pub plain: TransferConfig,
}

impl Config {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            config_url: "https://www.speedtest.net/speedtest-config.php".to_string(),
            servers_url: "https://www.speedtest.net/speedtest-servers-static.php".to_string(),
            download_resource: "random3500x3500.jpg".to_string(),
            upload_resource: "upload.php".to_string(),
            fallback_host: None,
            cache_dir,
            cache_name: "speedtest-servers-static.xml".to_string(),
            transfer_size: Size::from_kibibytes(50),
            upload_fragment: 1024,
            upload_fill: 0x5A,
            max_retries: 3,
            secure: TransferConfig::default(),
            plain: TransferConfig::default(),
        }
    }

    pub fn with_config_url(mut self, url: impl Into<String>) -> Self {
        self.config_url = url.into();
        self
    }

    pub fn with_servers_url(mut self, url: impl Into<String>) -> Self {
        self.servers_url = url.into();
        self
    }

    pub fn with_fallback_host(mut self, host: Option<String>) -> Self {
        self.fallback_host = host;
        self
    }

    pub fn with_transfer_size(mut self, size: Size) -> Self {
        self.transfer_size = size;
        self
    }

    pub fn with_max_retries(mut self, n: usize) -> Self {
        self.max_retries = n;
        self
    }

    /// Trust material for the secure endpoints.
    pub fn with_trust(mut self, trust: Vec<PathBuf>) -> Self {
        self.secure = self.secure.with_trust(trust);
        self
    }

    pub fn with_access_network(mut self, network: Option<String>) -> Self {
        if let Some(network) = network {
            self.secure = self.secure.with_access_network(network.clone());
            self.plain = self.plain.with_access_network(network);
        }
        self
    }

    pub fn with_prefer_ipv6(mut self, prefer_ipv6: bool) -> Self {
        self.secure = self.secure.with_prefer_ipv6(prefer_ipv6);
        self.plain = self.plain.with_prefer_ipv6(prefer_ipv6);
        self
    }

    pub fn with_peer_verify(mut self, verify: PeerVerify) -> Self {
        self.secure = self.secure.with_verify(verify);
        self
    }

    /// Fragment buffer size for every connection, 0 for the default.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.secure = self.secure.with_fragment_size(size);
        self.plain = self.plain.with_fragment_size(size);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.secure = self.secure.with_receive_timeout(timeout);
        self.plain = self.plain.with_receive_timeout(timeout);
        self
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(&self.cache_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new(PathBuf::from("cache"));
        assert_eq!(config.transfer_size.bytes(), 51200);
        assert_eq!(config.cache_path(), PathBuf::from("cache/speedtest-servers-static.xml"));
        assert!(config.secure.trust.is_empty());
        assert_eq!(config.plain.fragment_size(), 2048);
    }

    #[test]
    fn transport_settings_apply_to_both_endpoints() {
        let config = Config::new(PathBuf::from("cache"))
            .with_trust(vec![PathBuf::from("DigiCertGlobalRootCA.pem")])
            .with_access_network(Some("wwan0".to_string()))
            .with_prefer_ipv6(true);

        assert_eq!(config.secure.trust.len(), 1);
        assert!(config.plain.trust.is_empty());
        assert_eq!(config.secure.access_network.as_deref(), Some("wwan0"));
        assert_eq!(config.plain.access_network.as_deref(), Some("wwan0"));
        assert!(config.secure.prefer_ipv6 && config.plain.prefer_ipv6);
    }

    #[test]
    fn buffer_and_timeout_overrides() {
        let config = Config::new(PathBuf::from("cache"))
            .with_peer_verify(PeerVerify::None)
            .with_fragment_size(4096)
            .with_receive_timeout(Duration::from_secs(10));

        assert_eq!(config.secure.verify, PeerVerify::None);
        assert_eq!(config.plain.verify, PeerVerify::Required);
        assert_eq!(config.secure.fragment_size(), 4096);
        assert_eq!(config.plain.fragment_size(), 4096);
        assert_eq!(config.plain.receive_timeout, Duration::from_secs(10));
    }
}
