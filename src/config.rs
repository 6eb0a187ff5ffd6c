//! Configuration handling for HKUST VPN

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid host name: {0:?}")]
    InvalidHost(String),
}

const APP_DIR: &str = "hkust-vpn";
const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Missing keys in any section take the built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Login page of the gateway; also the URL handed to openconnect
    pub url: String,
    pub protocol: String,
    /// Name of the session cookie the gateway issues after login
    pub cookie_name: String,
    /// Identity used for the SSO page (optional, will prompt if not set)
    pub user: Option<String>,
    /// An empty string disables the default proxy
    pub proxy: Option<String>,
    pub hosts: Vec<String>,
    pub openconnect: String,
    pub vpn_slice: String,
}

/// Side-channel DNS fix that runs while the tunnel comes up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,
    pub server: String,
    pub interface: String,
    pub attempts: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Sessions shorter than this count as immediate failures
    pub short_session_secs: u64,
    pub long_backoff_secs: u64,
    pub short_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: String,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            url: "https://remote.ust.hk/mfa".to_string(),
            protocol: "nc".to_string(),
            cookie_name: "DSID".to_string(),
            user: None,
            proxy: Some("http://127.0.0.1:7890".to_string()),
            hosts: vec!["superpod.ust.hk".to_string()],
            openconnect: "openconnect".to_string(),
            vpn_slice: "vpn-slice".to_string(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "143.89.14.7".to_string(),
            interface: "tun0".to_string(),
            attempts: 20,
            interval_secs: 3,
            timeout_secs: 3,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            short_session_secs: 30,
            long_backoff_secs: 10,
            short_backoff_secs: 5,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                         AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl ReconnectConfig {
    pub fn short_session(&self) -> Duration {
        Duration::from_secs(self.short_session_secs)
    }

    pub fn long_backoff(&self) -> Duration {
        Duration::from_secs(self.long_backoff_secs)
    }

    pub fn short_backoff(&self) -> Duration {
        Duration::from_secs(self.short_backoff_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Proxy for this run: `--no-proxy` wins, then `--proxy`, then the file
pub fn resolve_proxy(cli_proxy: Option<&str>, no_proxy: bool, vpn: &VpnConfig) -> Option<String> {
    if no_proxy {
        return None;
    }
    cli_proxy
        .or(vpn.proxy.as_deref())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Hosts to route: `--hosts` replaces the configured list as a whole
///
/// Every name ends up in the vpn-slice command line that openconnect runs
/// through a shell, so anything that is not a plain host name is rejected.
pub fn resolve_hosts(cli_hosts: &[String], vpn: &VpnConfig) -> Result<Vec<String>, ConfigError> {
    let hosts = if cli_hosts.is_empty() {
        &vpn.hosts
    } else {
        cli_hosts
    };
    match hosts.iter().find(|h| !is_valid_hostname(h)) {
        Some(bad) => Err(ConfigError::InvalidHost(bad.clone())),
        None => Ok(hosts.to_vec()),
    }
}

/// Login identity: flag, then stored bundle, then the file; `None` means prompt
pub fn resolve_identity(
    cli_user: Option<&str>,
    stored: Option<&str>,
    vpn: &VpnConfig,
) -> Option<String> {
    [cli_user, stored, vpn.user.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|identity| !identity.is_empty())
        .map(str::to_string)
}

/// Dot-separated labels of ASCII letters, digits and inner hyphens
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Per-user directory holding the config and credential files
pub fn app_dir() -> Option<PathBuf> {
    if let Some(config) = dirs::config_dir() {
        return Some(config.join(APP_DIR));
    }

    // Fallback: use HOME/.config
    dirs::home_dir().map(|home| home.join(".config").join(APP_DIR))
}

pub fn default_config_path() -> Option<PathBuf> {
    app_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.vpn.url, "https://remote.ust.hk/mfa");
        assert_eq!(config.vpn.protocol, "nc");
        assert_eq!(config.vpn.cookie_name, "DSID");
        assert_eq!(config.vpn.hosts, vec!["superpod.ust.hk".to_string()]);
        assert!(config.dns.enabled);
        assert_eq!(config.reconnect.short_session(), Duration::from_secs(30));
        assert!(!config.browser.headless);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let config = Config::default();
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.vpn.url, config.vpn.url);
        assert_eq!(loaded.vpn.proxy, config.vpn.proxy);
        assert_eq!(loaded.vpn.hosts, config.vpn.hosts);
        assert_eq!(loaded.dns.server, config.dns.server);
    }

    #[test]
    fn test_proxy_only_vpn_section_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[vpn]\nproxy = \"http://127.0.0.1:1080\"\n").unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.vpn.proxy.as_deref(), Some("http://127.0.0.1:1080"));
        assert_eq!(loaded.vpn.url, "https://remote.ust.hk/mfa");
        assert_eq!(loaded.vpn.protocol, "nc");
        assert_eq!(loaded.vpn.hosts, vec!["superpod.ust.hk".to_string()]);
        assert_eq!(loaded.vpn.cookie_name, "DSID");
    }

    #[test]
    fn test_reconnect_only_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[reconnect]\nlong_backoff_secs = 60\n").unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.reconnect.long_backoff_secs, 60);
        assert_eq!(loaded.reconnect.short_backoff_secs, 5);
        assert_eq!(loaded.vpn.url, "https://remote.ust.hk/mfa");
        assert_eq!(loaded.vpn.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert!(loaded.dns.enabled);
    }

    #[test]
    fn test_no_proxy_wins_over_everything() {
        let vpn = VpnConfig::default();
        assert_eq!(resolve_proxy(Some("http://cli:1"), true, &vpn), None);
        assert_eq!(resolve_proxy(None, true, &vpn), None);
    }

    #[test]
    fn test_cli_proxy_overrides_config() {
        let vpn = VpnConfig::default();
        assert_eq!(
            resolve_proxy(Some("http://cli:1"), false, &vpn).as_deref(),
            Some("http://cli:1")
        );
        assert_eq!(
            resolve_proxy(None, false, &vpn).as_deref(),
            Some("http://127.0.0.1:7890")
        );
    }

    #[test]
    fn test_empty_config_proxy_means_direct() {
        let vpn = VpnConfig {
            proxy: Some(String::new()),
            ..VpnConfig::default()
        };
        assert_eq!(resolve_proxy(None, false, &vpn), None);
    }

    #[test]
    fn test_cli_hosts_replace_config_hosts() {
        let vpn = VpnConfig::default();
        let cli = vec!["a.ust.hk".to_string(), "b.ust.hk".to_string()];

        assert_eq!(resolve_hosts(&cli, &vpn).unwrap(), cli);
        assert_eq!(resolve_hosts(&[], &vpn).unwrap(), vpn.hosts);
    }

    #[test]
    fn test_hosts_with_shell_metacharacters_rejected() {
        let vpn = VpnConfig::default();
        for bad in ["a.ust.hk;id", "$(reboot)", "a b", "`id`", "-rf", "a..b", ""] {
            let result = resolve_hosts(&[bad.to_string()], &vpn);
            assert!(
                matches!(&result, Err(ConfigError::InvalidHost(h)) if h == bad),
                "{:?} accepted",
                bad
            );
        }

        let tainted = VpnConfig {
            hosts: vec!["ok.ust.hk".to_string(), "x|sh".to_string()],
            ..VpnConfig::default()
        };
        assert!(resolve_hosts(&[], &tainted).is_err());
    }

    #[test]
    fn test_valid_hostnames() {
        assert!(is_valid_hostname("superpod.ust.hk"));
        assert!(is_valid_hostname("gpu-01.cse.ust.hk"));
        assert!(is_valid_hostname("10.0.0.1"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
        assert!(!is_valid_hostname("bad-.ust.hk"));
    }

    #[test]
    fn test_identity_precedence() {
        let vpn = VpnConfig {
            user: Some("config@connect.ust.hk".to_string()),
            ..VpnConfig::default()
        };

        assert_eq!(
            resolve_identity(Some("cli@ust.hk"), Some("stored@ust.hk"), &vpn).as_deref(),
            Some("cli@ust.hk")
        );
        assert_eq!(
            resolve_identity(None, Some("stored@ust.hk"), &vpn).as_deref(),
            Some("stored@ust.hk")
        );
        assert_eq!(
            resolve_identity(None, Some(""), &vpn).as_deref(),
            Some("config@connect.ust.hk")
        );
        assert_eq!(resolve_identity(None, None, &VpnConfig::default()), None);
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        std::fs::write(
            &config_path,
            "[vpn]\n\
             url = \"https://vpn.example.edu/sso\"\n\
             protocol = \"nc\"\n\
             hosts = [\"a.example.edu\", \"b.example.edu\"]\n",
        )
        .unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.vpn.url, "https://vpn.example.edu/sso");
        assert_eq!(loaded.vpn.hosts.len(), 2);
        assert_eq!(loaded.vpn.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(loaded.vpn.openconnect, "openconnect");
        assert_eq!(loaded.dns.interface, "tun0");
        assert_eq!(loaded.reconnect.long_backoff_secs, 10);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.vpn.protocol, "nc");
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");

        std::fs::write(&config_path, "this is not valid toml {{{{").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
