use std::{
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use ipnet::Ipv4Net;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    keys,
};

pub const DEFAULT_CONFIG_PATH: &str = "wg-peer-manager.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyBackend {
    /// `wg genkey` / `wg pubkey`
    WgTool,
    /// In-process x25519
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadMode {
    /// Restart the managing service (drops live sessions briefly).
    Restart,
    /// `wg syncconf` against the stripped config, keeping sessions up.
    Syncconf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusBackend {
    WgShow,
    Netlink,
}

/// Manager settings; any field missing from the file takes its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub interface_name: String,
    pub service_unit: String,
    pub server_config_path: PathBuf,
    pub server_private_key_path: PathBuf,
    pub server_public_key_path: PathBuf,
    pub clients_dir: PathBuf,
    pub registry_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub sessions_path: PathBuf,
    pub subnet: Ipv4Net,
    pub server_address: Ipv4Addr,
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub dns: String,
    pub persistent_keepalive: u16,
    pub default_expiry_days: Option<u32>,
    pub key_backend: KeyBackend,
    pub reload_mode: ReloadMode,
    pub status_backend: StatusBackend,
    pub command_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            interface_name: "wg0".into(),
            service_unit: "wg-quick@wg0".into(),
            server_config_path: "/etc/wireguard/wg0.conf".into(),
            server_private_key_path: "/etc/wireguard/server_private.key".into(),
            server_public_key_path: "/etc/wireguard/server_public.key".into(),
            clients_dir: "clients".into(),
            registry_path: "registry.json".into(),
            audit_log_path: "wg-peer-manager.log".into(),
            sessions_path: "sessions.json".into(),
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Net::from(Ipv4Addr::new(10, 0, 0, 0))),
            server_address: Ipv4Addr::new(10, 0, 0, 1),
            endpoint_host: "127.0.0.1".into(),
            endpoint_port: 51820,
            dns: "8.8.8.8, 8.8.4.4".into(),
            persistent_keepalive: 25,
            default_expiry_days: Some(30),
            key_backend: KeyBackend::WgTool,
            reload_mode: ReloadMode::Restart,
            status_backend: StatusBackend::WgShow,
            command_timeout_secs: 10,
            poll_interval_secs: 60,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subnet.prefix_len() > 30 {
            return Err(Error::Config(format!(
                "subnet {} is too small to hold peers",
                self.subnet
            )));
        }
        if !self.subnet.contains(&self.server_address) {
            return Err(Error::Config(format!(
                "server address {} is outside subnet {}",
                self.server_address, self.subnet
            )));
        }
        if self.endpoint_host.trim().is_empty() {
            return Err(Error::Config("endpoint_host is required".into()));
        }
        if self.endpoint_port == 0 {
            return Err(Error::Config("endpoint_port must be non-zero".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::Config("command_timeout_secs must be non-zero".into()));
        }
        if self.interface_name.is_empty()
            || self
                .interface_name
                .chars()
                .any(|c| c.is_whitespace() || c == '/')
        {
            return Err(Error::Config(
                "interface_name cannot be empty or contain spaces or '/'".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// `host:port` as written into client configs.
    pub fn endpoint(&self) -> String {
        let host = self.endpoint_host.trim();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.endpoint_port)
        } else {
            format!("{host}:{}", self.endpoint_port)
        }
    }

    /**
     * @brief Resolve the server public key.
     * Reads the public key file; when it is absent, derives the key from the private key file.
     * @return Base64 public key.
     */
    pub fn server_public_key(&self) -> Result<String> {
        match fs::read_to_string(&self.server_public_key_path) {
            Ok(s) => {
                let key = s.trim().to_string();
                keys::validate_key_b64(&key).map_err(|e| {
                    Error::Config(format!(
                        "{}: {e}",
                        self.server_public_key_path.display()
                    ))
                })?;
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let private = fs::read_to_string(&self.server_private_key_path).map_err(|e| {
                    Error::Config(format!(
                        "no server key at {} or {}: {e}",
                        self.server_public_key_path.display(),
                        self.server_private_key_path.display()
                    ))
                })?;
                keys::public_from_private(private.trim())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/**
 * @brief Load the manager configuration, writing a default file when missing.
 * @param path Config file path, `wg-peer-manager.toml` when `None`.
 * @return Validated configuration.
 */
pub fn load_manager_config(path: Option<&Path>) -> Result<ManagerConfig> {
    let p = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
    if !p.exists() {
        let def = ManagerConfig::default();
        let s = toml::to_string_pretty(&def).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(&p, s)?;
        info!("Wrote default configuration to {}", p.display());
        return Ok(def);
    }
    let s = fs::read_to_string(&p)?;
    let cfg: ManagerConfig =
        toml::from_str(&s).map_err(|e| Error::Config(format!("{}: {e}", p.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyPairProvider, NativeKeys};

    #[test]
    fn creates_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("manager.toml");
        let cfg = load_manager_config(Some(&p)).unwrap();
        assert_eq!(cfg.interface_name, "wg0");
        assert!(p.exists());
        let again = load_manager_config(Some(&p)).unwrap();
        assert_eq!(again.subnet, cfg.subnet);
        assert_eq!(again.key_backend, KeyBackend::WgTool);
    }

    #[test]
    fn rejects_server_address_outside_subnet() {
        let cfg = ManagerConfig {
            server_address: Ipv4Addr::new(192, 168, 1, 1),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn endpoint_brackets_ipv6_hosts() {
        let mut cfg = ManagerConfig::default();
        cfg.endpoint_host = "vpn.example.com".into();
        assert_eq!(cfg.endpoint(), "vpn.example.com:51820");
        cfg.endpoint_host = "2001:db8::1".into();
        assert_eq!(cfg.endpoint(), "[2001:db8::1]:51820");
    }

    #[test]
    fn server_public_key_is_derived_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let pair = NativeKeys.generate_keypair().unwrap();
        let cfg = ManagerConfig {
            server_private_key_path: dir.path().join("server_private.key"),
            server_public_key_path: dir.path().join("server_public.key"),
            ..Default::default()
        };
        fs::write(&cfg.server_private_key_path, format!("{}\n", pair.private_key)).unwrap();
        assert_eq!(cfg.server_public_key().unwrap(), pair.public_key);
        fs::write(&cfg.server_public_key_path, "AAAA\n").unwrap();
        assert!(cfg.server_public_key().is_err());
    }
}
