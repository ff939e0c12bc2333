//! Static service settings.
//!
//! Settings come from a YAML file and are validated once at startup. The
//! interface address doubles as the allocation pool: peers receive host
//! addresses from its network, minus the reserved prefixes.

use std::path::{Path, PathBuf};

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use ipnet::IpNet;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{PrivateKey, PublicKey};
use crate::store::InterfaceConfig;

/// Settings validation errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid interface settings: {0}")]
    InvalidInterface(String),
    #[error("invalid client settings: {0}")]
    InvalidClient(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// The authoritative interface configuration file.
    pub wireguard_config_path: PathBuf,
    /// Directory holding one client configuration document per identity.
    pub user_config_dir: PathBuf,
    pub interface: InterfaceSettings,
    /// Prefixes never handed out to peers.
    #[serde(default)]
    pub reserved_addresses: Vec<IpNet>,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Interface address with prefix, e.g. `10.11.0.1/24`. The network part
    /// is the allocation pool.
    pub address: IpNet,
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_up: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_down: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Where clients reach this interface, `<host>:<port>`.
    pub endpoint: String,
    /// Ranges clients route through the tunnel.
    pub allowed_ips: Vec<IpNet>,
}

impl Settings {
    /// The allocation pool: the interface address's network.
    pub fn pool(&self) -> IpNet {
        self.interface.address.trunc()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.interface.listen_port == 0 {
            return Err(SettingsError::InvalidInterface(
                "listen_port must be between 1 and 65535".to_string(),
            ));
        }
        if let Some(key) = &self.interface.private_key {
            PrivateKey::from_base64(key).map_err(|e| {
                SettingsError::InvalidInterface(format!("private_key is not usable: {e}"))
            })?;
        }
        validate_endpoint(&self.client.endpoint)?;
        if self.client.allowed_ips.is_empty() {
            return Err(SettingsError::InvalidClient(
                "allowed_ips must list at least one range".to_string(),
            ));
        }

        if self.interface_address_allocatable() {
            warn!(
                "interface address {} is allocatable to peers; add it to reserved_addresses",
                self.interface.address.addr()
            );
        }
        Ok(())
    }

    /// True when the interface's own address would be handed out by the
    /// allocator because no reserved prefix covers it.
    fn interface_address_allocatable(&self) -> bool {
        let addr = self.interface.address.addr();
        let pool = self.pool();
        let is_host = match pool {
            IpNet::V4(net) if net.prefix_len() >= 31 => true,
            IpNet::V6(_) => true,
            _ => addr != pool.network() && addr != pool.broadcast(),
        };
        is_host && !self.reserved_addresses.iter().any(|net| net.contains(&addr))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), SettingsError> {
    let malformed = || {
        SettingsError::InvalidClient(format!(
            "endpoint {endpoint:?} must have the form <host>:<port>"
        ))
    };
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(malformed)?;
    if host.is_empty() {
        return Err(malformed());
    }
    match port.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(()),
        _ => Err(SettingsError::InvalidClient(format!(
            "endpoint {endpoint:?} has an invalid port"
        ))),
    }
}

/// Load and validate settings from a YAML file
pub fn load_settings(path: &Path) -> Result<Settings> {
    info!("loading settings from {}", path.display());
    let file = std::fs::File::open(path)
        .wrap_err_with(|| format!("failed to open settings file {}", path.display()))?;
    let settings: Settings = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("failed to parse settings file {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

/// The interface's resolved key pair.
pub struct KeyMaterial {
    pub private: PrivateKey,
    pub public: PublicKey,
}

/// Resolve the interface key pair: the configured key wins, then the key of
/// an existing configuration file, and a fresh key is generated when
/// neither exists.
pub fn resolve_key_material(settings: &Settings) -> Result<KeyMaterial> {
    let private = if let Some(key) = &settings.interface.private_key {
        PrivateKey::from_base64(key).wrap_err("settings carry an invalid private_key")?
    } else if settings.wireguard_config_path.exists() {
        let config = InterfaceConfig::load(&settings.wireguard_config_path)
            .wrap_err("failed to load the existing interface config")?;
        let key = config.interface.private_key.ok_or_else(|| {
            color_eyre::eyre::eyre!(
                "existing config {} has no PrivateKey",
                settings.wireguard_config_path.display()
            )
        })?;
        PrivateKey::from_base64(&key)
            .wrap_err("existing interface config holds an invalid PrivateKey")?
    } else {
        info!("no private key configured, generating a fresh one");
        PrivateKey::generate()
    };
    let public = private.public_key();
    Ok(KeyMaterial { private, public })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn base_settings() -> Settings {
        Settings {
            wireguard_config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            user_config_dir: PathBuf::from("/var/lib/wg-registrar/users"),
            interface: InterfaceSettings {
                address: "10.11.0.1/24".parse().unwrap(),
                listen_port: 51820,
                private_key: None,
                post_up: None,
                post_down: None,
            },
            reserved_addresses: vec!["10.11.0.1/32".parse().unwrap()],
            client: ClientSettings {
                endpoint: "vpn.example.test:51820".to_string(),
                allowed_ips: vec!["10.11.0.0/24".parse().unwrap()],
            },
        }
    }

    #[test]
    fn load_parses_and_validates() {
        let yaml = r#"
wireguard_config_path: /etc/wireguard/wg0.conf
user_config_dir: /var/lib/wg-registrar/users
interface:
  address: 10.11.0.1/24
  listen_port: 51820
reserved_addresses:
  - 10.11.0.1/32
client:
  endpoint: vpn.example.test:51820
  allowed_ips:
    - 10.11.0.0/24
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        let settings = load_settings(temp_file.path()).unwrap();
        assert_eq!(settings.pool(), "10.11.0.0/24".parse().unwrap());
        assert_eq!(settings.interface.listen_port, 51820);
        assert!(settings.interface.private_key.is_none());
    }

    #[test]
    fn pool_is_the_network_of_the_interface_address() {
        let settings = base_settings();
        assert_eq!(settings.pool(), "10.11.0.0/24".parse().unwrap());
    }

    #[test]
    fn rejects_bad_endpoints() {
        for endpoint in ["no-port", ":51820", "host:0", "host:70000", "host:abc"] {
            let mut settings = base_settings();
            settings.client.endpoint = endpoint.to_string();
            assert!(
                matches!(settings.validate(), Err(SettingsError::InvalidClient(_))),
                "accepted endpoint {endpoint:?}"
            );
        }
    }

    #[test]
    fn accepts_ipv6_endpoints() {
        let mut settings = base_settings();
        settings.client.endpoint = "[2001:db8::1]:51820".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_empty_allowed_ips() {
        let mut settings = base_settings();
        settings.client.allowed_ips.clear();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidClient(_))
        ));
    }

    #[test]
    fn rejects_malformed_private_key() {
        let mut settings = base_settings();
        settings.interface.private_key = Some("too short".to_string());
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidInterface(_))
        ));
    }

    #[test]
    fn interface_address_coverage_check() {
        let mut settings = base_settings();
        assert!(!settings.interface_address_allocatable());
        settings.reserved_addresses.clear();
        assert!(settings.interface_address_allocatable());
    }

    #[test]
    fn key_material_prefers_settings_then_existing_config() {
        let dir = TempDir::new().unwrap();
        let mut settings = base_settings();
        settings.wireguard_config_path = dir.path().join("wg0.conf");

        // Nothing configured and no file: a key is generated.
        let generated = resolve_key_material(&settings).unwrap();

        // An existing config file provides the key.
        std::fs::write(
            &settings.wireguard_config_path,
            format!(
                "[Interface]\nAddress = 10.11.0.1/24\nPrivateKey = {}\n",
                generated.private.to_base64()
            ),
        )
        .unwrap();
        let from_file = resolve_key_material(&settings).unwrap();
        assert_eq!(from_file.public, generated.public);

        // A configured key wins over the file.
        let configured = PrivateKey::generate();
        settings.interface.private_key = Some(configured.to_base64());
        let resolved = resolve_key_material(&settings).unwrap();
        assert_eq!(resolved.public, configured.public_key());
    }
}
