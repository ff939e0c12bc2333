//! Interface control boundary.
//!
//! Everything that touches the running WireGuard interface lives here:
//! bring-up and tear-down through `wg-quick`, and live reload through
//! `wg syncconf` fed with a stripped copy of the configuration so existing
//! sessions survive. External programs are always invoked with argument
//! vectors, never through a shell.
//!
//! This module also bootstraps the interface configuration file from
//! settings and refreshes its private key, the two maintenance operations
//! performed at service start.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;
use thiserror::Error;

use crate::keys::PrivateKey;
use crate::settings::Settings;
use crate::store::{InterfaceConfig, InterfaceSection, StoreError};

#[derive(Debug, Error)]
pub enum WgCtlError {
    #[error("failed to run {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} failed with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("cannot derive an interface name from {0:?}")]
    BadConfigPath(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Applies the persisted configuration to the live interface.
pub trait Reloader: Send + Sync {
    fn apply_live_config(&self, config_path: &Path) -> Result<(), WgCtlError>;
}

/// Reloads via `wg syncconf`, which updates peers without restarting the
/// interface or dropping existing sessions.
pub struct SyncconfReloader;

impl Reloader for SyncconfReloader {
    fn apply_live_config(&self, config_path: &Path) -> Result<(), WgCtlError> {
        let interface = interface_name(config_path)?;

        // wg syncconf rejects wg-quick extensions such as Address and
        // PostUp, so feed it the stripped form of the config.
        let stripped = run_checked("wg-quick", &[Path::new("strip"), config_path])?;
        let staged = env::temp_dir().join(format!("{}_strip_{}.conf", interface, std::process::id()));
        fs::write(&staged, &stripped)?;

        let result = run_checked(
            "wg",
            &[Path::new("syncconf"), Path::new(&interface), staged.as_path()],
        );
        let _ = fs::remove_file(&staged);
        result?;

        info!("synced live configuration of {interface}");
        Ok(())
    }
}

/// Bring the interface up with `wg-quick up`.
pub fn bring_up(config_path: &Path) -> Result<(), WgCtlError> {
    run_checked("wg-quick", &[Path::new("up"), config_path])?;
    info!("interface for {} is up", config_path.display());
    Ok(())
}

/// Tear the interface down with `wg-quick down`.
pub fn tear_down(config_path: &Path) -> Result<(), WgCtlError> {
    run_checked("wg-quick", &[Path::new("down"), config_path])?;
    info!("interface for {} is down", config_path.display());
    Ok(())
}

/// The interface name is the configuration file's stem, `wg0` for
/// `/etc/wireguard/wg0.conf`.
pub fn interface_name(config_path: &Path) -> Result<String, WgCtlError> {
    config_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WgCtlError::BadConfigPath(config_path.to_path_buf()))
}

fn run_checked(program: &str, args: &[&Path]) -> Result<Vec<u8>, WgCtlError> {
    let command = format!(
        "{program} {}",
        args.iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| WgCtlError::Launch {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(WgCtlError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Create the interface configuration file from settings. Fails if loading
/// or writing the file is not possible; parent directories are created.
pub fn initialize_interface_config(
    settings: &Settings,
    private_key: &PrivateKey,
) -> Result<(), StoreError> {
    let mut extras = Vec::new();
    if let Some(post_up) = &settings.interface.post_up {
        extras.push(("PostUp".to_string(), post_up.clone()));
    }
    if let Some(post_down) = &settings.interface.post_down {
        extras.push(("PostDown".to_string(), post_down.clone()));
    }

    let section = InterfaceSection {
        address: Some(settings.interface.address.to_string()),
        listen_port: Some(settings.interface.listen_port),
        private_key: Some(private_key.to_base64()),
        extras,
    };

    if let Some(parent) = settings.wireguard_config_path.parent() {
        fs::create_dir_all(parent).map_err(StoreError::Io)?;
    }
    let config = InterfaceConfig::create(settings.wireguard_config_path.clone(), section);
    config.persist()?;
    info!(
        "initialized interface config at {}",
        settings.wireguard_config_path.display()
    );
    Ok(())
}

/// Replace the private key of an existing configuration file, leaving the
/// rest of the file untouched.
pub fn update_private_key(settings: &Settings, private_key: &PrivateKey) -> Result<(), StoreError> {
    let mut config = InterfaceConfig::load(&settings.wireguard_config_path)?;
    config.interface.private_key = Some(private_key.to_base64());
    config.persist()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ClientSettings, InterfaceSettings, Settings};
    use crate::store::PeerOwner;
    use crate::{keys::PublicKey, store::PeerRecord};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use tempfile::TempDir;

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            wireguard_config_path: dir.join("wireguard").join("wg0.conf"),
            user_config_dir: dir.join("users"),
            interface: InterfaceSettings {
                address: "10.11.0.1/24".parse().unwrap(),
                listen_port: 51820,
                private_key: None,
                post_up: Some("sysctl -w net.ipv4.ip_forward=1".to_string()),
                post_down: None,
            },
            reserved_addresses: Vec::new(),
            client: ClientSettings {
                endpoint: "vpn.example.test:51820".to_string(),
                allowed_ips: vec!["10.11.0.0/24".parse().unwrap()],
            },
        }
    }

    #[test]
    fn interface_name_is_the_file_stem() {
        assert_eq!(
            interface_name(Path::new("/etc/wireguard/wg0.conf")).unwrap(),
            "wg0"
        );
        assert!(interface_name(Path::new("/")).is_err());
    }

    #[test]
    fn initialize_writes_interface_section() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        let private = PrivateKey::generate();

        initialize_interface_config(&settings, &private).unwrap();

        let config = InterfaceConfig::load(&settings.wireguard_config_path).unwrap();
        assert_eq!(config.interface.address.as_deref(), Some("10.11.0.1/24"));
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.private_key, Some(private.to_base64()));
        assert_eq!(
            config.interface.extras,
            vec![(
                "PostUp".to_string(),
                "sysctl -w net.ipv4.ip_forward=1".to_string()
            )]
        );
        assert!(config.peers().is_empty());
    }

    #[test]
    fn update_private_key_preserves_peers() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        initialize_interface_config(&settings, &PrivateKey::generate()).unwrap();

        let mut config = InterfaceConfig::load(&settings.wireguard_config_path).unwrap();
        let peer_key = PublicKey::from_base64(&BASE64.encode([4u8; 32])).unwrap();
        config.upsert_peer(PeerRecord {
            public_key: peer_key.clone(),
            owner: PeerOwner::Owned("someone".to_string()),
            allowed_ips: vec!["10.11.0.2/32".parse().unwrap()],
            endpoint: None,
            extras: Vec::new(),
        });
        config.persist().unwrap();

        let replacement = PrivateKey::generate();
        update_private_key(&settings, &replacement).unwrap();

        let reloaded = InterfaceConfig::load(&settings.wireguard_config_path).unwrap();
        assert_eq!(reloaded.interface.private_key, Some(replacement.to_base64()));
        assert!(reloaded.find_peer(&peer_key).is_some());
    }
}
