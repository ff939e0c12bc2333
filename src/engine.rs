//! The registration engine.
//!
//! `TunnelManager` owns the in-memory interface configuration and turns
//! `(identity, key)` requests into terminal [`Outcome`]s. A request either
//! fully commits (config file, in-memory model and client document all
//! reflect the new peer) or fully rolls back; no intermediate state is
//! observable by a later request.
//!
//! Every request runs under one exclusive lock spanning lookup, allocation,
//! persistence and client document generation. Two overlapping requests
//! could otherwise pick the same free address before either one claims it.

use std::net::IpAddr;
use std::sync::Mutex;

use ipnet::IpNet;
use log::{error, info, warn};

use crate::alloc;
use crate::keys::PublicKey;
use crate::settings::Settings;
use crate::store::{InterfaceConfig, PeerOwner, PeerRecord, StoreError};
use crate::userconf;
use crate::wgctl::Reloader;

/// Terminal result of a registration request.
#[derive(Debug)]
pub enum Outcome {
    /// A new peer record was created and persisted.
    Registered {
        address: IpAddr,
        client_config: String,
    },
    /// The key is already active for this identity; nothing changed.
    AlreadyRegistered { client_config: String },
    /// The key belongs to another identity.
    KeyConflict,
    /// The key's record was written by another tool and is off limits.
    ForeignRecord,
    /// No free address remained in the pool.
    PoolExhausted,
    /// The authoritative config could not be written.
    PersistFailed,
    /// The client document could not be written; the registration was
    /// rolled back.
    ConfigGenFailed,
}

impl Outcome {
    /// The user-facing message for this outcome. Internal detail stays in
    /// the log.
    pub fn message(&self) -> &'static str {
        match self {
            Outcome::Registered { .. } => {
                "Registered. Your tunnel configuration is below; fill in your private key."
            }
            Outcome::AlreadyRegistered { .. } => "Your public key is already configured.",
            Outcome::KeyConflict => {
                "ERROR: Key pair may already be in use, regenerate a new key pair and try again."
            }
            Outcome::ForeignRecord => {
                "ERROR: Unable to verify key ownership, notify the server admin."
            }
            Outcome::PoolExhausted => "ERROR: No addresses are available, notify the server admin.",
            Outcome::PersistFailed | Outcome::ConfigGenFailed => {
                "ERROR: Unable to retrieve your configuration."
            }
        }
    }

    pub fn client_config(&self) -> Option<&str> {
        match self {
            Outcome::Registered { client_config, .. }
            | Outcome::AlreadyRegistered { client_config } => Some(client_config),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Registered { .. } | Outcome::AlreadyRegistered { .. }
        )
    }
}

/// Serialized access to the interface configuration plus the collaborators
/// needed to complete a registration.
pub struct TunnelManager {
    settings: Settings,
    server_key: PublicKey,
    reloader: Box<dyn Reloader>,
    config: Mutex<InterfaceConfig>,
}

impl TunnelManager {
    /// Load the authoritative configuration and build the manager.
    pub fn new(
        settings: Settings,
        server_key: PublicKey,
        reloader: Box<dyn Reloader>,
    ) -> Result<Self, StoreError> {
        let config = InterfaceConfig::load(&settings.wireguard_config_path)?;
        Ok(Self {
            settings,
            server_key,
            reloader,
            config: Mutex::new(config),
        })
    }

    /// Register `key` for `identity`. The key must already be validated as
    /// base64 decoding to 32 bytes.
    pub fn process_registration(&self, identity: &str, key: &PublicKey) -> Outcome {
        if !PeerOwner::is_valid_tag(identity) {
            error!("identity {identity:?} cannot be stored as an owner tag");
            return Outcome::ConfigGenFailed;
        }

        let mut config = self.config.lock().expect("registration state lock poisoned");
        info!("identity {identity:?} attempting to register key {key}");

        match config.find_peer(key) {
            Some(record) => match &record.owner {
                PeerOwner::Owned(owner) if owner == identity => {
                    self.deliver_existing(identity, record)
                }
                PeerOwner::Owned(owner) => {
                    warn!("identity {identity:?} provided key {key} already owned by {owner:?}");
                    Outcome::KeyConflict
                }
                PeerOwner::Foreign(_) => {
                    error!(
                        "key {key} belongs to a peer this service did not write; \
                         the config may have been modified by a different tool"
                    );
                    Outcome::ForeignRecord
                }
            },
            None => self.register_new(&mut config, identity, key),
        }
    }

    /// The key is already bound to this identity: hand back the stored
    /// client document, regenerating it if it went missing. The store is
    /// never mutated on this path.
    fn deliver_existing(&self, identity: &str, record: &PeerRecord) -> Outcome {
        let Some(address) = record.assigned_address() else {
            error!("peer {} has no assigned address on record", record.public_key);
            return Outcome::ForeignRecord;
        };
        if let Ok(document) = userconf::read_client_config(&self.settings.user_config_dir, identity)
        {
            return Outcome::AlreadyRegistered {
                client_config: document,
            };
        }

        warn!("client config for {identity:?} is missing, regenerating it");
        let document = self.render_client_config(address);
        match userconf::write_client_config(&self.settings.user_config_dir, identity, &document) {
            Ok(_) => Outcome::AlreadyRegistered {
                client_config: document,
            },
            Err(e) => {
                error!("failed to regenerate client config for {identity:?}: {e}");
                Outcome::ConfigGenFailed
            }
        }
    }

    fn register_new(
        &self,
        config: &mut InterfaceConfig,
        identity: &str,
        key: &PublicKey,
    ) -> Outcome {
        let checkpoint = config.clone();

        // An identity holds one key at a time: re-registration replaces the
        // previous binding. The removal stays staged in memory until the
        // new record persists.
        if let Some(previous) = config
            .find_peer_by_owner(identity)
            .map(|peer| peer.public_key.clone())
        {
            info!("identity {identity:?} re-registers, replacing key {previous}");
            config.remove_peer(&previous);
        }

        let claimed: Vec<IpNet> = config
            .peers()
            .iter()
            .flat_map(|peer| peer.allowed_ips.iter().copied())
            .collect();
        let address = match alloc::pick_available(
            self.settings.pool(),
            &self.settings.reserved_addresses,
            &claimed,
        ) {
            Ok(address) => address,
            Err(e) => {
                error!("{e}");
                *config = checkpoint;
                return Outcome::PoolExhausted;
            }
        };

        config.upsert_peer(PeerRecord {
            public_key: key.clone(),
            owner: PeerOwner::Owned(identity.to_string()),
            allowed_ips: vec![IpNet::from(address)],
            endpoint: None,
            extras: Vec::new(),
        });
        if let Err(e) = config.persist() {
            error!("failed to persist interface config: {e}");
            *config = checkpoint;
            return Outcome::PersistFailed;
        }

        let document = self.render_client_config(address);
        if let Err(e) =
            userconf::write_client_config(&self.settings.user_config_dir, identity, &document)
        {
            // A persisted peer without a deliverable client document would
            // claim the key forever, so the record must go away again.
            error!("failed to write client config for {identity:?}: {e}");
            *config = checkpoint;
            if let Err(e) = config.persist() {
                error!("failed to restore interface config after rollback: {e}");
            }
            return Outcome::ConfigGenFailed;
        }

        if let Err(e) = self
            .reloader
            .apply_live_config(&self.settings.wireguard_config_path)
        {
            warn!("live reload failed, the peer applies on next restart: {e}");
        }

        info!("identity {identity:?} registered key {key} at {address}");
        Outcome::Registered {
            address,
            client_config: document,
        }
    }

    fn render_client_config(&self, address: IpAddr) -> String {
        userconf::render_client_config(
            address,
            &self.server_key,
            &self.settings.client.allowed_ips,
            &self.settings.client.endpoint,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use crate::settings::{ClientSettings, InterfaceSettings};
    use crate::wgctl::WgCtlError;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::path::Path;
    use tempfile::TempDir;

    struct NoopReloader;

    impl Reloader for NoopReloader {
        fn apply_live_config(&self, _config_path: &Path) -> Result<(), WgCtlError> {
            Ok(())
        }
    }

    fn key(tag: u8) -> PublicKey {
        PublicKey::from_base64(&BASE64.encode([tag; 32])).unwrap()
    }

    fn settings(dir: &Path) -> Settings {
        Settings {
            wireguard_config_path: dir.join("wg0.conf"),
            user_config_dir: dir.join("users"),
            interface: InterfaceSettings {
                address: "10.0.0.0/29".parse().unwrap(),
                listen_port: 51820,
                private_key: None,
                post_up: None,
                post_down: None,
            },
            reserved_addresses: Vec::new(),
            client: ClientSettings {
                endpoint: "vpn.example.test:51820".to_string(),
                allowed_ips: vec!["10.0.0.0/29".parse().unwrap()],
            },
        }
    }

    fn manager(dir: &Path) -> TunnelManager {
        let settings = settings(dir);
        crate::wgctl::initialize_interface_config(&settings, &PrivateKey::generate()).unwrap();
        let server_key = PrivateKey::generate().public_key();
        TunnelManager::new(settings, server_key, Box::new(NoopReloader)).unwrap()
    }

    #[test]
    fn already_registered_regenerates_a_missing_document() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());

        let first = manager.process_registration("u1", &key(1));
        assert!(matches!(first, Outcome::Registered { .. }));

        let document_path = dir.path().join("users").join("u1.conf");
        std::fs::remove_file(&document_path).unwrap();

        let second = manager.process_registration("u1", &key(1));
        match second {
            Outcome::AlreadyRegistered { client_config } => {
                assert!(client_config.contains("Address = 10.0.0.1"));
            }
            other => panic!("expected AlreadyRegistered, got {:?}", other),
        }
        assert!(document_path.exists());
    }

    #[test]
    fn foreign_records_are_never_touched() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        drop(manager);

        let config_path = dir.path().join("wg0.conf");
        let mut text = std::fs::read_to_string(&config_path).unwrap();
        text.push_str(&format!(
            "\n# added out of band\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.5/32\n",
            key(9)
        ));
        std::fs::write(&config_path, &text).unwrap();

        let settings = settings(dir.path());
        let manager = TunnelManager::new(
            settings,
            PrivateKey::generate().public_key(),
            Box::new(NoopReloader),
        )
        .unwrap();

        let outcome = manager.process_registration("intruder", &key(9));
        assert!(matches!(outcome, Outcome::ForeignRecord));
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), text);
    }

    #[test]
    fn rejects_identities_that_cannot_be_stored() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());

        let before = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        for identity in ["", "two words", "tab\there"] {
            assert!(matches!(
                manager.process_registration(identity, &key(1)),
                Outcome::ConfigGenFailed
            ));
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap(),
            before
        );
    }

    #[test]
    fn outcome_messages_and_accessors() {
        let registered = Outcome::Registered {
            address: "10.0.0.1".parse().unwrap(),
            client_config: "doc".to_string(),
        };
        assert!(registered.is_success());
        assert_eq!(registered.client_config(), Some("doc"));

        assert!(!Outcome::KeyConflict.is_success());
        assert!(Outcome::KeyConflict.client_config().is_none());
        assert!(Outcome::PoolExhausted.message().contains("No addresses"));
    }
}
