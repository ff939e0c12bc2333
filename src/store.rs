//! Authoritative interface configuration.
//!
//! This module owns the line-oriented WireGuard configuration file: one
//! `[Interface]` section followed by any number of `[Peer]` sections. Peers
//! registered by this service carry a single leading comment of the form
//! `#<identity>` naming the owning identity; a peer whose leading comments
//! do not match that shape was written by someone else and is never touched.
//!
//! The in-memory model is the source of truth once loaded. `persist()`
//! rewrites the whole file through a temporary file in the same directory
//! plus a rename, so an external reader never observes a half-written
//! config.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use log::debug;
use thiserror::Error;

use crate::keys::PublicKey;

/// Errors from loading or persisting the configuration file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration file is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Ownership of a peer section, parsed from its leading comment lines.
///
/// `Owned` requires exactly one leading comment holding a single
/// whitespace-free identity token. Anything else (no comment, several
/// comments, embedded whitespace) is `Foreign`: the section was written by
/// another tool and its raw comment lines are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOwner {
    Owned(String),
    Foreign(Vec<String>),
}

impl PeerOwner {
    /// True when `identity` can be stored as an ownership comment and read
    /// back unchanged.
    pub fn is_valid_tag(identity: &str) -> bool {
        !identity.is_empty() && !identity.contains(char::is_whitespace)
    }

    fn from_comments(comments: Vec<String>) -> Self {
        if comments.len() == 1 {
            // Strip exactly one marker so a tag like "#x" stored as "##x"
            // reads back unchanged.
            let tag = comments[0].strip_prefix('#').unwrap_or(&comments[0]);
            if Self::is_valid_tag(tag) {
                return PeerOwner::Owned(tag.to_string());
            }
        }
        PeerOwner::Foreign(comments)
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            PeerOwner::Owned(identity) => Some(identity),
            PeerOwner::Foreign(_) => None,
        }
    }
}

/// One peer section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub public_key: PublicKey,
    pub owner: PeerOwner,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<String>,
    /// Keys this service does not interpret, preserved in file order.
    pub extras: Vec<(String, String)>,
}

impl PeerRecord {
    /// The single host address assigned to a managed peer.
    pub fn assigned_address(&self) -> Option<IpAddr> {
        self.allowed_ips.first().map(|net| net.addr())
    }
}

/// The `[Interface]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSection {
    pub address: Option<String>,
    pub listen_port: Option<u16>,
    pub private_key: Option<String>,
    /// Keys this service does not interpret, preserved in file order.
    pub extras: Vec<(String, String)>,
}

/// The parsed configuration file: interface section plus ordered peers.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    path: PathBuf,
    pub interface: InterfaceSection,
    peers: Vec<PeerRecord>,
    leading_comments: Vec<String>,
    trailing_comments: Vec<String>,
}

impl InterfaceConfig {
    /// Build a fresh configuration that has not been written yet.
    pub fn create(path: PathBuf, interface: InterfaceSection) -> Self {
        Self {
            path,
            interface,
            peers: Vec::new(),
            leading_comments: Vec::new(),
            trailing_comments: Vec::new(),
        }
    }

    /// Load and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::parse(&text)?;
        config.path = path.to_path_buf();
        debug!(
            "loaded {} with {} peer(s)",
            path.display(),
            config.peers.len()
        );
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn find_peer(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.iter().find(|peer| &peer.public_key == key)
    }

    /// Find the peer registered by `identity`. Foreign peers never match.
    pub fn find_peer_by_owner(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers
            .iter()
            .find(|peer| peer.owner.identity() == Some(identity))
    }

    /// Insert `record`, replacing an existing peer with the same key in
    /// place. Callers enforcing key ownership must check `find_peer` first.
    pub fn upsert_peer(&mut self, record: PeerRecord) {
        match self
            .peers
            .iter_mut()
            .find(|peer| peer.public_key == record.public_key)
        {
            Some(existing) => *existing = record,
            None => self.peers.push(record),
        }
    }

    /// Remove the peer with `key`, returning it. No-op if absent.
    pub fn remove_peer(&mut self, key: &PublicKey) -> Option<PeerRecord> {
        let index = self.peers.iter().position(|peer| &peer.public_key == key)?;
        Some(self.peers.remove(index))
    }

    /// Rewrite the backing file from the in-memory model.
    pub fn persist(&self) -> Result<(), StoreError> {
        write_atomic(&self.path, &self.render())?;
        debug!(
            "persisted {} with {} peer(s)",
            self.path.display(),
            self.peers.len()
        );
        Ok(())
    }

    fn parse(text: &str) -> Result<Self, StoreError> {
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut config = Self::create(PathBuf::new(), InterfaceSection::default());
        let mut current = Section::None;
        let mut pending_comments: Vec<String> = Vec::new();
        let mut peer: Option<PendingPeer> = None;
        let mut saw_interface = false;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                pending_comments.push(line.to_string());
                continue;
            }
            if line.eq_ignore_ascii_case("[interface]") {
                if saw_interface {
                    return Err(StoreError::Corrupt(
                        "more than one [Interface] section".to_string(),
                    ));
                }
                saw_interface = true;
                flush_peer(&mut peer, &mut config.peers)?;
                config.leading_comments = std::mem::take(&mut pending_comments);
                current = Section::Interface;
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                flush_peer(&mut peer, &mut config.peers)?;
                peer = Some(PendingPeer::new(std::mem::take(&mut pending_comments)));
                current = Section::Peer;
                continue;
            }
            if line.starts_with('[') {
                return Err(StoreError::Corrupt(format!("unknown section {line:?}")));
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| StoreError::Corrupt(format!("malformed line {line:?}")))?;

            match current {
                Section::None => {
                    return Err(StoreError::Corrupt(format!(
                        "entry {key:?} appears outside of a section"
                    )));
                }
                Section::Interface => match key {
                    "Address" => config.interface.address = Some(value.to_string()),
                    "ListenPort" => {
                        let port = value.parse::<u16>().map_err(|_| {
                            StoreError::Corrupt(format!("invalid ListenPort {value:?}"))
                        })?;
                        config.interface.listen_port = Some(port);
                    }
                    "PrivateKey" => config.interface.private_key = Some(value.to_string()),
                    _ => config
                        .interface
                        .extras
                        .push((key.to_string(), value.to_string())),
                },
                Section::Peer => {
                    let peer = peer.as_mut().expect("peer section without pending peer");
                    match key {
                        "PublicKey" => {
                            let parsed = PublicKey::from_base64(value).map_err(|e| {
                                StoreError::Corrupt(format!("invalid PublicKey {value:?}: {e}"))
                            })?;
                            peer.public_key = Some(parsed);
                        }
                        "AllowedIPs" => peer.allowed_ips = parse_allowed_ips(value)?,
                        "Endpoint" => peer.endpoint = Some(value.to_string()),
                        _ => peer.extras.push((key.to_string(), value.to_string())),
                    }
                }
            }
        }

        flush_peer(&mut peer, &mut config.peers)?;
        config.trailing_comments = pending_comments;

        if !saw_interface {
            return Err(StoreError::Corrupt("missing [Interface] section".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &config.peers {
            if !seen.insert(peer.public_key.clone()) {
                return Err(StoreError::Corrupt(format!(
                    "duplicate peer key {}",
                    peer.public_key
                )));
            }
        }
        Ok(config)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for comment in &self.leading_comments {
            out.push_str(comment);
            out.push('\n');
        }
        out.push_str("[Interface]\n");
        if let Some(address) = &self.interface.address {
            out.push_str(&format!("Address = {address}\n"));
        }
        if let Some(port) = self.interface.listen_port {
            out.push_str(&format!("ListenPort = {port}\n"));
        }
        if let Some(key) = &self.interface.private_key {
            out.push_str(&format!("PrivateKey = {key}\n"));
        }
        for (key, value) in &self.interface.extras {
            out.push_str(&format!("{key} = {value}\n"));
        }

        for peer in &self.peers {
            out.push('\n');
            match &peer.owner {
                PeerOwner::Owned(identity) => {
                    out.push_str(&format!("#{identity}\n"));
                }
                PeerOwner::Foreign(comments) => {
                    for comment in comments {
                        out.push_str(comment);
                        out.push('\n');
                    }
                }
            }
            out.push_str("[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if !peer.allowed_ips.is_empty() {
                let nets: Vec<String> =
                    peer.allowed_ips.iter().map(|net| net.to_string()).collect();
                out.push_str(&format!("AllowedIPs = {}\n", nets.join(", ")));
            }
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            for (key, value) in &peer.extras {
                out.push_str(&format!("{key} = {value}\n"));
            }
        }

        if !self.trailing_comments.is_empty() {
            out.push('\n');
            for comment in &self.trailing_comments {
                out.push_str(comment);
                out.push('\n');
            }
        }
        out
    }
}

struct PendingPeer {
    comments: Vec<String>,
    public_key: Option<PublicKey>,
    allowed_ips: Vec<IpNet>,
    endpoint: Option<String>,
    extras: Vec<(String, String)>,
}

impl PendingPeer {
    fn new(comments: Vec<String>) -> Self {
        Self {
            comments,
            public_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            extras: Vec::new(),
        }
    }
}

fn flush_peer(pending: &mut Option<PendingPeer>, peers: &mut Vec<PeerRecord>) -> Result<(), StoreError> {
    let Some(pending) = pending.take() else {
        return Ok(());
    };
    let public_key = pending
        .public_key
        .ok_or_else(|| StoreError::Corrupt("peer section missing PublicKey".to_string()))?;
    peers.push(PeerRecord {
        public_key,
        owner: PeerOwner::from_comments(pending.comments),
        allowed_ips: pending.allowed_ips,
        endpoint: pending.endpoint,
        extras: pending.extras,
    });
    Ok(())
}

fn parse_allowed_ips(value: &str) -> Result<Vec<IpNet>, StoreError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                Ok(net)
            } else if let Ok(addr) = entry.parse::<IpAddr>() {
                Ok(IpNet::from(addr))
            } else {
                Err(StoreError::Corrupt(format!(
                    "invalid AllowedIPs entry {entry:?}"
                )))
            }
        })
        .collect()
}

/// Write `contents` to `path` through a sibling temporary file and a rename,
/// so readers of `path` see either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
