//! Client configuration documents.
//!
//! For every registered identity the service writes the tunnel
//! configuration the client needs to connect: its assigned address and a
//! single peer entry for this interface. The client's private key is never
//! known here, so the document carries a placeholder for it.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use log::info;
use thiserror::Error;

use crate::keys::PublicKey;
use crate::store::write_atomic;

/// Placeholder written where the client must insert its own private key.
const PRIVATE_KEY_PLACEHOLDER: &str = "<your private key>";

#[derive(Debug, Error)]
pub enum UserConfError {
    #[error("identity {0:?} cannot name a config file")]
    InvalidIdentity(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Render the document for a client assigned `address`.
pub fn render_client_config(
    address: IpAddr,
    server_key: &PublicKey,
    routed_ranges: &[IpNet],
    endpoint: &str,
) -> String {
    let ranges: Vec<String> = routed_ranges.iter().map(|net| net.to_string()).collect();
    format!(
        "[Interface]\n\
         PrivateKey = {PRIVATE_KEY_PLACEHOLDER}\n\
         Address = {address}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_key}\n\
         AllowedIPs = {allowed}\n\
         Endpoint = {endpoint}\n",
        allowed = ranges.join(", "),
    )
}

/// Location of the document for `identity` under `dir`.
pub fn client_config_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{identity}.conf"))
}

fn check_identity(identity: &str) -> Result<(), UserConfError> {
    let safe = !identity.is_empty()
        && identity != "."
        && identity != ".."
        && !identity.contains(['/', '\\']);
    if safe {
        Ok(())
    } else {
        Err(UserConfError::InvalidIdentity(identity.to_string()))
    }
}

/// Write `document` for `identity`, creating `dir` if needed. The write
/// goes through a temporary file so a failure never leaves a truncated
/// document behind.
pub fn write_client_config(
    dir: &Path,
    identity: &str,
    document: &str,
) -> Result<PathBuf, UserConfError> {
    check_identity(identity)?;
    fs::create_dir_all(dir)?;
    let path = client_config_path(dir, identity);
    write_atomic(&path, document)?;
    info!("wrote client config for {identity:?} to {}", path.display());
    Ok(path)
}

/// Read back the stored document for `identity`.
pub fn read_client_config(dir: &Path, identity: &str) -> Result<String, UserConfError> {
    check_identity(identity)?;
    Ok(fs::read_to_string(client_config_path(dir, identity))?)
}
