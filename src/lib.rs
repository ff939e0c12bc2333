//! # wg-registrar - Peer registration for a WireGuard interface
//!
//! This library manages membership of a shared WireGuard network: it accepts
//! a client's public key, decides whether that key may be bound to the
//! requesting identity, allocates a unique host address, persists the peer
//! into the authoritative interface configuration and produces the
//! configuration document the client needs to connect.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `settings`: YAML settings, validation and key resolution
//! - `keys`: WireGuard key material (base64 32-byte keys)
//! - `store`: the authoritative interface configuration file
//! - `alloc`: host address allocation from the configured pool
//! - `userconf`: per-identity client configuration documents
//! - `engine`: the registration state machine (`TunnelManager`)
//! - `wgctl`: interface bring-up, tear-down and live reload
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use wg_registrar::engine::TunnelManager;
//! use wg_registrar::keys::PublicKey;
//! use wg_registrar::settings;
//! use wg_registrar::wgctl::SyncconfReloader;
//!
//! let config = settings::load_settings("wg-registrar.yaml".as_ref())?;
//! let keys = settings::resolve_key_material(&config)?;
//! let manager = TunnelManager::new(config, keys.public, Box::new(SyncconfReloader))?;
//!
//! let key: PublicKey = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".parse()?;
//! let outcome = manager.process_registration("some-identity", &key);
//! println!("{}", outcome.message());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Error Handling
//!
//! Component errors are typed `thiserror` enums; the binary layer uses
//! `color_eyre` for reporting with context. Registration requests never
//! error out of `process_registration`: every failure maps to a terminal
//! `Outcome` with a user-facing message, with detail in the log.

pub mod alloc;
pub mod engine;
pub mod keys;
pub mod settings;
pub mod store;
pub mod userconf;
pub mod wgctl;
