use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::path::PathBuf;

use wg_registrar::engine::TunnelManager;
use wg_registrar::keys::PublicKey;
use wg_registrar::settings;
use wg_registrar::wgctl::{self, Reloader, SyncconfReloader};

/// Peer registration and address allocation for a WireGuard interface
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the service settings YAML file
    #[arg(short, long, default_value = "wg-registrar.yaml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the interface configuration file, or refresh its private key
    Init,
    /// Bring the interface up with wg-quick
    Up,
    /// Tear the interface down with wg-quick
    Down,
    /// Push the persisted configuration into the running interface
    Reload,
    /// Register a public key for an identity and print the client config
    Register {
        /// Stable identifier of the requester
        #[arg(long)]
        identity: String,

        /// The requester's WireGuard public key, base64
        #[arg(long)]
        key: String,
    },
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let settings = settings::load_settings(&args.settings)?;

    match args.command {
        Command::Init => {
            let keys = settings::resolve_key_material(&settings)?;
            if settings.wireguard_config_path.exists() {
                wgctl::update_private_key(&settings, &keys.private)?;
                info!(
                    "refreshed private key in {}",
                    settings.wireguard_config_path.display()
                );
            } else {
                wgctl::initialize_interface_config(&settings, &keys.private)?;
            }
        }
        Command::Up => wgctl::bring_up(&settings.wireguard_config_path)?,
        Command::Down => wgctl::tear_down(&settings.wireguard_config_path)?,
        Command::Reload => SyncconfReloader.apply_live_config(&settings.wireguard_config_path)?,
        Command::Register { identity, key } => {
            // The engine expects an already validated key; reject malformed
            // input here, before any state is touched.
            let key: PublicKey = key
                .parse()
                .wrap_err("the supplied key is not a valid WireGuard public key")?;

            let keys = settings::resolve_key_material(&settings)?;
            let manager = TunnelManager::new(settings, keys.public, Box::new(SyncconfReloader))
                .wrap_err("failed to load the interface config; run `wg-registrar init` first")?;

            let outcome = manager.process_registration(&identity, &key);
            println!("{}", outcome.message());
            if let Some(document) = outcome.client_config() {
                println!("\n{document}");
            }
            if !outcome.is_success() {
                return Err(eyre!("registration did not complete"));
            }
        }
    }

    Ok(())
}
