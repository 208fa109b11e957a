//! Binary entry point: loads configuration, wires the Linux collaborators
//! (`TunDevice`, `NetworkManager`, `NATManager`, `ConfigPersister`) and drives
//! [`agent::Agent::run`] until `SIGINT`/`SIGTERM` or a fatal error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use net::{ConfigPersister as _, NATManager as _};
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "meshtun", about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generates a new device identity and writes it to the config/secrets files.
    Init {
        #[arg(long)]
        device_name: String,
        /// This device's address inside the tunnel, e.g. `100.64.0.1/32`.
        #[arg(long)]
        tunnel_address: ipnet::IpNet,
        #[arg(long)]
        signaling_url: url::Url,
        #[arg(long = "stun-server")]
        stun_servers: Vec<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        secrets: Option<PathBuf>,
    },
    /// Prints the public key derived from the stored private key, to hand to peers
    /// out of band (or to a signaling relay's allowlist).
    Pubkey {
        #[arg(long)]
        secrets: Option<PathBuf>,
    },
    /// Connects to the signaling relay and runs the agent until interrupted.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        secrets: Option<PathBuf>,
        /// Bearer token for the signaling relay. Falls back to `MESHTUN_TOKEN`.
        #[arg(long, env = "MESHTUN_TOKEN", hide_env_values = true)]
        token: String,
        /// Interface the tunnel's subnet should be masqueraded behind, e.g. `eth0`. If
        /// omitted, no NAT rule is installed and only devices able to route the
        /// tunnel subnet directly can reach it.
        #[arg(long)]
        masquerade_via: Option<String>,
        #[arg(long, default_value = "info")]
        log: String,
        #[arg(long)]
        log_json: bool,
        #[arg(long, default_value_t = 1280)]
        mtu: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init {
            device_name,
            tunnel_address,
            signaling_url,
            stun_servers,
            config,
            secrets,
        } => run_blocking(init(device_name, tunnel_address, signaling_url, stun_servers, config, secrets)),
        Command::Pubkey { secrets } => run_blocking(pubkey(secrets)),
        Command::Run {
            config,
            secrets,
            token,
            masquerade_via,
            log,
            log_json,
            mtu,
        } => {
            logging::init(&log, log_json).context("Failed to initialize logging")?;
            run_blocking(run(config, secrets, token, masquerade_via, mtu))
        }
    }
}

/// `clap` parsing and logging setup are synchronous; everything past that needs a
/// runtime. A fresh multi-threaded runtime per subcommand keeps `main` itself free
/// of `#[tokio::main]`, matching the teacher's plain-`fn main` CLI entry points.
fn run_blocking(fut: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the Tokio runtime")?
        .block_on(fut)
}

fn default_config_path() -> Result<PathBuf> {
    Ok(known_dirs::config_dir()
        .context("Could not determine the platform config directory")?
        .join("config.toml"))
}

fn default_secrets_path() -> Result<PathBuf> {
    Ok(known_dirs::data_dir()
        .context("Could not determine the platform data directory")?
        .join("secrets.toml"))
}

async fn init(
    device_name: String,
    tunnel_address: ipnet::IpNet,
    signaling_url: url::Url,
    stun_servers: Vec<String>,
    config: Option<PathBuf>,
    secrets: Option<PathBuf>,
) -> Result<()> {
    let config_path = config.map(Ok).unwrap_or_else(default_config_path)?;
    let secrets_path = secrets.map(Ok).unwrap_or_else(default_secrets_path)?;

    let mut key_bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key_bytes);
    let private_key = boringtun::x25519::StaticSecret::from(key_bytes);
    let public_key = boringtun::x25519::PublicKey::from(&private_key);

    let cfg = net::AgentConfig {
        private_key: SecretString::from(encode_key(key_bytes)),
        device_name,
        tunnel_address,
        signaling_url: signaling_url.to_string(),
        stun_servers,
        peer_routes: std::collections::HashMap::new(),
    };

    let persister = net::FileConfigPersister::new();
    persister
        .save_secrets(&secrets_path, &cfg)
        .await
        .context("Failed to write secrets file")?;
    persister
        .save_config(&config_path, &cfg)
        .await
        .context("Failed to write config file")?;

    println!("Wrote config to {}", config_path.display());
    println!("Wrote secrets to {}", secrets_path.display());
    println!("Public key: {}", connlib_model::encode_public_key(&public_key));

    Ok(())
}

async fn pubkey(secrets: Option<PathBuf>) -> Result<()> {
    let secrets_path = secrets.map(Ok).unwrap_or_else(default_secrets_path)?;

    let contents = tokio::fs::read_to_string(&secrets_path)
        .await
        .with_context(|| format!("Failed to read {}", secrets_path.display()))?;

    #[derive(serde::Deserialize)]
    struct Secrets {
        private_key: SecretString,
    }
    let secrets: Secrets = toml::from_str(&contents).context("Failed to parse secrets file")?;

    let key_bytes = decode_key(&secrets.private_key)?;
    let private_key = boringtun::x25519::StaticSecret::from(key_bytes);
    let public_key = boringtun::x25519::PublicKey::from(&private_key);

    println!("{}", connlib_model::encode_public_key(&public_key));

    Ok(())
}

async fn run(
    config: Option<PathBuf>,
    secrets: Option<PathBuf>,
    token: String,
    masquerade_via: Option<String>,
    mtu: usize,
) -> Result<()> {
    anyhow::ensure!(
        cfg!(target_os = "linux"),
        "Only Linux is supported as a host platform right now; the agent core itself is portable \
         but no TunDevice/NetworkManager implementation ships for this OS yet."
    );

    let config_path = config.map(Ok).unwrap_or_else(default_config_path)?;
    let secrets_path = secrets.map(Ok).unwrap_or_else(default_secrets_path)?;

    let persisted = net::AgentConfig::load(&config_path, &secrets_path)
        .await
        .context("Failed to load agent configuration")?;
    let agent_config = agent::AgentConfig::from_persisted(&persisted, SecretString::from(token))
        .context("Failed to build runtime agent configuration")?;

    let tun_device = Arc::new(build_tun(mtu)?);
    let network_manager: Arc<dyn net::NetworkManager> =
        Arc::new(net::LinuxNetworkManager::new().context("Failed to open a netlink connection")?);
    let protector: Arc<dyn socket_factory::SocketProtector> = Arc::new(socket_factory::NoopProtector);

    let nat = masquerade_via
        .as_ref()
        .map(|_| net::IpTablesNat::new());
    if let (Some(nat), Some(out_iface)) = (&nat, &masquerade_via) {
        nat.setup_masquerade(persisted.tunnel_address, out_iface)
            .await
            .context("Failed to install NAT masquerade rule")?;
    }

    let agent = agent::Agent::new(agent_config, tun_device, network_manager, protector)
        .context("Failed to construct the agent")?;

    let routes_updates = agent.clone();
    let mut routes_subscriber = routes_updates.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = routes_subscriber.recv().await {
            match event {
                agent::AgentEvent::RoutesUpdated(routes) => {
                    tracing::info!(?routes, "Peer routes changed; host should redo any downstream routing");
                }
            }
        }
    });

    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received interrupt, shutting down");
        signal_cancel.cancel();
    });

    let result = agent.run(cancel).await;

    if let Some(nat) = nat {
        nat.cleanup().await.context("Failed to remove NAT masquerade rule")?;
    }

    match result {
        Ok(()) | Err(agent::AgentError::Cancelled) => Ok(()),
        Err(e) => Err(e).context("Agent exited with an error"),
    }
}

#[cfg(target_os = "linux")]
fn build_tun(mtu: usize) -> Result<tun::LinuxTun> {
    tun::LinuxTun::new(mtu).context("Failed to open /dev/net/tun")
}

#[cfg(not(target_os = "linux"))]
fn build_tun(_mtu: usize) -> Result<tun::LinuxTun> {
    anyhow::bail!("Not implemented")
}

fn encode_key(bytes: [u8; 32]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_key(secret: &SecretString) -> Result<[u8; 32]> {
    use base64::Engine as _;
    use secrecy::ExposeSecret as _;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(secret.expose_secret())
        .context("Private key is not valid base64")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Private key must decode to exactly 32 bytes"))
}
