//! vpnctl - VPN connection core CLI tool
//!
//! Offline tools over the connection core: inspect binary status payloads,
//! compute must-have sets, resolve peers, render WireGuard configs and
//! dry-run connections against a simulated tunnel platform.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use libvpnctl::servers::{must_have_ids, status};
use libvpnctl::vpn::common::write_secure_config;
use libvpnctl::vpn::{TunnelTarget, WireGuardBackend};
use libvpnctl::*;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "VPN connection core tool - status feed, must-haves, peers, dry-run connections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a binary status payload
    DecodeStatus { file: PathBuf },

    /// Apply a binary status payload to a server list
    ApplyStatus {
        /// Server list (JSON array)
        #[arg(long)]
        servers: PathBuf,
        /// Binary status payload
        #[arg(long)]
        status: PathBuf,
    },

    /// Compute the must-have server ids for a truncated server list
    MustHaves {
        /// Server currently in use
        #[arg(long)]
        current: Option<String>,
        /// Recent server ids, most recent first
        #[arg(long, value_delimiter = ',')]
        recents: Vec<String>,
        /// Server ids pinned by profiles
        #[arg(long, value_delimiter = ',')]
        profiles: Vec<String>,
        #[arg(long)]
        max_recents: Option<usize>,
        #[arg(long)]
        max_must_haves: Option<usize>,
    },

    /// Resolve ProTun peers for a server
    ResolvePeers {
        #[arg(long)]
        servers: PathBuf,
        #[arg(long)]
        server_id: String,
        /// Acceptable transports
        #[arg(long, value_delimiter = ',', default_value = "udp,tcp,tls")]
        protocols: Vec<TransportProtocol>,
    },

    /// Rank candidate servers for an intent
    Select {
        #[arg(long)]
        servers: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Render a wg-quick configuration for a server
    WgConfig {
        #[arg(long)]
        servers: PathBuf,
        #[arg(long)]
        server_id: String,
        #[arg(long, default_value = "udp")]
        transport: TransportProtocol,
        /// Write to a file (mode 0600) instead of stdout
        #[arg(long)]
        output_file: Option<PathBuf>,
    },

    /// Dry-run a connection against a simulated tunnel platform
    Connect {
        #[arg(long)]
        servers: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// VPN protocol (wireguard, protun); configuration default when omitted
        #[arg(long, value_parser = parse_protocol)]
        protocol: Option<VpnProtocol>,
        #[arg(long)]
        transport: Option<TransportProtocol>,
        /// Number of tunnel establishments that fail before one succeeds
        #[arg(long, default_value = "0")]
        fail_first: u32,
    },

    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Fastest server in a country (ISO code)
    #[arg(long, conflicts_with_all = ["server_id", "gateway"])]
    country: Option<String>,
    /// A specific server
    #[arg(long, conflicts_with = "gateway")]
    server_id: Option<String>,
    /// Servers of a dedicated gateway
    #[arg(long)]
    gateway: Option<String>,
}

impl TargetArgs {
    fn intent(&self) -> ConnectIntent {
        if let Some(country) = &self.country {
            ConnectIntent::fastest_in_country(country.clone())
        } else if let Some(gateway) = &self.gateway {
            ConnectIntent::Gateway {
                gateway_name: gateway.clone(),
                server_id: self.server_id.clone().map(ServerId::from),
            }
        } else if let Some(server_id) = &self.server_id {
            ConnectIntent::server(server_id.clone())
        } else {
            ConnectIntent::Fastest
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the default configuration
    Default,
    /// Validate a configuration file
    Check { file: PathBuf },
}

fn parse_protocol(value: &str) -> Result<VpnProtocol, String> {
    match value.to_ascii_lowercase().as_str() {
        "wireguard" | "wg" => Ok(VpnProtocol::WireGuard),
        "protun" => Ok(VpnProtocol::ProTun),
        other => Err(format!("unknown VPN protocol '{}'", other)),
    }
}

/// Tunnel platform that only pretends; `fail_first` establishments fail
struct DryRunPlatform {
    fail_first: AtomicU32,
}

#[async_trait]
impl TunnelPlatform for DryRunPlatform {
    async fn establish(&self, request: TunnelRequest) -> Result<TunnelHandle, ConnectionError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::Unreachable("simulated failure".to_string()));
        }

        let interface = match &request {
            TunnelRequest::WireGuard { endpoint, transport, .. } => {
                info!("Would bring up WireGuard to {} over {}", endpoint, transport);
                "wg0"
            }
            TunnelRequest::ProTun { peers } => {
                info!("Would bring up ProTun with {} peer(s)", peers.len());
                "tun0"
            }
        };
        Ok(TunnelHandle::new(interface))
    }

    async fn teardown(&self, handle: TunnelHandle) -> Result<(), ConnectionError> {
        info!("Would tear down {}", handle.interface_name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match &cli.config {
        Some(path) => VpnCoreConfig::load(path).with_context(|| format!("loading {:?}", path))?,
        None => VpnCoreConfig::default(),
    };

    match &cli.command {
        Commands::DecodeStatus { file } => decode_status(&cli, file),
        Commands::ApplyStatus { servers, status } => apply_status(&cli, servers, status),
        Commands::MustHaves { current, recents, profiles, max_recents, max_must_haves } => {
            let limits = config.truncation.limits();
            let current = current.clone().map(ServerId::from);
            let recents: Vec<ServerId> = recents.iter().cloned().map(ServerId::from).collect();
            let profiles: Vec<ServerId> = profiles.iter().cloned().map(ServerId::from).collect();
            let ids = must_have_ids(
                current.as_ref(),
                &recents,
                &profiles,
                max_recents.unwrap_or(limits.max_recents),
                max_must_haves.unwrap_or(limits.max_must_haves),
            );
            let sorted: BTreeSet<ServerId> = ids.into_iter().collect();
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&sorted)?),
                OutputFormat::Text => {
                    for id in &sorted {
                        println!("{}", id);
                    }
                }
            }
            Ok(())
        }
        Commands::ResolvePeers { servers, server_id, protocols } => {
            let server = find_server(servers, server_id)?;
            let protocols: BTreeSet<TransportProtocol> = protocols.iter().copied().collect();
            let resolver = PeerResolver::new(config.ports.clone());
            let Some(peers) = resolver.resolve(&server, &protocols) else {
                bail!("no viable peer for server {}", server_id);
            };
            match cli.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&peers)?),
                OutputFormat::Text => {
                    for peer in &peers {
                        let ports: Vec<String> = peer
                            .ports
                            .iter()
                            .map(|(protocol, ports)| format!("{}={:?}", protocol, ports))
                            .collect();
                        println!("#{} {} {}", peer.ordinal, peer.address, ports.join(" "));
                    }
                }
            }
            Ok(())
        }
        Commands::Select { servers, target } => {
            let directory = load_directory(servers)?;
            let candidates = directory
                .select(&target.intent(), &config.connection.selection_context())
                .context("no candidates")?;
            match cli.output {
                OutputFormat::Json => {
                    let ids: Vec<&ServerId> = candidates.iter().map(|s| &s.server_id).collect();
                    println!("{}", serde_json::to_string_pretty(&ids)?);
                }
                OutputFormat::Text => {
                    for server in &candidates {
                        println!("{} {} load={:.1}", server.server_id, server.server_name, server.load);
                    }
                }
            }
            Ok(())
        }
        Commands::WgConfig { servers, server_id, transport, output_file } => {
            wg_config(&config, servers, server_id, *transport, output_file.as_deref()).await
        }
        Commands::Connect { servers, target, protocol, transport, fail_first } => {
            let mut settings = config.connection.clone();
            if let Some(protocol) = protocol {
                settings.protocol = *protocol;
            }
            if transport.is_some() {
                settings.transport = *transport;
            }
            dry_run_connect(&cli, &config, settings, servers, target.intent(), *fail_first).await
        }
        Commands::Config(ConfigCommands::Default) => {
            print!("{}", VpnCoreConfig::default().to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Check { file }) => {
            VpnCoreConfig::load(file).with_context(|| format!("checking {:?}", file))?;
            println!("Configuration OK");
            Ok(())
        }
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpnctl={},libvpnctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn load_servers(path: &Path) -> Result<Vec<Server>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let servers: Vec<Server> =
        serde_json::from_str(&content).with_context(|| format!("parsing server list {:?}", path))?;
    for server in &servers {
        server
            .validate()
            .with_context(|| format!("invalid server {}", server.server_id))?;
    }
    debug!("Loaded {} servers from {:?}", servers.len(), path);
    Ok(servers)
}

fn load_directory(path: &Path) -> Result<Arc<ServerDirectory>> {
    let directory = Arc::new(ServerDirectory::new());
    let servers = load_servers(path)?.into_iter().map(Arc::new).collect();
    directory.replace(servers, None, &HashSet::new());
    Ok(directory)
}

fn find_server(path: &Path, server_id: &str) -> Result<Server> {
    load_servers(path)?
        .into_iter()
        .find(|server| server.server_id.as_str() == server_id)
        .with_context(|| format!("server {} not found", server_id))
}

fn decode_status(cli: &Cli, file: &Path) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("reading {:?}", file))?;
    let update = status::decode(&raw).context("decoding status payload")?;

    match cli.output {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "version": update.version(),
                "entries": update.entries(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("version {}, {} records", update.version(), update.len());
            for entry in update.entries() {
                println!(
                    "{:>6} load={:>5.1} {}",
                    entry.index,
                    entry.load,
                    if entry.online { "online" } else { "offline" }
                );
            }
        }
    }
    Ok(())
}

fn apply_status(cli: &Cli, servers: &Path, status_file: &Path) -> Result<()> {
    let servers: Vec<Arc<Server>> = load_servers(servers)?.into_iter().map(Arc::new).collect();
    let raw = std::fs::read(status_file).with_context(|| format!("reading {:?}", status_file))?;
    let update = status::decode(&raw).context("decoding status payload")?;
    let updated = update.apply(&servers);

    match cli.output {
        OutputFormat::Json => {
            let plain: Vec<&Server> = updated.iter().map(|s| s.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&plain)?);
        }
        OutputFormat::Text => {
            for server in &updated {
                println!(
                    "{} load={:.1} online={} visible={}",
                    server.server_id, server.load, server.online, server.visible
                );
            }
        }
    }
    Ok(())
}

async fn wg_config(
    config: &VpnCoreConfig,
    servers: &Path,
    server_id: &str,
    transport: TransportProtocol,
    output_file: Option<&Path>,
) -> Result<()> {
    let server = Arc::new(find_server(servers, server_id)?);
    let backend = WireGuardBackend::new(
        Arc::new(DryRunPlatform { fail_first: AtomicU32::new(0) }),
        config.wireguard.clone(),
        config.ports.clone(),
    );
    let selection = ProtocolSelection::new(VpnProtocol::WireGuard, Some(transport));
    let plan = backend
        .prepare(&ConnectIntent::server(server_id), &server, selection)
        .await?;

    let TunnelTarget::WireGuard { config: wg, endpoints, .. } = &plan.target else {
        bail!("unexpected plan for WireGuard");
    };
    let Some(endpoint) = endpoints.first() else {
        bail!("no endpoint for server {}", server_id);
    };
    let content = wg.render(*endpoint);

    match output_file {
        Some(path) => {
            write_secure_config(path, &content, 0o600).await?;
            println!("Wrote {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

async fn dry_run_connect(
    cli: &Cli,
    config: &VpnCoreConfig,
    settings: ConnectionSettings,
    servers: &Path,
    intent: ConnectIntent,
    fail_first: u32,
) -> Result<()> {
    let directory = load_directory(servers)?;
    let platform = Arc::new(DryRunPlatform { fail_first: AtomicU32::new(fail_first) });
    let backends = Arc::new(VpnManager::with_platform(platform, config.wireguard.clone(), config.ports.clone()));
    let manager = ConnectionManager::new(directory, backends, settings);

    let mut transitions = manager.transitions();
    manager.connect(intent).await;

    let mut outcome = None;
    while outcome.is_none() {
        let status = transitions.recv().await.context("status stream closed")?;
        print_status(cli, &status)?;
        match status.state {
            VpnState::Connected => outcome = Some(Ok(())),
            VpnState::Error { kind, is_final: true } => outcome = Some(Err(kind)),
            _ => {}
        }
    }

    manager.disconnect().await;
    while let Ok(status) = transitions.try_recv() {
        print_status(cli, &status)?;
    }

    match outcome {
        Some(Err(kind)) => bail!("connection failed: {}", kind),
        _ => Ok(()),
    }
}

fn print_status(cli: &Cli, status: &VpnStatus) -> Result<()> {
    match cli.output {
        OutputFormat::Json => println!("{}", serde_json::to_string(status)?),
        OutputFormat::Text => {
            let server = status
                .server_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:<22} server={} attempt={}", status.state.to_string(), server, status.attempt);
        }
    }
    Ok(())
}
