use clap::{Parser, ValueEnum};
use peerprobe::config::{self, Config, SubnetConfig};
use peerprobe::error::AppError;
use peerprobe::network::handshake::HandshakeFaults;
use peerprobe::network::peer_id::PeerKeyId;
use peerprobe::network::server::NetServer;
use peerprobe::network::signed_message::Account;
use peerprobe::protocols::gov::{GovNodeMockResolver, MockLedger};
use peerprobe::protocols::handlers::{
    OnlyHeartbeatHandler, ServiceOptions, SubnetHandler, WithoutBlockSyncHandler,
};
use peerprobe::protocols::heartbeat::{HeartbeatInterrupt, HeartbeatParams};
use peerprobe::protocols::subnet::SubnetParams;
use peerprobe::protocols::{Protocol, P2P};
use peerprobe::shutdown::ShutdownManager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolKind {
    Heartbeat,
    WithoutBlockSync,
    Subnet,
}

#[derive(Parser, Debug)]
#[command(name = "peerprobe")]
#[command(about = "P2P session node for network probing", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    node_port: Option<u16>,

    #[arg(long)]
    http_port: Option<u16>,

    #[arg(long, value_enum, default_value = "without-block-sync")]
    protocol: ProtocolKind,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = if Path::new(&args.config).exists() {
        match Config::load_from_file(&args.config) {
            Ok(cfg) => {
                println!("✓ Loaded configuration from {}", args.config);
                cfg
            }
            Err(e) => {
                eprintln!("❌ Failed to load config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        println!("✓ No config at {}, using defaults", args.config);
        Config::default()
    };
    if let Some(port) = args.node_port {
        config.network.node_port = port;
    }
    if let Some(port) = args.http_port {
        config.network.http_info_port = port;
    }
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    println!("\n🚀 peerprobe v{} ({})", version, git_hash);
    println!("  └─ Protocol: {:?}", args.protocol);
    println!(
        "  └─ Listen: {}:{}",
        config.network.listen_host, config.network.node_port
    );
    println!("  └─ Seeds: {}", config.network.seeds.len());
    println!();

    let protocol = match build_protocol(args.protocol, &config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("❌ Failed to set up protocol: {}", e);
            std::process::exit(1);
        }
    };

    let server = match NetServer::bind_tcp(
        PeerKeyId::random(),
        protocol,
        &config,
        HandshakeFaults::default(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            eprintln!("❌ Failed to start network: {}", e);
            std::process::exit(1);
        }
    };
    server.start().await;

    let mut shutdown_manager = ShutdownManager::new();

    let status_token = shutdown_manager.token();
    let status_server = server.clone();
    let status_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = status_token.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::info!(
                        "📊 Status: Peers={}, Outbound={}, MaxPeerHeight={}",
                        status_server.connection_count(),
                        status_server.out_conn_record_len(),
                        status_server.get_max_peer_block_height()
                    );
                }
            }
        }
    });
    shutdown_manager.register_task("status", status_handle);
    shutdown_manager.add_server(server);

    println!("Press Ctrl+C to stop\n");
    let report = shutdown_manager.wait_for_shutdown().await;
    if !report.is_clean() {
        eprintln!("⚠️  Tasks aborted at shutdown: {:?}", report.aborted);
    }
}

fn build_protocol(kind: ProtocolKind, config: &Config) -> Result<Arc<dyn Protocol>, AppError> {
    let heartbeat = HeartbeatParams::from_config(&config.heartbeat, HeartbeatInterrupt::default());
    let protocol: Arc<dyn Protocol> = match kind {
        ProtocolKind::Heartbeat => Arc::new(OnlyHeartbeatHandler::new(heartbeat)),
        ProtocolKind::WithoutBlockSync => Arc::new(WithoutBlockSyncHandler::new(
            ServiceOptions::from_config(config),
            heartbeat,
        )?),
        ProtocolKind::Subnet => {
            let ledger = MockLedger::new();
            for pubkey in &config.subnet.gov_pubkeys {
                ledger.add_gov_node(pubkey);
            }
            Arc::new(SubnetHandler::new(
                gov_account(&config.subnet)?,
                ServiceOptions::from_config(config),
                Arc::new(GovNodeMockResolver::new(ledger)),
                SubnetParams::from(&config.subnet),
            )?)
        }
    };
    Ok(protocol)
}

fn gov_account(config: &SubnetConfig) -> Result<Option<Account>, AppError> {
    let Some(seed) = &config.gov_account else {
        return Ok(None);
    };
    let bytes = hex::decode(seed)
        .map_err(|e| AppError::Config(format!("invalid gov_account: {}", e)))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AppError::Config("gov_account must be 32 bytes".to_string()))?;
    Ok(Some(Account::from_bytes(&seed)))
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald adds its own timestamp and host
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
}

/// UTC wall clock plus short hostname, e.g. `2025-12-10 18:09:43.150 [probe1]`.
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
