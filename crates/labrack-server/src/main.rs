//! labrack server binary.
//!
//! Loads the startup configuration, instantiates the configured
//! instruments, binds the request and broadcast listeners, and serves until
//! interrupted.
//!
//! Exit codes: 0 success, 1 configuration error, 2 bind failure, 3 fatal
//! runtime error.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use labrack_core::config::{NetConfig, ServerConfig};
use labrack_core::{
    startup, BroadcastBus, Client, Instruction, InstrumentFactory, Registry, ServerSettings,
    StartupConfig, StationServer,
};

#[derive(Parser, Debug)]
#[command(name = "labrack-server")]
#[command(about = "Instrument server for laboratory hardware")]
struct Args {
    /// Primary request port
    #[arg(short = 'p', long, default_value_t = NetConfig::DEFAULT_PORT)]
    port: u16,

    /// Broadcast port (defaults to the request port plus one)
    #[arg(long)]
    broadcast_port: Option<u16>,

    /// Enable the GUI front-end
    #[arg(long)]
    gui: Option<bool>,

    /// Extra addresses to listen on ("host" or "host:port")
    #[arg(short = 'a', long = "listen_at")]
    listen_at: Vec<String>,

    /// Startup configuration file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Newline-separated JSON instructions executed after startup
    #[arg(short = 'i', long = "init_script")]
    init_script: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("starting labrack server");
    if args.gui == Some(true) {
        // The GUI front-ends are separate applications that connect as
        // clients.
        warn!("--gui has no effect on the headless server");
    }

    let config = match &args.config {
        Some(path) => match StartupConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                return ExitCode::from(1);
            }
        },
        None => StartupConfig::default(),
    };

    let mut bind: Vec<SocketAddr> = vec![SocketAddr::from(([0, 0, 0, 0], args.port))];
    let mut extra_addrs = args.listen_at.clone();
    if let Some(addr) = &config.networking.listening_address {
        extra_addrs.push(addr.clone());
    }
    for spec in &extra_addrs {
        match parse_listen_addr(spec, args.port) {
            Ok(addr) => bind.push(addr),
            Err(e) => {
                error!("invalid listen address '{}': {}", spec, e);
                return ExitCode::from(1);
            }
        }
    }
    let broadcast_port = args
        .broadcast_port
        .unwrap_or(args.port + NetConfig::BROADCAST_PORT_OFFSET);

    let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
    if let Err(e) = startup::apply(&config, &registry).await {
        error!("failed to initialize instruments: {}", e);
        return ExitCode::from(1);
    }

    let bus = Arc::new(BroadcastBus::new(ServerConfig::LOCAL_FANOUT_CAPACITY));
    let mut settings = ServerSettings::new(
        bind[0],
        SocketAddr::from(([0, 0, 0, 0], broadcast_port)),
    )
    .with_polling(config.polling_entries());
    for addr in bind.into_iter().skip(1) {
        settings = settings.with_extra_bind(addr);
    }
    if let Some(target) = &config.networking.external_broadcast {
        settings = settings.with_external_broadcast(target.clone());
    }

    let mut handle = match StationServer::start(settings, registry, bus).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to bind listeners: {}", e);
            return ExitCode::from(2);
        }
    };

    if let Some(script) = &args.init_script {
        if let Err(e) = run_init_script(script, handle.addr().port()).await {
            warn!("init script failed: {:#}", e);
        }
    }

    info!(
        "serving requests on port {}, broadcasts on port {}",
        handle.addr().port(),
        handle.broadcast_addr.port()
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("shutdown signal received, exiting");
            handle.shutdown();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to wait for shutdown signal: {}", e);
            ExitCode::from(3)
        }
    }
}

/// Accept either a bare host IP (reusing the request port) or a full
/// `ip:port` pair.
fn parse_listen_addr(spec: &str, default_port: u16) -> Result<SocketAddr, String> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    spec.parse::<IpAddr>()
        .map(|ip| SocketAddr::from((ip, default_port)))
        .map_err(|_| "expected an IP address or ip:port".to_string())
}

/// Replay a file of newline-separated JSON instructions against the freshly
/// started server. Blank lines and `#` comments are skipped; instruction
/// failures are logged and do not stop the script.
async fn run_init_script(path: &Path, port: u16) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read init script {}", path.display()))?;
    let client = Client::new("127.0.0.1", port);

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let instruction: Instruction = serde_json::from_str(line)
            .with_context(|| format!("init script line {} is not an instruction", index + 1))?;
        match client.ask(&instruction).await {
            Ok(value) => info!("init[{}]: {}", index + 1, value),
            Err(e) => warn!("init[{}] failed: {}", index + 1, e),
        }
    }
    Ok(())
}
