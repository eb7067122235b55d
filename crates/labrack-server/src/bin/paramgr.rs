//! Console tool for the parameter manager.
//!
//! Ensures the parameter-manager instrument exists on a running server,
//! optionally loads a profile into it, and prints its current state.
//!
//! Exit codes: 0 success, 1 configuration error, 3 fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Map};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use labrack_core::config::NetConfig;
use labrack_core::{Client, ParameterManager};

#[derive(Parser, Debug)]
#[command(name = "labrack-paramgr")]
#[command(about = "Manage the parameter-manager instrument on a labrack server")]
struct Args {
    /// Instrument name on the server
    #[arg(long, default_value = "parameter_manager")]
    name: String,

    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server request port
    #[arg(long, default_value_t = NetConfig::DEFAULT_PORT)]
    port: u16,

    /// Profile to load into the manager after creation
    #[arg(long)]
    profile: Option<PathBuf>,

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

    let client = Arc::new(Client::new(args.host.clone(), args.port));

    let mut kwargs = Map::new();
    if let Some(profile) = &args.profile {
        kwargs.insert("profile".into(), json!(profile.to_string_lossy()));
    }

    let pm = match client
        .find_or_create_instrument(&args.name, ParameterManager::CLASS_PATH, vec![], kwargs)
        .await
    {
        Ok(pm) => pm,
        Err(e) => {
            error!("could not reach or create '{}': {}", args.name, e);
            return ExitCode::from(3);
        }
    };
    info!("parameter manager '{}' is available", args.name);

    if let Some(profile) = &args.profile {
        match client
            .call_method(
                &args.name,
                "load",
                vec![json!(profile.to_string_lossy())],
                Map::new(),
            )
            .await
        {
            Ok(applied) => info!("loaded {} parameters from {}", applied, profile.display()),
            Err(e) => warn!("profile {} not loaded: {}", profile.display(), e),
        }
    }

    match pm.snapshot().await {
        Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("failed to render snapshot: {}", e);
                return ExitCode::from(3);
            }
        },
        Err(e) => {
            error!("failed to fetch snapshot: {}", e);
            return ExitCode::from(3);
        }
    }

    ExitCode::SUCCESS
}
