//! Broadcast listener: subscribes to a server's broadcast socket and
//! appends every matching parameter update to a CSV file.
//!
//! Exit codes: 0 success, 1 configuration error, 2 connection failure,
//! 3 fatal runtime error.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use labrack_core::Subscriber;

#[derive(Debug, Deserialize)]
struct ListenerConfig {
    /// Broadcast socket to connect to, as `host:port`.
    address: String,

    /// Topic prefixes to record; empty records everything.
    #[serde(default)]
    topics: Vec<String>,

    /// CSV file updates are appended to.
    csv_path: PathBuf,
}

#[derive(Parser, Debug)]
#[command(name = "labrack-listener")]
#[command(about = "Record labrack broadcasts to CSV")]
struct Args {
    /// Listener configuration file (YAML)
    #[arg(short = 'c', long)]
    config: PathBuf,

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

    let config: ListenerConfig = match std::fs::read_to_string(&args.config)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_yaml::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {}: {}", args.config.display(), e);
            return ExitCode::from(1);
        }
    };

    let file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.csv_path)
    {
        Ok(file) => file,
        Err(e) => {
            error!("cannot open {}: {}", config.csv_path.display(), e);
            return ExitCode::from(1);
        }
    };
    let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
    let file = Mutex::new(file);
    if fresh {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "time,topic,value,unit");
        }
    }

    // A single prefix can be filtered server-side; multiple prefixes are
    // filtered here.
    let server_prefix = match config.topics.as_slice() {
        [only] => only.clone(),
        _ => String::new(),
    };
    let topics = config.topics.clone();

    let subscriber = match Subscriber::start(&config.address, &server_prefix, move |event| {
        if !topics.is_empty() && !topics.iter().any(|t| event.topic.starts_with(t)) {
            return;
        }
        info!(
            "recording [{}, {}, {}]",
            event.topic, event.change.value, event.change.unit
        );
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(
                file,
                "{},{},{},{}",
                event.change.ts,
                csv_field(&event.topic),
                csv_field(&event.change.value.to_string()),
                csv_field(&event.change.unit),
            );
        }
    })
    .await
    {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!("cannot subscribe at {}: {}", config.address, e);
            return ExitCode::from(2);
        }
    };
    info!(
        "listening at {} and writing to {}",
        subscriber.addr(),
        config.csv_path.display()
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("shutdown signal received");
            subscriber.stop().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to wait for shutdown signal: {}", e);
            ExitCode::from(3)
        }
    }
}

/// Quote a CSV field when it contains separators or quotes.
fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_listener_config_parses() {
        let config: ListenerConfig = serde_yaml::from_str(
            "address: \"127.0.0.1:5556\"\ntopics: [\"dmm.\"]\ncsv_path: out.csv\n",
        )
        .unwrap();
        assert_eq!(config.address, "127.0.0.1:5556");
        assert_eq!(config.topics, vec!["dmm."]);
    }
}
