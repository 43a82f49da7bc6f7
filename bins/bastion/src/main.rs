use anyhow::{Context, Result};
use bastion_ledger::{host, Ledger};
use bastion_tunnel::{sql, DialRegistry, Tunnel, TunnelError};
use bastion_types::TunnelConfig;
use std::path::PathBuf;
use tracing_subscriber::{self, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("bastion {VERSION}");
    println!("Reach a database through an SSH bastion, trusting host keys on first use\n");
    println!("USAGE:");
    println!("  bastion --config <FILE> [--query <SQL>]");
    println!("  bastion --known-hosts [PATH]\n");
    println!("OPTIONS:");
    println!("  -c, --config <FILE>      Tunnel configuration (JSON)");
    println!("  -q, --query <SQL>        Query to run through the tunnel [default: SELECT 1]");
    println!("      --known-hosts [PATH] List trusted host keys [default: ~/.ssh/known_hosts]");
    println!("  -h, --help               Print help");
    println!("  -V, --version            Print version");
    println!("\nLogging goes to stderr; set RUST_LOG=debug for channel-level detail.");
}

/// Value following `flag` (or its short form), if present.
fn flag_value<'a>(args: &'a [String], long: &str, short: Option<&str>) -> Option<&'a str> {
    args.iter()
        .position(|a| a == long || Some(a.as_str()) == short)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .filter(|v| !v.starts_with('-'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("bastion {VERSION}");
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        print_help();
        return Ok(());
    }

    // stdout carries query results; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if args.iter().any(|a| a == "--known-hosts") {
        let ledger = match flag_value(&args, "--known-hosts", None) {
            Some(path) => Ledger::new(path),
            None => Ledger::with_defaults(),
        };
        return list_known_hosts(&ledger);
    }

    let config_path = flag_value(&args, "--config", Some("-c"))
        .map(PathBuf::from)
        .context("missing --config <FILE> (see --help)")?;
    let query = flag_value(&args, "--query", Some("-q")).unwrap_or("SELECT 1");

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let config: TunnelConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    match run_query(&config, query).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.is_security_critical() {
                eprintln!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                eprintln!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                eprintln!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                eprintln!("Someone could be intercepting this connection.");
            }
            tracing::error!("{e}");
            Err(e.into())
        }
    }
}

async fn run_query(config: &TunnelConfig, query: &str) -> Result<(), TunnelError> {
    let registry = DialRegistry::new();
    let tunnel = Tunnel::open(config, &registry).await?;

    // the pool bridge only recognizes the registered identifier
    let rest = config
        .db_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| TunnelError::InvalidUrl(config.db_url.clone()))?;
    let url = format!("{}://{rest}", tunnel.identifier());

    let result = async {
        let pool = sql::connect(&registry, &url).await?;
        let output = sql::query(&pool.pool, query).await;
        pool.close().await;
        output
    }
    .await;
    tunnel.close().await;

    let output = result?;
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("Failed to encode query output: {e}"),
    }
    Ok(())
}

fn list_known_hosts(ledger: &Ledger) -> Result<()> {
    let records = ledger
        .load()
        .with_context(|| format!("failed to read {}", ledger.path().display()))?;
    if records.is_empty() {
        println!("No trusted host keys in {}", ledger.path().display());
        return Ok(());
    }
    for record in &records {
        println!(
            "{} {} {}",
            record.host_pattern,
            record.key_type,
            host::fingerprint(&record.host_key())
        );
    }
    Ok(())
}
