//! The `burrow` binary: load a configuration, start the configured
//! role, run until interrupted.

use anyhow::Result;
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use burrow_client::Router;
use burrow_config::{AppConfig, Mode, Protocol};
use burrow_server::Switches;
use burrow_transport::crypto::Method;

/// Configuration files probed, in order, when no path is given.
const CONFIG_SEARCH: [&str; 4] = ["frp.ini", "frpd.ini", "frpc.ini", "frps.ini"];

#[derive(Parser)]
#[command(name = "burrow", version, about = "Reverse-tunneling relay")]
struct Args {
    /// Path to the INI configuration file.
    #[arg(
        short = 'c',
        long = "config",
        visible_alias = "conf",
        alias = "c",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,
}

/// Accept the historical single-dash spellings (`-conf`, `-config`)
/// alongside the standard ones.
fn normalized_args() -> Vec<OsString> {
    std::env::args_os()
        .map(|arg| match arg.to_str() {
            Some("-conf") | Some("-config") => OsString::from("--config"),
            _ => arg,
        })
        .collect()
}

fn load_config(explicit: Option<PathBuf>) -> Option<AppConfig> {
    let mut candidates: Vec<PathBuf> = explicit.into_iter().collect();
    candidates.extend(CONFIG_SEARCH.iter().map(PathBuf::from));

    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match AppConfig::load(&path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                return Some(config);
            }
            Err(error) => warn!(path = %path.display(), %error, "configuration rejected"),
        }
    }
    None
}

fn print_usage() {
    let cwd = std::env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    println!("burrow {} - reverse-tunneling relay", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Cwd:");
    println!("    {cwd}");
    println!("Usage:");
    println!("    burrow -c <config.ini>");
    println!();
    println!("Without -c the working directory is searched for:");
    println!("    {}", CONFIG_SEARCH.join(", "));
}

fn print_banner(config: &AppConfig, endpoint: &str) {
    let cwd = std::env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    println!("Application started. Press Ctrl+C to shut down.");
    println!("Loopback:");
    println!("Mode                  : {}", config.mode.as_str());
    println!("Process               : {}", std::process::id());
    println!("Protocol              : {}", config.protocol.as_str());
    println!("Cwd                   : {cwd}");
    println!("TCP/IP                : {endpoint}");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_from(normalized_args());
    let config = match load_config(args.config) {
        Some(config) => Arc::new(config),
        None => {
            print_usage();
            return Ok(());
        }
    };

    // An unusable cipher method is a configuration error, caught before
    // any socket is opened.
    if config.protocol == Protocol::Encryptor
        && Method::from_name(&config.encryptor.method).is_none()
    {
        warn!(method = %config.encryptor.method, "unsupported cipher method");
        print_usage();
        return Ok(());
    }

    match config.mode {
        Mode::Server => {
            let switches = Switches::new(Arc::clone(&config));
            match switches.open().await {
                Ok(local) => {
                    print_banner(&config, &local.to_string());
                    tokio::signal::ctrl_c().await?;
                    switches.close();
                }
                Err(error) => {
                    debug!(%error, "server failed to start");
                }
            }
        }
        Mode::Client => {
            let router = Router::new(Arc::clone(&config));
            match router.open() {
                Ok(()) => {
                    let endpoint = format!("{}:{}", config.ip, config.port);
                    print_banner(&config, &endpoint);
                    tokio::signal::ctrl_c().await?;
                    router.close();
                }
                Err(error) => {
                    debug!(%error, "client failed to start");
                }
            }
        }
    }
    Ok(())
}
