#![deny(unsafe_code)]

//! facegate CLI: runs the service and talks to it over the control channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use facegate_config::AppConfig;
use facegate_core::{ControlEndpoint, Daemon, RecentLogs, build_info, send_command};

/// facegate: face-feature extraction over WebSockets.
#[derive(Parser)]
#[command(name = "facegate", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "facegate.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service in the foreground.
    Start {
        /// Override the streaming listen address (`host:port`).
        #[arg(long)]
        listen: Option<String>,
    },

    /// Send a command to the running service and print its reply.
    Cmd {
        /// Command text, e.g. `status` or `quit`.
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        /// Seconds to wait for the reply (0 = forever). Defaults to the config value.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Ask the running service to shut down.
    Stop,

    /// Show the running service's status.
    Status,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Show build information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let logs = match cli.command {
        Commands::Start { .. } => Some(RecentLogs::default()),
        _ => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logs.clone())
        .init();

    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Start { listen } => cmd_start(config, listen.as_deref(), logs).await?,
        Commands::Cmd { text, timeout } => {
            let reply = cmd_send(&config, &text.join(" "), timeout).await?;
            println!("{reply}");
        }
        Commands::Stop => {
            let reply = cmd_send(&config, "quit", None).await?;
            println!("{reply}");
        }
        Commands::Status => {
            let reply = cmd_send(&config, "status", None).await?;
            println!("{reply}");
        }
        Commands::Config { show } => cmd_config(&cli.config, &config, found, show)?,
        Commands::Version => println!("{}", build_info::build_report()),
    }

    Ok(())
}

async fn cmd_start(
    mut config: AppConfig,
    listen: Option<&str>,
    logs: Option<RecentLogs>,
) -> Result<()> {
    if let Some(listen) = listen {
        apply_listen(&mut config, listen)?;
    }

    let mut daemon = Daemon::from_config(config)?;
    if let Some(logs) = logs {
        daemon = daemon.with_log_reader(logs.reader());
    }

    let running = daemon.start().await?;
    info!(
        addr = %running.local_addr(),
        control = %running.control_endpoint(),
        "facegate running"
    );
    running.run().await?;
    Ok(())
}

async fn cmd_send(config: &AppConfig, command: &str, timeout: Option<u64>) -> Result<String> {
    let endpoint = ControlEndpoint::from_config(&config.control)?;
    let timeout = reply_timeout(config, timeout);
    send_command(&endpoint, command, timeout)
        .await
        .with_context(|| format!("no facegate service answered on {endpoint}"))
}

fn cmd_config(path: &Path, config: &AppConfig, found: bool, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else if found {
        println!("Configuration at '{}' is valid.", path.display());
    } else {
        println!("No configuration at '{}'; defaults apply.", path.display());
    }
    Ok(())
}

/// Load the config file, or defaults when it does not exist.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

/// Apply a `host:port` override to the streaming listener.
fn apply_listen(config: &mut AppConfig, listen: &str) -> Result<()> {
    let Some((host, port)) = listen.rsplit_once(':') else {
        bail!("--listen expects host:port, got {listen:?}");
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {listen:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("--listen expects host:port, got {listen:?}");
    }
    config.server.listen_addr = host.to_string();
    config.server.listen_port = port;
    config.validate()?;
    Ok(())
}

/// Flag value wins over config; zero means no deadline.
fn reply_timeout(config: &AppConfig, flag: Option<u64>) -> Option<Duration> {
    match flag {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.control.reply_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_apply_listen() {
        let mut config = AppConfig::default();
        apply_listen(&mut config, "0.0.0.0:8080").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 8080);
    }

    #[test]
    fn test_apply_listen_ipv6() {
        let mut config = AppConfig::default();
        apply_listen(&mut config, "[::1]:9000").unwrap();
        assert_eq!(config.server.listen_addr, "::1");
        assert_eq!(config.server.listen_port, 9000);
    }

    #[test]
    fn test_apply_listen_rejects_garbage() {
        let mut config = AppConfig::default();
        assert!(apply_listen(&mut config, "localhost").is_err());
        assert!(apply_listen(&mut config, ":9000").is_err());
        assert!(apply_listen(&mut config, "host:notaport").is_err());
    }

    #[test]
    fn test_reply_timeout() {
        let config = AppConfig::default();
        assert_eq!(reply_timeout(&config, None), Some(Duration::from_secs(10)));
        assert_eq!(reply_timeout(&config, Some(3)), Some(Duration::from_secs(3)));
        assert_eq!(reply_timeout(&config, Some(0)), None);
    }

    #[test]
    fn test_parse_cmd_joins_words() {
        let cli = Cli::try_parse_from(["facegate", "cmd", "hello", "world", "--timeout", "2"]).unwrap();
        match cli.command {
            Commands::Cmd { text, timeout } => {
                assert_eq!(text.join(" "), "hello world");
                assert_eq!(timeout, Some(2));
            }
            _ => panic!("expected cmd"),
        }
    }

    #[test]
    fn test_parse_start_listen() {
        let cli = Cli::try_parse_from(["facegate", "-vv", "start", "--listen", "127.0.0.1:0"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Start { listen: Some(ref l) } if l == "127.0.0.1:0"
        ));
    }

    #[tokio::test]
    async fn test_load_config_missing_uses_defaults() {
        let (config, found) = load_config(Path::new("/nonexistent/facegate.toml"))
            .await
            .unwrap();
        assert!(!found);
        assert_eq!(config.server.listen_port, 9999);
    }

    #[tokio::test]
    async fn test_load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("facegate.toml");
        tokio::fs::write(&path, "[server]\nlisten_port = 7000\n")
            .await
            .unwrap();

        let (config, found) = load_config(&path).await.unwrap();
        assert!(found);
        assert_eq!(config.server.listen_port, 7000);
    }

    #[tokio::test]
    async fn test_load_config_invalid_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("facegate.toml");
        tokio::fs::write(&path, "[server]\npath = \"nope\"\n")
            .await
            .unwrap();

        assert!(load_config(&path).await.is_err());
    }
}
