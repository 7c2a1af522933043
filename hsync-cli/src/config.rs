use clap::{Args, Parser, Subcommand};
use libhsync::config::{DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT};
use std::path::PathBuf;

/// hsync bridge.
///
/// Manage the shared connections to remote hsync servers and publish messages through an HTTP relay.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the configuration file. The default is `$HOME/.hsync/config.yml`.
    #[arg(long = "config-file", short = 'c', global = true)]
    pub config_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add, list, check or remove configured connections.
    #[command(subcommand, name = "connections", alias = "conn")]
    Connections(ConnectionCommand),
    /// Publish messages through an HTTP relay.
    #[command(subcommand, name = "relay")]
    Relay(RelayCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConnectionCommand {
    /// Add a named connection to the configuration file.
    #[command(name = "add", alias = "new")]
    Add {
        /// The name of the connection.
        name: String,
        /// The address of the remote hsync server, e.g. `wss://node-a.example`.
        server: String,
        /// The shared secret for the remote server.
        #[arg(long, env = "HSYNC_SECRET", hide_env_values = true)]
        secret: String,
        #[arg(long = "local-host", default_value = DEFAULT_LOCAL_HOST)]
        local_host: String,
        #[arg(long = "local-port", default_value_t = DEFAULT_LOCAL_PORT)]
        local_port: u16,
    },
    /// List configured connections and whether each would build, reuse or supersede a session.
    #[command(name = "list", alias = "ls")]
    List,
    /// Resolve every configured connection against an in-memory transport and print the resulting registry.
    #[command(name = "check", alias = "dry-run")]
    Check,
    /// Remove a named connection.
    #[command(name = "remove", alias = "rm", alias = "del")]
    Remove {
        /// The name of the connection to remove.
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum RelayCommand {
    /// Post one message to a relay.
    #[command(name = "send")]
    Send(SendCommand),
}

#[derive(Debug, Args)]
pub struct SendCommand {
    /// A relay named in the configuration file.
    #[arg(long, short = 'r', conflicts_with = "base", required_unless_present = "base")]
    pub relay: Option<String>,
    /// The relay base address, e.g. `https://gw.example/`.
    #[arg(long, short = 'b')]
    pub base: Option<String>,
    /// The message topic. Overrides the named relay's default topic.
    #[arg(long, short = 't')]
    pub topic: Option<String>,
    /// Query parameters as `key=value`. May be repeated.
    #[arg(long = "query", short = 'q', value_parser = parse_key_value)]
    pub query: Vec<(String, String)>,
    /// The payload. Text that is not valid JSON is sent as a JSON string.
    pub payload: String,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions { config_file: self.config_file };
        (global, self.command)
    }
}
