use clap::Parser;
use hsync_cli::config::{CliCommand, Config, ConnectionCommand, GlobalOptions, RelayCommand};
use hsync_cli::connection_management::{
    add_connection, check_connections, describe_plan, load_or_default, remove_connection,
};
use hsync_cli::relay_commands;
use libhsync::config::default_config_path;
use libhsync::{ConnectionConfig, NamedConnection};
use log::*;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config: Config = Config::parse();
    let (global_options, command) = config.to_parts();

    let result = match command {
        CliCommand::Connections(cmd) => exec_connection_command(cmd, global_options).await,
        CliCommand::Relay(cmd) => exec_relay_command(cmd, global_options).await,
    };

    if let Err(err) = result {
        eprintln!("** Error ** \n {err}");
        std::process::exit(1);
    }
}

async fn exec_connection_command(cmd: ConnectionCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.config_file.unwrap_or_else(default_config_path);
    let mut config = load_or_default(&path)?;
    match cmd {
        ConnectionCommand::Add { name, server, secret, local_host, local_port } => {
            let config_entry = ConnectionConfig::new(server, secret).with_local(local_host, local_port);
            let connection = NamedConnection { name, config: config_entry };
            println!("Adding connection {} ({})", connection.name, connection.config.identity_key());
            add_connection(&mut config, connection)?;
            config.save(&path)?;
            println!("Saved configuration to {}", path.display());
        }
        ConnectionCommand::List => {
            println!("{} connection(s) configured.", config.connections.len());
            for line in describe_plan(&config) {
                println!("{line}");
            }
        }
        ConnectionCommand::Check => {
            let connections = check_connections(&config).await?;
            println!("{} session(s) after resolving {} connection(s).", connections.len(), config.connections.len());
            for info in connections {
                let status = info.status.to_string();
                println!("{:<32} {status:<12} subscribers: {}", info.key.as_str(), info.subscribers);
            }
        }
        ConnectionCommand::Remove { name } => {
            let removed = remove_connection(&mut config, &name)?;
            config.save(&path)?;
            println!("Removed connection {} ({})", removed.name, removed.config.identity_key());
        }
    }
    debug!("Connection command complete");
    Ok(())
}

async fn exec_relay_command(cmd: RelayCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    match cmd {
        RelayCommand::Send(send) => relay_commands::send(send, options.config_file.as_deref()).await,
    }
}
