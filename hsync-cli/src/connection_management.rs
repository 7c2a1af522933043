use crate::console_host::ConsoleHost;
use anyhow::anyhow;
use hsync_p2p::loopback::LoopbackTransport;
use hsync_p2p::{new_registry, ConnectionInfo, ConnectionNode, RegistryError};
use libhsync::{BridgeConfig, ConfigError, NamedConnection, PlanAction};
use log::*;
use std::io::ErrorKind;
use std::path::Path;

/// Load the configuration file, or start from an empty configuration if there is no file yet.
pub fn load_or_default(path: &Path) -> Result<BridgeConfig, anyhow::Error> {
    match BridgeConfig::try_load(Some(path)) {
        Ok(config) => Ok(config),
        Err(ConfigError::IoError(err)) if err.kind() == ErrorKind::NotFound => {
            info!("No configuration file at {}. Starting with an empty configuration.", path.display());
            Ok(BridgeConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

pub fn add_connection(config: &mut BridgeConfig, connection: NamedConnection) -> Result<(), anyhow::Error> {
    if config.connections.iter().any(|c| c.name == connection.name) {
        return Err(anyhow!("A connection named {} already exists.", connection.name));
    }
    if connection.config.identity_key().is_empty() {
        return Err(anyhow!("The server address for {} is empty.", connection.name));
    }
    config.connections.push(connection);
    Ok(())
}

pub fn remove_connection(config: &mut BridgeConfig, name: &str) -> Result<NamedConnection, anyhow::Error> {
    match config.connections.iter().position(|c| c.name == name) {
        Some(index) => Ok(config.connections.remove(index)),
        None => Err(ConfigError::UnknownConnection(name.to_string()).into()),
    }
}

/// One line per configured connection: name, identity key, what the registry would do with it, secret fingerprint.
pub fn describe_plan(config: &BridgeConfig) -> Vec<String> {
    config
        .plan()
        .into_iter()
        .zip(&config.connections)
        .map(|(plan, conn)| {
            let action = match plan.action {
                PlanAction::Build => "build".to_string(),
                PlanAction::Reuse(other) => format!("reuse {other}"),
                PlanAction::Supersede(other) => format!("supersede {other}"),
            };
            let fingerprint = conn.config.secret.fingerprint();
            format!("{:<16} {:<32} {:<24} secret:{fingerprint}", plan.name, plan.key.as_str(), action)
        })
        .collect()
}

/// Resolve every configured connection, in order, against the loopback transport, then report the registry.
///
/// Nothing leaves the machine. Connections that get superseded by a later entry are released as removed.
pub async fn check_connections(config: &BridgeConfig) -> Result<Vec<ConnectionInfo>, anyhow::Error> {
    let (registry, event_loop) = new_registry(LoopbackTransport::new());
    let event_loop = tokio::spawn(event_loop.run());
    let mut nodes = Vec::with_capacity(config.connections.len());
    for conn in &config.connections {
        let host = ConsoleHost::new(conn.name.as_str());
        let node = ConnectionNode::start(registry.clone(), conn.config.clone(), &host).await?;
        node.session().connected().await;
        nodes.push(node);
    }
    let connections = registry.connections().await?;
    for node in nodes {
        match node.on_close(true).await {
            Ok(outcome) => trace!("Released check connection: {outcome:?}"),
            Err(RegistryError::RegistryClosed) => break,
            Err(err) => return Err(err.into()),
        }
    }
    registry.shutdown().await?;
    event_loop.await?;
    Ok(connections)
}
