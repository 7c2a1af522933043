use crate::error::ConfigError;
use crate::identity::IdentityKey;
use crate::secret::Secret;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOCAL_HOST: &str = "localhost";
pub const DEFAULT_LOCAL_PORT: u16 = 3000;

/// Everything needed to open one connection to a remote hsync server.
///
/// Two configs are equal when they name the same remote (by [`IdentityKey`]) with the same credential and the same
/// local bind address. That is the test the registry uses to decide between reusing a session and superseding it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "server")]
    pub remote_identity: String,
    pub secret: Secret,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

fn default_local_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

impl ConnectionConfig {
    pub fn new(remote_identity: impl Into<String>, secret: impl Into<Secret>) -> Self {
        Self {
            remote_identity: remote_identity.into(),
            secret: secret.into(),
            local_host: default_local_host(),
            local_port: default_local_port(),
        }
    }

    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = host.into();
        self.local_port = port;
        self
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::from_address(&self.remote_identity)
    }
}

impl PartialEq for ConnectionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
            && self.secret == other.secret
            && self.local_host == other.local_host
            && self.local_port == other.local_port
    }
}

impl Eq for ConnectionConfig {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedConnection {
    pub name: String,
    #[serde(flatten)]
    pub config: ConnectionConfig,
}

/// An HTTP relay endpoint that messages can be posted to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTarget {
    pub base: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// What the registry would do for a connection, given the connections declared before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanAction {
    /// Nothing registered under this key yet.
    Build,
    /// Shares the session of the named connection.
    Reuse(String),
    /// Same remote as the named connection, different parameters. The named connection's session would be ended.
    Supersede(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionPlan {
    pub name: String,
    pub key: IdentityKey,
    pub action: PlanAction,
}

/// The on-disk configuration: named connections and relay targets.
///
/// ```yaml
/// connections:
///   - name: office
///     server: wss://node-a.example
///     secret: s3cret
///     local_host: localhost
///     local_port: 3000
/// relays:
///   gateway:
///     base: https://gw.example/
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub connections: Vec<NamedConnection>,
    #[serde(default)]
    pub relays: HashMap<String, RelayTarget>,
}

impl BridgeConfig {
    pub fn try_load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let path = path.map(|p| p.as_ref().to_path_buf()).unwrap_or_else(default_config_path);
        debug!("Loading configuration from {}", path.display());
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config = serde_yml::from_reader(reader)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yml::to_writer(writer, self)?;
        debug!("Saved {} connection(s) to {}", self.connections.len(), path.display());
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, ConfigError> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.config)
            .ok_or_else(|| ConfigError::UnknownConnection(name.to_string()))
    }

    pub fn relay(&self, name: &str) -> Result<&RelayTarget, ConfigError> {
        self.relays.get(name).ok_or_else(|| ConfigError::UnknownRelay(name.to_string()))
    }

    /// Replays the registry's reuse/supersede decision over the connections in declaration order.
    pub fn plan(&self) -> Vec<ConnectionPlan> {
        let mut current: HashMap<IdentityKey, &NamedConnection> = HashMap::new();
        let mut plans = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            let key = conn.config.identity_key();
            let action = match current.get(&key) {
                Some(existing) if existing.config == conn.config => PlanAction::Reuse(existing.name.clone()),
                Some(existing) => PlanAction::Supersede(existing.name.clone()),
                None => PlanAction::Build,
            };
            if !matches!(action, PlanAction::Reuse(_)) {
                current.insert(key.clone(), conn);
            }
            plans.push(ConnectionPlan { name: conn.name.clone(), key, action });
        }
        plans
    }
}

pub fn default_config_path() -> PathBuf {
    let mut home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".hsync");
    home.push("config.yml");
    home
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn named(name: &str, server: &str, secret: &str, port: u16) -> NamedConnection {
        NamedConnection {
            name: name.to_string(),
            config: ConnectionConfig::new(server, secret).with_local("localhost", port),
        }
    }

    #[test]
    fn equality_uses_the_identity_key() {
        let a = ConnectionConfig::new("wss://Node-A.example/", "s");
        let b = ConnectionConfig::new("wss://node-a.example", "s");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_local("localhost", 4000));
        assert_ne!(a, ConnectionConfig::new("wss://node-a.example", "other"));
        assert_ne!(a, ConnectionConfig::new("wss://node-a.example", "s").with_local("127.0.0.1", 3000));
    }

    #[test]
    fn plan_follows_declaration_order() {
        let config = BridgeConfig {
            connections: vec![
                named("first", "wss://node-a.example", "s", 3000),
                named("second", "wss://NODE-A.example/", "s", 3000),
                named("third", "wss://node-a.example", "s", 3001),
                named("fourth", "wss://node-b.example", "s", 3000),
            ],
            relays: HashMap::new(),
        };
        let plan = config.plan();
        assert_eq!(plan[0].action, PlanAction::Build);
        assert_eq!(plan[1].action, PlanAction::Reuse("first".into()));
        assert_eq!(plan[2].action, PlanAction::Supersede("first".into()));
        assert_eq!(plan[3].action, PlanAction::Build);
        assert_eq!(plan[3].key.as_str(), "node-b.example");
    }

    #[test]
    fn save_and_load() {
        env_logger::try_init().ok();
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("config.yml");
        let mut config = BridgeConfig::default();
        config.connections.push(named("office", "wss://node-a.example", "s3cret", 3000));
        config.relays.insert("gateway".into(), RelayTarget { base: "https://gw.example/".into(), topic: None });
        config.save(&path).expect("save config");
        let loaded = BridgeConfig::try_load(Some(&path)).expect("load config");
        assert_eq!(loaded.connection("office").expect("office"), config.connection("office").expect("office"));
        assert_eq!(loaded.connection("office").expect("office").secret.expose(), "s3cret");
        assert_eq!(loaded.relay("gateway").expect("gateway").base, "https://gw.example/");
        assert!(matches!(loaded.relay("nope"), Err(ConfigError::UnknownRelay(_))));
    }

    #[test]
    fn local_bind_defaults() {
        let yaml = "connections:\n  - name: a\n    server: wss://node-a.example\n    secret: x\n";
        let config: BridgeConfig = serde_yml::from_str(yaml).expect("parse");
        let conn = config.connection("a").expect("a");
        assert_eq!(conn.local_host, DEFAULT_LOCAL_HOST);
        assert_eq!(conn.local_port, DEFAULT_LOCAL_PORT);
        assert!(config.relays.is_empty());
    }
}
