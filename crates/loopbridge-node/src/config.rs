//! Configuration types for loopbridge-node.
//! Parsed from ~/.loopbridge/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;

use loopbridge_enet::ProtocolVersion;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub firewall: FirewallSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Server,
    Client,
    ClientServer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
            Role::ClientServer => "client-server",
        }
    }

    /// Whether this role accepts inbound tunnel streams.
    pub fn listens(&self) -> bool {
        matches!(self, Role::Server | Role::ClientServer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            role: default_role(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionName {
    Compact,
    Extended,
}

impl From<VersionName> for ProtocolVersion {
    fn from(name: VersionName) -> Self {
        match name {
            VersionName::Compact => ProtocolVersion::COMPACT,
            VersionName::Extended => ProtocolVersion::EXTENDED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_game_server_addr")]
    pub game_server_addr: String,
    #[serde(default = "default_client_listen_addr")]
    pub client_listen_addr: String,
    /// Peer id of the server node (client role).
    pub server_peer: Option<String>,
    /// Peer ids of remote participants (server and client-server roles).
    #[serde(default)]
    pub participants: Vec<String>,
    /// Also run a client proxy attached to this node's own server.
    #[serde(default)]
    pub local_client: bool,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: VersionName,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            game_server_addr: default_game_server_addr(),
            client_listen_addr: default_client_listen_addr(),
            server_peer: None,
            participants: Vec::new(),
            local_client: false,
            delay_ms: default_delay_ms(),
            tick_ms: default_tick_ms(),
            protocol_version: default_protocol_version(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallSection {
    #[serde(default)]
    pub enabled: bool,
    /// Base64 Blowfish key the game was launched with.
    pub cipher_key: Option<String>,
}

// Default value functions
fn default_identity_key() -> String {
    "~/.loopbridge/node.key".into()
}
fn default_role() -> Role {
    Role::Client
}
fn default_listen_addr() -> String {
    "0.0.0.0:5119".into()
}
fn default_game_server_addr() -> String {
    "127.0.0.1:5119".into()
}
fn default_client_listen_addr() -> String {
    "127.0.0.1:5120".into()
}
fn default_delay_ms() -> u64 {
    100
}
fn default_tick_ms() -> u64 {
    5
}
fn default_protocol_version() -> VersionName {
    VersionName::Compact
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn role(&self) -> Role {
        self.node.role
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.proxy.protocol_version.into()
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
