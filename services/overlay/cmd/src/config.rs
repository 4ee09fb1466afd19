//! Configuration handling for the overlay node.
//!
//! Settings are read from a YAML file, then overridden by environment
//! variables, then by command line flags (applied in `main`).

use anyhow::{Context, Result};
use reload_router::{RouterConfig, DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_REQUEST_TIMEOUT};
use reload_session::{
    LinkConfig, SessionConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_INITIAL_LINK_TIMEOUT,
    RECEIVE_WINDOW,
};
use reload_wire::{
    NodeId, WireConfig, DEFAULT_INITIAL_TTL, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_NODE_ID_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Overlay node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// This node
    pub node: NodeSection,
    /// Overlay parameters shared by all peers
    pub overlay: OverlaySection,
    /// Link layer
    pub link: LinkSection,
    /// Message router
    pub router: RouterSection,
    /// Static routes
    pub routes: Vec<RouteEntry>,
}

/// Identity and addresses of this node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node id in hex; random when unset
    pub node_id: Option<String>,
    /// Address to accept links on
    pub listen: Option<SocketAddr>,
    /// Peers to dial at startup
    pub bootstrap: Vec<SocketAddr>,
}

/// Overlay-wide parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    /// Overlay name, hashed into every header
    pub name: String,
    /// Length of node ids
    pub node_id_length: usize,
    /// Length of resource ids
    pub resource_id_length: usize,
    /// TTL of messages originated here
    pub initial_ttl: u8,
    /// Largest message accepted
    pub max_message_size: usize,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            name: "reload.example.org".to_string(),
            node_id_length: DEFAULT_NODE_ID_LENGTH,
            resource_id_length: DEFAULT_NODE_ID_LENGTH,
            initial_ttl: DEFAULT_INITIAL_TTL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Link layer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    /// ACK timeout before the first RTT sample (ms)
    pub initial_timeout_ms: u64,
    /// Link handshake timeout (ms)
    pub handshake_timeout_ms: u64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            initial_timeout_ms: DEFAULT_INITIAL_LINK_TIMEOUT.as_millis() as u64,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Message router parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Lifetime of a pending request (ms)
    pub request_timeout_ms: u64,
    /// Handlers allowed to run at once
    pub max_concurrent_handlers: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

/// Static route: reach `destination` through any of `via`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node id in hex
    pub destination: String,
    /// Neighbor node ids in hex
    pub via: Vec<String>,
}

impl RouteEntry {
    /// Parsed destination and next hops
    pub fn parse(&self) -> Result<(NodeId, Vec<NodeId>)> {
        let destination = NodeId::from_hex(&self.destination)
            .with_context(|| format!("invalid route destination {}", self.destination))?;
        let via = self
            .via
            .iter()
            .map(|hop| NodeId::from_hex(hop).with_context(|| format!("invalid route hop {}", hop)))
            .collect::<Result<Vec<_>>>()?;
        Ok((destination, via))
    }
}

impl OverlayConfig {
    /// Load configuration from `path` and the environment. A missing file
    /// leaves the defaults in place.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("invalid config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `RELOAD_*` environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("RELOAD_NODE_ID") {
            info!("Node id overridden by environment: {}", node_id);
            self.node.node_id = Some(node_id);
        }

        if let Ok(listen) = std::env::var("RELOAD_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.node.listen = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid RELOAD_LISTEN value {}", listen),
            }
        }

        if let Ok(name) = std::env::var("RELOAD_OVERLAY") {
            info!("Overlay overridden by environment: {}", name);
            self.overlay.name = name;
        }
    }

    /// Configured node id, or a random one of the overlay's id length
    pub fn node_id(&self) -> Result<NodeId> {
        match &self.node.node_id {
            Some(hex) => {
                let id = NodeId::from_hex(hex).with_context(|| format!("invalid node id {}", hex))?;
                anyhow::ensure!(
                    id.len() == self.overlay.node_id_length,
                    "node id {} is {} bytes, overlay uses {}",
                    hex,
                    id.len(),
                    self.overlay.node_id_length
                );
                Ok(id)
            }
            None => Ok(NodeId::random(self.overlay.node_id_length)),
        }
    }

    /// Codec settings
    pub fn wire_config(&self) -> WireConfig {
        WireConfig {
            node_id_length: self.overlay.node_id_length,
            max_message_size: self.overlay.max_message_size,
        }
    }

    /// Session settings for `local_node_id`
    pub fn session_config(&self, local_node_id: NodeId) -> SessionConfig {
        SessionConfig {
            local_node_id,
            link: LinkConfig {
                initial_timeout: Duration::from_millis(self.link.initial_timeout_ms),
                receive_window: RECEIVE_WINDOW,
            },
            handshake_timeout: Duration::from_millis(self.link.handshake_timeout_ms),
            ..SessionConfig::default()
        }
    }

    /// Router settings
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            request_timeout: Duration::from_millis(self.router.request_timeout_ms),
            max_concurrent_handlers: self.router.max_concurrent_handlers,
            initial_ttl: self.overlay.initial_ttl,
            ..RouterConfig::default()
        }
    }
}
