//! Static cluster address table.
//!
//! Loaded once at start-up and immutable afterwards. Two layouts are
//! accepted: a TOML cluster file and the flat `TOTAL_NODES` /
//! `NODE_<i>_IP` / `NODE_<i>_PORT` variable layout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cluster file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cluster has no nodes")]
    Empty,
    #[error("node id must be a positive integer, got {0}")]
    InvalidNodeId(i64),
    #[error("node {0} is listed more than once")]
    DuplicateNode(NodeId),
    #[error("node {0} has an empty host")]
    EmptyHost(NodeId),
    #[error("node {id} has invalid port {port}")]
    InvalidPort { id: NodeId, port: i64 },
    #[error("node {0} is not in the address table")]
    MissingNode(NodeId),
    #[error("missing variable {0}")]
    MissingVar(String),
    #[error("variable {name} has invalid value `{value}`")]
    InvalidVar { name: String, value: String },
}

/// Where a peer listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// `host:port`, ready for a socket connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct ClusterFile {
    acquire_timeout_ms: Option<u64>,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Deserialize)]
struct RawNode {
    id: i64,
    host: String,
    port: i64,
}

/// Immutable `NodeId -> (host, port)` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTable {
    nodes: BTreeMap<NodeId, NodeAddress>,
    acquire_timeout: Option<Duration>,
}

impl AddressTable {
    pub fn new(nodes: impl IntoIterator<Item = NodeAddress>) -> Result<Self, ConfigError> {
        let mut table = BTreeMap::new();
        for node in nodes {
            if node.host.trim().is_empty() {
                return Err(ConfigError::EmptyHost(node.id));
            }
            if node.port == 0 {
                return Err(ConfigError::InvalidPort {
                    id: node.id,
                    port: 0,
                });
            }
            if table.insert(node.id, node.clone()).is_some() {
                return Err(ConfigError::DuplicateNode(node.id));
            }
        }
        if table.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(Self {
            nodes: table,
            acquire_timeout: None,
        })
    }

    /// Read and validate a TOML cluster file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ClusterFile = toml::from_str(text)?;
        let nodes = file
            .nodes
            .into_iter()
            .map(|raw| validate_node(raw.id, raw.host, raw.port))
            .collect::<Result<Vec<_>, _>>()?;
        let mut table = Self::new(nodes)?;
        table.acquire_timeout = file.acquire_timeout_ms.map(Duration::from_millis);
        Ok(table)
    }

    /// Build from the flat variable layout:
    ///
    /// ```text
    /// TOTAL_NODES=3
    /// NODE_1_IP=127.0.0.1
    /// NODE_1_PORT=7001
    /// ...
    /// ```
    ///
    /// `TIMEOUT` (milliseconds) is optional. Unrelated variables are ignored.
    pub fn from_env_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let total: i64 = parse_var(&vars, "TOTAL_NODES")?;
        if total <= 0 {
            return Err(ConfigError::InvalidVar {
                name: "TOTAL_NODES".to_string(),
                value: total.to_string(),
            });
        }

        let mut nodes = Vec::new();
        for i in 1..=total {
            let host_var = format!("NODE_{i}_IP");
            let host = vars
                .get(&host_var)
                .cloned()
                .ok_or(ConfigError::MissingVar(host_var))?;
            let port = parse_var(&vars, &format!("NODE_{i}_PORT"))?;
            nodes.push(validate_node(i, host, port)?);
        }

        let mut table = Self::new(nodes)?;
        if vars.contains_key("TIMEOUT") {
            let millis: u64 = parse_var(&vars, "TIMEOUT")?;
            table.acquire_timeout = Some(Duration::from_millis(millis));
        }
        Ok(table)
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn get(&self, id: NodeId) -> Result<&NodeAddress, ConfigError> {
        self.nodes.get(&id).ok_or(ConfigError::MissingNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Every id except `id`, ascending.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.ids().filter(|peer| *peer != id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Default deadline for acquiring the critical section, if configured.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }
}

fn validate_node(id: i64, host: String, port: i64) -> Result<NodeAddress, ConfigError> {
    let id = u32::try_from(id)
        .ok()
        .and_then(NodeId::new)
        .ok_or(ConfigError::InvalidNodeId(id))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::InvalidPort { id, port })?;
    Ok(NodeAddress { id, host, port })
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<T, ConfigError> {
    let value = vars
        .get(name)
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))?;
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name: name.to_string(),
        value: value.clone(),
    })
}
