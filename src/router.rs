//! Virtual-host resolution and longest-prefix location matching.

use std::collections::HashMap;

use crate::config::{AppConfig, ServerConfig};
use crate::error::{Result, ServerError};

pub const WILDCARD_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_NAME: &str = "";

/// Key a request resolves against: the listening endpoint plus the
/// requested host name (empty string marks the endpoint's default
/// server).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub port: u16,
    pub host: String,
    pub name: String,
}

impl ServerKey {
    pub fn new(port: u16, host: &str, name: &str) -> Self {
        Self {
            port,
            host: host.to_string(),
            name: name.to_string(),
        }
    }
}

/// Maps server keys to indices into `AppConfig::servers`. First server
/// registered for an endpoint becomes its default server.
#[derive(Debug, Default)]
pub struct VirtualHosts {
    map: HashMap<ServerKey, usize>,
}

impl VirtualHosts {
    pub fn build(config: &AppConfig) -> Result<Self> {
        let mut map = HashMap::new();
        for (idx, server) in config.servers.iter().enumerate() {
            for (host, port) in server.endpoints()? {
                for name in &server.server_names {
                    map.entry(ServerKey::new(port, &host, name)).or_insert(idx);
                }
                map.entry(ServerKey::new(port, &host, DEFAULT_SERVER_NAME))
                    .or_insert(idx);
            }
        }
        Ok(Self { map })
    }

    /// Four-step lookup: exact (port, ip, host), then the endpoint's
    /// default server, then the wildcard address with the host, then
    /// the wildcard default. First hit wins.
    pub fn resolve(&self, port: u16, local_host: &str, host_name: &str) -> Option<usize> {
        let candidates = [
            ServerKey::new(port, local_host, host_name),
            ServerKey::new(port, local_host, DEFAULT_SERVER_NAME),
            ServerKey::new(port, WILDCARD_HOST, host_name),
            ServerKey::new(port, WILDCARD_HOST, DEFAULT_SERVER_NAME),
        ];
        candidates
            .iter()
            .find_map(|key| self.map.get(key).copied())
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    location: Option<usize>,
}

/// Character trie over one server's location paths. Lookup walks the
/// request target byte by byte, remembering the deepest marked node,
/// and allocates nothing.
#[derive(Debug, Default)]
pub struct LocationTrie {
    root: TrieNode,
}

impl LocationTrie {
    pub fn build(server: &ServerConfig) -> Result<Self> {
        let mut trie = LocationTrie::default();
        for (idx, location) in server.locations.iter().enumerate() {
            trie.insert(&location.path, idx)?;
        }
        Ok(trie)
    }

    pub fn insert(&mut self, path: &str, location: usize) -> Result<()> {
        let mut node = &mut self.root;
        for &byte in path.as_bytes() {
            node = node.children.entry(byte).or_default();
        }
        if node.location.is_some() {
            return Err(ServerError::Config(format!(
                "duplicate location path: {}",
                path
            )));
        }
        node.location = Some(location);
        Ok(())
    }

    /// Index of the location whose path is the longest prefix of `uri`.
    pub fn longest_prefix(&self, uri: &str) -> Option<usize> {
        let mut node = &self.root;
        let mut best = node.location;
        for &byte in uri.as_bytes() {
            match node.children.get(&byte) {
                Some(child) => {
                    node = child;
                    if node.location.is_some() {
                        best = node.location;
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// Routing tables derived from the frozen configuration: one virtual
/// host map plus one location trie per server block.
#[derive(Debug)]
pub struct Router {
    pub vhosts: VirtualHosts,
    pub tries: Vec<LocationTrie>,
}

impl Router {
    pub fn build(config: &AppConfig) -> Result<Self> {
        let vhosts = VirtualHosts::build(config)?;
        let mut tries = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            tries.push(LocationTrie::build(server)?);
        }
        Ok(Self { vhosts, tries })
    }
}
