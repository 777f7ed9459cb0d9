//! Configuration model consumed by the reactor.
//!
//! The model is deserialized once from a YAML file and frozen for the
//! lifetime of the server. Location directives left unset inherit the
//! server-level value through [`RouteScope`].

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, ServerError};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_INDEX: &str = "index.html";
pub const DEFAULT_CLIENT_TIMEOUT: u64 = 75;
pub const DEFAULT_HEADER_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;

const KNOWN_METHODS: [&str; 3] = ["GET", "POST", "DELETE"];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(
        default = "default_header_buffer_size",
        deserialize_with = "de_size"
    )]
    pub client_header_buffer_size: usize,
    #[serde(default = "default_max_body_size", deserialize_with = "de_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub cgi_bin: HashMap<String, String>,
    #[serde(default, rename = "return")]
    pub return_directive: Option<ReturnDirective>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub path: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub index: Option<Vec<String>>,
    #[serde(default)]
    pub autoindex: Option<bool>,
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    pub upload_directory: Option<String>,
    #[serde(default, rename = "return")]
    pub return_directive: Option<ReturnDirective>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReturnDirective {
    pub code: u16,
    pub target: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            client_header_buffer_size: DEFAULT_HEADER_BUFFER_SIZE,
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            servers: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            server_names: Vec::new(),
            root: DEFAULT_ROOT.to_string(),
            index: default_index(),
            error_pages: HashMap::new(),
            allowed_methods: default_methods(),
            autoindex: false,
            cgi_bin: HashMap::new(),
            return_directive: None,
            locations: Vec::new(),
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            root: None,
            index: None,
            autoindex: None,
            allowed_methods: None,
            upload_directory: None,
            return_directive: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ServerError::Config("no server blocks defined".into()));
        }
        if self.client_header_buffer_size == 0 || self.client_max_body_size == 0 {
            return Err(ServerError::Config("buffer sizes must be non-zero".into()));
        }
        for server in &self.servers {
            if server.listen.is_empty() {
                return Err(ServerError::Config("server has no listen directive".into()));
            }
            server.endpoints()?;
            check_methods(&server.allowed_methods)?;
            let mut seen = Vec::new();
            for location in &server.locations {
                if !location.path.starts_with('/') {
                    return Err(ServerError::Config(format!(
                        "location path must start with '/': {}",
                        location.path
                    )));
                }
                if seen.contains(&location.path.as_str()) {
                    return Err(ServerError::Config(format!(
                        "duplicate location path: {}",
                        location.path
                    )));
                }
                seen.push(&location.path);
                if let Some(methods) = &location.allowed_methods {
                    check_methods(methods)?;
                }
            }
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Parses every `listen` entry into `(host, port)`. Entries take the
    /// form `host:port`, a bare port, or a bare host (port 80).
    pub fn endpoints(&self) -> Result<Vec<(String, u16)>> {
        let mut out = Vec::with_capacity(self.listen.len());
        for entry in &self.listen {
            out.push(parse_listen(entry)?);
        }
        Ok(out)
    }

    /// Interpreter configured for the extension of `path`, if any.
    pub fn cgi_interpreter(&self, path: &Path) -> Option<&str> {
        let ext = path.extension()?.to_str()?;
        self.cgi_bin.get(&format!(".{}", ext)).map(String::as_str)
    }
}

fn parse_listen(entry: &str) -> Result<(String, u16)> {
    if let Some((host, port)) = entry.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid listen port in '{}'", entry)))?;
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok((host.to_string(), port))
    } else if let Ok(port) = entry.parse::<u16>() {
        Ok((DEFAULT_HOST.to_string(), port))
    } else {
        Ok((entry.to_string(), DEFAULT_PORT))
    }
}

fn check_methods(methods: &[String]) -> Result<()> {
    for m in methods {
        if !KNOWN_METHODS.contains(&m.as_str()) {
            return Err(ServerError::Config(format!("unknown method: {}", m)));
        }
    }
    Ok(())
}

/// Effective view of one matched location: unset location directives
/// fall back to the owning server block.
#[derive(Debug, Clone, Copy)]
pub struct RouteScope<'a> {
    pub server: &'a ServerConfig,
    pub location: &'a LocationConfig,
}

impl<'a> RouteScope<'a> {
    pub fn root(&self) -> &'a str {
        self.location.root.as_deref().unwrap_or(&self.server.root)
    }

    pub fn index(&self) -> &'a [String] {
        self.location.index.as_deref().unwrap_or(&self.server.index)
    }

    pub fn autoindex(&self) -> bool {
        self.location.autoindex.unwrap_or(self.server.autoindex)
    }

    pub fn allowed_methods(&self) -> &'a [String] {
        self.location
            .allowed_methods
            .as_deref()
            .unwrap_or(&self.server.allowed_methods)
    }

    pub fn upload_directory(&self) -> Option<&'a str> {
        self.location.upload_directory.as_deref()
    }

    pub fn return_directive(&self) -> Option<&'a ReturnDirective> {
        self.location.return_directive.as_ref()
    }
}

/// Parses a byte size with an optional k/K/m/M suffix, e.g. `2k`, `1M`.
pub fn parse_size(value: &str) -> std::result::Result<usize, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("invalid size: {}", value))?;
    n.checked_mul(factor)
        .ok_or_else(|| format!("size overflow: {}", value))
}

fn de_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeField {
        Num(u64),
        Text(String),
    }

    match SizeField::deserialize(deserializer)? {
        SizeField::Num(n) => Ok(n as usize),
        SizeField::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn default_client_timeout() -> u64 {
    DEFAULT_CLIENT_TIMEOUT
}

fn default_header_buffer_size() -> usize {
    DEFAULT_HEADER_BUFFER_SIZE
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_listen() -> Vec<String> {
    vec![format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT)]
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_index() -> Vec<String> {
    vec![DEFAULT_INDEX.to_string()]
}

fn default_methods() -> Vec<String> {
    KNOWN_METHODS.iter().map(|m| m.to_string()).collect()
}
