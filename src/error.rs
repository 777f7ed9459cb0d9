use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::AddrParseError;

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Yaml(serde_yaml::Error),
    Addr(AddrParseError),
    Config(String),
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "io error: {}", e),
            ServerError::Yaml(e) => write!(f, "config file error: {}", e),
            ServerError::Addr(e) => write!(f, "invalid listen address: {}", e),
            ServerError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Yaml(e) => Some(e),
            ServerError::Addr(e) => Some(e),
            ServerError::Config(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<serde_yaml::Error> for ServerError {
    fn from(e: serde_yaml::Error) -> Self {
        ServerError::Yaml(e)
    }
}

impl From<AddrParseError> for ServerError {
    fn from(e: AddrParseError) -> Self {
        ServerError::Addr(e)
    }
}

impl From<String> for ServerError {
    fn from(msg: String) -> Self {
        ServerError::Config(msg)
    }
}

impl From<&str> for ServerError {
    fn from(msg: &str) -> Self {
        ServerError::Config(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
