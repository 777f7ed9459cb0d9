pub use crate::config::{AppConfig, LocationConfig, ReturnDirective, RouteScope, ServerConfig};
pub use crate::error::{Result, ServerError};
pub use crate::http::{Connection, Method, RequestParser, RequestState};
pub use crate::router::{LocationTrie, Router, ServerKey, VirtualHosts};

pub use log::{debug, error, info, trace, warn};
pub use mio::{
    Events, Interest, Poll, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};

pub use std::collections::HashMap;
pub use std::fs::{self, File};
pub use std::io::{self, ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::path::{Path, PathBuf};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub const READ_BUF_SIZE: usize = 4096;

pub const SERVER_SOFTWARE: &str = "webserver/1.0";

// 3xx
pub const HTTP_MOVED_PERMANENTLY: u16 = 301;
pub const HTTP_FOUND: u16 = 302;

// 4xx client errors
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_LENGTH_REQUIRED: u16 = 411;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;

// 5xx server errors
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_BAD_GATEWAY: u16 = 502;
pub const HTTP_VERSION_NOT_SUPPORTED: u16 = 505;

pub const HTTP_OK: u16 = 200;
pub const HTTP_CREATED: u16 = 201;
pub const HTTP_NO_CONTENT: u16 = 204;
