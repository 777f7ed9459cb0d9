//! Response assembly.
//!
//! Every response is produced in full before the first byte is sent;
//! [`ResponseBuf`] then lets the reactor drain it across partial
//! writes without re-allocating.

use std::path::Path;
use std::time::SystemTime;

use crate::config::{ReturnDirective, ServerConfig};
use crate::fsutil;
use crate::prelude::SERVER_SOFTWARE;

/// Outgoing byte buffer with a front-consume cursor.
#[derive(Debug, Default)]
pub struct ResponseBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl ResponseBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bytes: Vec<u8>) {
        self.buf = bytes;
        self.pos = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn http_date() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

/// Core writer: status line, the fixed server headers, any extras,
/// then the body. Header order matches the rest of the responses the
/// server emits.
pub fn build(
    code: u16,
    content_type: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", code, status_text(code)).as_bytes());
    out.extend_from_slice(format!("Server: {}\r\n", SERVER_SOFTWARE).as_bytes());
    out.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
    if let Some(ct) = content_type {
        out.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(
        format!(
            "Connection: {}\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        )
        .as_bytes(),
    );
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

pub fn static_file(path: &Path, body: &[u8], keep_alive: bool) -> Vec<u8> {
    build(200, Some(fsutil::mime_type(path)), &[], body, keep_alive)
}

fn stub_body(code: u16) -> String {
    let text = status_text(code);
    format!(
        "<html>\n<head><title>{code} {text}</title></head>\n<body>\n\
         <center><h1>{code} {text}</h1></center>\n\
         <hr><center>{SERVER_SOFTWARE}</center>\n</body>\n</html>\n"
    )
}

/// Error response: the configured error page for `code` if the matched
/// server maps one and the file is readable, a canned HTML stub
/// otherwise.
pub fn error_response(code: u16, server: Option<&ServerConfig>, keep_alive: bool) -> Vec<u8> {
    if let Some(server) = server {
        if let Some(page) = server.error_pages.get(&code) {
            if let Some(path) = fsutil::resolve_path(&server.root, page) {
                if let Ok(body) = std::fs::read(&path) {
                    return build(code, Some("text/html"), &[], &body, keep_alive);
                }
            }
        }
    }
    build(
        code,
        Some("text/html"),
        &[],
        stub_body(code).as_bytes(),
        keep_alive,
    )
}

/// Return-directive response. Redirect codes carry an HTML stub and a
/// `Location` header; any other code answers with the literal text
/// (surrounding quotes stripped) as an octet-stream.
pub fn return_directive(directive: &ReturnDirective, keep_alive: bool) -> Vec<u8> {
    let code = directive.code;
    if matches!(code, 301 | 302 | 303 | 307 | 308) {
        build(
            code,
            Some("text/html"),
            &[("Location", directive.target.as_str())],
            stub_body(code).as_bytes(),
            keep_alive,
        )
    } else {
        let text = directive
            .target
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(&directive.target);
        build(
            code,
            Some("application/octet-stream"),
            &[],
            text.as_bytes(),
            keep_alive,
        )
    }
}

/// 301 to the trailing-slash form of a directory target.
pub fn redirect_to_directory(host: &str, target: &str, keep_alive: bool) -> Vec<u8> {
    let location = format!("http://{}{}/", host, target.trim_end_matches('/'));
    build(
        301,
        Some("text/html"),
        &[("Location", location.as_str())],
        stub_body(301).as_bytes(),
        keep_alive,
    )
}

pub fn autoindex(listing: &str, keep_alive: bool) -> Vec<u8> {
    build(200, Some("text/html"), &[], listing.as_bytes(), keep_alive)
}
