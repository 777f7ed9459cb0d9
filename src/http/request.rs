//! Incremental HTTP/1.1 request parser.
//!
//! A byte-driven state machine: every state is one variant of
//! [`ParseState`] with one handler method, and every malformed byte
//! moves the machine into the error sink carrying the HTTP status code
//! the caller should answer with. Input may arrive in arbitrarily
//! small fragments; `feed` picks up exactly where the previous call
//! stopped.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    pub fn is_allowed(&self, allowed: &[String]) -> bool {
        allowed.iter().any(|m| m == self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse parser state visible to the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    InProgress,
    Done,
    CgiProcessing,
    Error(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    // request line
    Start,
    Restart,
    Method,
    SpBeforeUri,
    Uri,
    Query,
    Fragment,
    SpBeforeVersion,
    Version,
    RequestLineEnd,
    // headers
    HeaderName,
    HeaderColon,
    HeaderValue,
    HeaderCr,
    HeaderLf,
    HeaderEnd,
    // chunked body
    Hex,
    HexEnd,
    Chunk,
    ChunkEnd,
    BodyLf,
    MessageEnd,
    // content-length body
    Body,
    // terminal
    Done,
    Error,
}

const MAX_METHOD_LEN: usize = 7;
const MAX_VERSION_LEN: usize = 8;
const MAX_HEX_DIGITS: usize = 8;

type Step = Result<(), u16>;

#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    error: Option<u16>,
    cgi_processing: bool,

    method: Method,
    method_buf: String,
    target: String,
    query: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    keep_alive: bool,

    cur_name: String,
    cur_value: String,
    header_len: usize,
    expected_body_len: usize,
    is_chunked: bool,
    chunk_size_line: String,
    chunk_size: usize,
    chunk_read: usize,

    max_header: usize,
    max_body: usize,
}

impl RequestParser {
    pub fn new(max_header: usize, max_body: usize) -> Self {
        Self {
            state: ParseState::Start,
            error: None,
            cgi_processing: false,
            method: Method::Get,
            method_buf: String::new(),
            target: String::new(),
            query: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            keep_alive: true,
            cur_name: String::new(),
            cur_value: String::new(),
            header_len: 0,
            expected_body_len: 0,
            is_chunked: false,
            chunk_size_line: String::new(),
            chunk_size: 0,
            chunk_read: 0,
            max_header,
            max_body,
        }
    }

    /// Feeds bytes into the machine and returns how many were
    /// consumed. Consumption stops at the terminal states so the
    /// caller can hold on to bytes belonging to a later request.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        for &byte in data {
            if matches!(self.state, ParseState::Done | ParseState::Error) {
                break;
            }
            if let Err(code) = self.step(byte) {
                self.state = ParseState::Error;
                self.error = Some(code);
                consumed += 1;
                break;
            }
            consumed += 1;
        }
        consumed
    }

    pub fn state(&self) -> RequestState {
        match self.state {
            ParseState::Error => RequestState::Error(self.error.unwrap_or(400)),
            ParseState::Done if self.cgi_processing => RequestState::CgiProcessing,
            ParseState::Done => RequestState::Done,
            _ => RequestState::InProgress,
        }
    }

    /// Marks the completed request as handed over to a CGI child.
    pub fn set_cgi_processing(&mut self) {
        self.cgi_processing = true;
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Raw Host header value; empty if the request never completed.
    pub fn host_name(&self) -> &str {
        self.header("host").unwrap_or("")
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn step(&mut self, c: u8) -> Step {
        if self.counts_toward_header(self.state) {
            self.header_len += 1;
            if self.header_len > self.max_header {
                return Err(413);
            }
        }
        match self.state {
            ParseState::Start => self.parse_start(c),
            ParseState::Restart => self.parse_restart(c),
            ParseState::Method => self.parse_method(c),
            ParseState::SpBeforeUri => self.parse_sp_before_uri(c),
            ParseState::Uri => self.parse_uri(c),
            ParseState::Query => self.parse_query(c),
            ParseState::Fragment => self.parse_fragment(c),
            ParseState::SpBeforeVersion => self.parse_sp_before_version(c),
            ParseState::Version => self.parse_version(c),
            ParseState::RequestLineEnd => self.parse_request_line_end(c),
            ParseState::HeaderName => self.parse_header_name(c),
            ParseState::HeaderColon => self.parse_header_colon(c),
            ParseState::HeaderValue => self.parse_header_value(c),
            ParseState::HeaderCr => self.parse_header_cr(c),
            ParseState::HeaderLf => self.parse_header_lf(c),
            ParseState::HeaderEnd => self.parse_header_end(c),
            ParseState::Hex => self.parse_hex(c),
            ParseState::HexEnd => self.parse_hex_end(c),
            ParseState::Chunk => self.parse_chunk(c),
            ParseState::ChunkEnd => self.parse_chunk_end(c),
            ParseState::BodyLf => self.parse_body_lf(c),
            ParseState::MessageEnd => self.parse_message_end(c),
            ParseState::Body => self.parse_body(c),
            ParseState::Done | ParseState::Error => Ok(()),
        }
    }

    fn counts_toward_header(&self, state: ParseState) -> bool {
        matches!(
            state,
            ParseState::Start
                | ParseState::Method
                | ParseState::SpBeforeUri
                | ParseState::Uri
                | ParseState::Query
                | ParseState::Fragment
                | ParseState::SpBeforeVersion
                | ParseState::Version
                | ParseState::RequestLineEnd
                | ParseState::HeaderName
                | ParseState::HeaderColon
                | ParseState::HeaderValue
                | ParseState::HeaderCr
                | ParseState::HeaderLf
                | ParseState::HeaderEnd
        )
    }

    fn parse_start(&mut self, c: u8) -> Step {
        match c {
            // tolerate one leading CRLF before the request line
            b'\r' => {
                self.state = ParseState::Restart;
                Ok(())
            }
            b'A'..=b'Z' => {
                self.method_buf.push(c as char);
                self.state = ParseState::Method;
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_restart(&mut self, c: u8) -> Step {
        if c == b'\n' {
            self.state = ParseState::Start;
            return Ok(());
        }
        Err(400)
    }

    fn parse_method(&mut self, c: u8) -> Step {
        match c {
            b' ' => {
                self.method = Method::from_str(&self.method_buf).map_err(|_| 405u16)?;
                self.state = ParseState::SpBeforeUri;
                Ok(())
            }
            b'A'..=b'Z' if self.method_buf.len() < MAX_METHOD_LEN => {
                self.method_buf.push(c as char);
                Ok(())
            }
            _ => Err(405),
        }
    }

    fn parse_sp_before_uri(&mut self, c: u8) -> Step {
        match c {
            b' ' => Ok(()),
            b'/' => {
                self.target.push('/');
                self.state = ParseState::Uri;
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_uri(&mut self, c: u8) -> Step {
        match c {
            b' ' => {
                self.state = ParseState::SpBeforeVersion;
                Ok(())
            }
            b'?' => {
                self.state = ParseState::Query;
                Ok(())
            }
            b'#' => {
                self.state = ParseState::Fragment;
                Ok(())
            }
            0x21..=0x7e => {
                self.target.push(c as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_query(&mut self, c: u8) -> Step {
        match c {
            b' ' => {
                self.state = ParseState::SpBeforeVersion;
                Ok(())
            }
            b'#' => {
                self.state = ParseState::Fragment;
                Ok(())
            }
            0x21..=0x7e => {
                self.query.push(c as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_fragment(&mut self, c: u8) -> Step {
        // fragments are dropped, the server has no use for them
        match c {
            b' ' => {
                self.state = ParseState::SpBeforeVersion;
                Ok(())
            }
            0x21..=0x7e => Ok(()),
            _ => Err(400),
        }
    }

    fn parse_sp_before_version(&mut self, c: u8) -> Step {
        match c {
            b' ' => Ok(()),
            b'H' => {
                self.version.push('H');
                self.state = ParseState::Version;
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_version(&mut self, c: u8) -> Step {
        if c == b'\r' {
            if self.version == "HTTP/1.1" {
                self.state = ParseState::RequestLineEnd;
                return Ok(());
            }
            // a well-formed HTTP/x.y that is not 1.1 is unsupported,
            // anything else is malformed
            let v = self.version.as_bytes();
            if v.len() == MAX_VERSION_LEN
                && self.version.starts_with("HTTP/")
                && v[5].is_ascii_digit()
                && v[6] == b'.'
                && v[7].is_ascii_digit()
            {
                return Err(505);
            }
            return Err(400);
        }
        if self.version.len() >= MAX_VERSION_LEN {
            return Err(400);
        }
        match c {
            b'A'..=b'Z' | b'0'..=b'9' | b'/' | b'.' => {
                self.version.push(c as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_request_line_end(&mut self, c: u8) -> Step {
        if c == b'\n' {
            self.state = ParseState::HeaderName;
            return Ok(());
        }
        Err(400)
    }

    fn parse_header_name(&mut self, c: u8) -> Step {
        match c {
            b':' => {
                if self.cur_name.is_empty() {
                    return Err(400);
                }
                self.state = ParseState::HeaderColon;
                Ok(())
            }
            // a request without any header line at all
            b'\r' if self.cur_name.is_empty() => {
                if !self.headers.contains_key("host") {
                    return Err(400);
                }
                self.state = ParseState::HeaderEnd;
                Ok(())
            }
            _ if is_token_char(c) => {
                self.cur_name.push(c.to_ascii_lowercase() as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_header_colon(&mut self, c: u8) -> Step {
        match c {
            b' ' | b'\t' => Ok(()),
            0x21..=0x7e => {
                self.cur_value.push(c as char);
                self.state = ParseState::HeaderValue;
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_header_value(&mut self, c: u8) -> Step {
        match c {
            b'\r' => {
                self.commit_header()?;
                self.state = ParseState::HeaderCr;
                Ok(())
            }
            0x20..=0x7e => {
                self.cur_value.push(c as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_header_cr(&mut self, c: u8) -> Step {
        if c == b'\n' {
            self.state = ParseState::HeaderLf;
            return Ok(());
        }
        Err(400)
    }

    fn parse_header_lf(&mut self, c: u8) -> Step {
        match c {
            b'\r' => {
                if !self.headers.contains_key("host") {
                    return Err(400);
                }
                self.state = ParseState::HeaderEnd;
                Ok(())
            }
            _ if is_token_char(c) => {
                self.cur_name.push(c.to_ascii_lowercase() as char);
                self.state = ParseState::HeaderName;
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_header_end(&mut self, c: u8) -> Step {
        if c != b'\n' {
            return Err(400);
        }
        self.decide_body_framing()
    }

    /// Runs once at the header terminator and picks the body framing.
    fn decide_body_framing(&mut self) -> Step {
        let has_te = self.headers.contains_key("transfer-encoding");
        let content_length = self.headers.get("content-length");

        if has_te && content_length.is_some() {
            // ambiguous framing, reject outright
            return Err(400);
        }
        if self.is_chunked {
            self.state = ParseState::Hex;
            return Ok(());
        }
        if has_te {
            // some transfer coding we cannot delimit
            return Err(411);
        }
        match content_length {
            Some(value) => {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(400);
                }
                let n: usize = value.parse().map_err(|_| 413u16)?;
                if n > self.max_body {
                    return Err(413);
                }
                if n == 0 {
                    self.state = ParseState::Done;
                } else {
                    self.expected_body_len = n;
                    self.state = ParseState::Body;
                }
                Ok(())
            }
            None => {
                self.state = ParseState::Done;
                Ok(())
            }
        }
    }

    fn parse_body(&mut self, c: u8) -> Step {
        self.body.push(c);
        if self.body.len() == self.expected_body_len {
            self.state = ParseState::Done;
        }
        Ok(())
    }

    fn parse_hex(&mut self, c: u8) -> Step {
        match c {
            b'\r' => {
                if self.chunk_size_line.is_empty() {
                    return Err(400);
                }
                self.state = ParseState::HexEnd;
                Ok(())
            }
            _ if c.is_ascii_hexdigit() => {
                if self.chunk_size_line.len() >= MAX_HEX_DIGITS {
                    return Err(413);
                }
                self.chunk_size_line.push(c as char);
                Ok(())
            }
            _ => Err(400),
        }
    }

    fn parse_hex_end(&mut self, c: u8) -> Step {
        if c != b'\n' {
            return Err(400);
        }
        let size = usize::from_str_radix(&self.chunk_size_line, 16).map_err(|_| 400u16)?;
        self.chunk_size_line.clear();
        if size > self.max_body - self.body.len() {
            return Err(413);
        }
        if size == 0 {
            self.state = ParseState::BodyLf;
        } else {
            self.chunk_size = size;
            self.chunk_read = 0;
            self.state = ParseState::Chunk;
        }
        Ok(())
    }

    fn parse_chunk(&mut self, c: u8) -> Step {
        if self.chunk_read < self.chunk_size {
            self.body.push(c);
            self.chunk_read += 1;
            return Ok(());
        }
        if c == b'\r' {
            self.state = ParseState::ChunkEnd;
            return Ok(());
        }
        Err(400)
    }

    fn parse_chunk_end(&mut self, c: u8) -> Step {
        if c == b'\n' {
            self.state = ParseState::Hex;
            return Ok(());
        }
        Err(400)
    }

    fn parse_body_lf(&mut self, c: u8) -> Step {
        // only the bare final CRLF is accepted here; a trailer section
        // is rejected
        if c == b'\r' {
            self.state = ParseState::MessageEnd;
            return Ok(());
        }
        Err(400)
    }

    fn parse_message_end(&mut self, c: u8) -> Step {
        if c == b'\n' {
            self.state = ParseState::Done;
            return Ok(());
        }
        Err(400)
    }

    fn commit_header(&mut self) -> Step {
        let name = mem::take(&mut self.cur_name);
        let mut value = mem::take(&mut self.cur_value);
        while value.ends_with(' ') || value.ends_with('\t') {
            value.pop();
        }
        if name == "host" && self.headers.contains_key("host") {
            return Err(400);
        }
        if name == "transfer-encoding" {
            if value.split(',').any(|t| t.trim() == "chunked") {
                self.is_chunked = true;
            }
            self.headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        } else if name == "connection" {
            if value == "keep-alive" {
                self.keep_alive = true;
                self.headers.insert(name, value);
            } else if value == "close" {
                self.keep_alive = false;
                self.headers.insert(name, value);
            }
            // any other connection option is ignored
        } else {
            self.headers.insert(name, value);
        }
        Ok(())
    }
}

/// RFC 9110 token characters, the only bytes legal in a header name.
fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
