//! Per-client connection state.
//!
//! A connection owns its socket, its parser and its response buffer,
//! and is mutated only by the reactor. One request is handled at a
//! time: reading stops the moment a request completes and parsing of
//! the next one only starts after `reset`.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::cgi::{CgiContext, CgiSession};
use crate::config::{AppConfig, RouteScope};
use crate::fsutil;
use crate::http::request::{Method, RequestParser, RequestState};
use crate::http::response::{self, ResponseBuf};
use crate::prelude::*;
use crate::router::Router;

/// What the reactor should do after feeding a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// Peer hung up or the transport failed: close without a response.
    Closed,
    /// A full response is buffered: switch interest to OUT.
    ResponseReady,
    /// A CGI child was spawned: move the multiplexing to its pipes.
    CgiStarted,
    /// The request is still incomplete.
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Closed,
    Drained,
    Blocked,
}

#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub local_host: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub parser: RequestParser,
    pub response: ResponseBuf,
    pub cgi: Option<CgiSession>,
    pub keep_alive: bool,
    pub last_activity: Instant,
    pub server_idx: Option<usize>,
    pub location_idx: Option<usize>,
    /// Bytes received past the end of the current request; re-fed
    /// after `reset`.
    pending: Vec<u8>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        local_host: String,
        local_port: u16,
        remote_addr: String,
        config: &AppConfig,
    ) -> Self {
        Self {
            stream,
            local_host,
            local_port,
            remote_addr,
            parser: RequestParser::new(
                config.client_header_buffer_size,
                config.client_max_body_size,
            ),
            response: ResponseBuf::new(),
            cgi: None,
            keep_alive: true,
            last_activity: Instant::now(),
            server_idx: None,
            location_idx: None,
            pending: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Drains the socket into the parser until WouldBlock, EOF or a
    /// completed request.
    pub fn handle_readable(&mut self, config: &AppConfig, router: &Router) -> ConnEvent {
        if self.parser.state() != RequestState::InProgress {
            return ConnEvent::NeedMore;
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return ConnEvent::Closed,
                Ok(n) => {
                    self.touch();
                    if let Some(event) = self.advance(&buf[..n], config, router) {
                        return event;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ConnEvent::NeedMore,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return ConnEvent::Closed,
            }
        }
    }

    /// Replays bytes that arrived past the previous request. Called
    /// after `reset`.
    pub fn resume(&mut self, config: &AppConfig, router: &Router) -> Option<ConnEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.pending);
        self.advance(&data, config, router)
    }

    fn advance(&mut self, data: &[u8], config: &AppConfig, router: &Router) -> Option<ConnEvent> {
        let used = self.parser.feed(data);
        let event = match self.parser.state() {
            RequestState::InProgress => None,
            RequestState::Done => Some(self.process_request(config, router)),
            RequestState::Error(code) => {
                debug!("request parse error {} from {}", code, self.remote_addr);
                self.fail(code, config);
                Some(ConnEvent::ResponseReady)
            }
            RequestState::CgiProcessing => Some(ConnEvent::CgiStarted),
        };
        if event.is_some() && used < data.len() {
            self.pending.extend_from_slice(&data[used..]);
        }
        event
    }

    /// Flushes the response buffer head until WouldBlock or empty.
    pub fn handle_writable(&mut self) -> WriteResult {
        while !self.response.is_empty() {
            match self.stream.write(self.response.as_slice()) {
                Ok(0) => return WriteResult::Closed,
                Ok(n) => {
                    self.response.consume(n);
                    self.touch();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return WriteResult::Blocked,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return WriteResult::Closed,
            }
        }
        WriteResult::Drained
    }

    /// Back to a pristine request cycle after a keep-alive drain. The
    /// socket and the leftover `pending` bytes survive.
    pub fn reset(&mut self, config: &AppConfig) {
        self.parser = RequestParser::new(
            config.client_header_buffer_size,
            config.client_max_body_size,
        );
        self.response.clear();
        self.cgi = None;
        self.keep_alive = true;
        self.server_idx = None;
        self.location_idx = None;
    }

    /// Any failure ends the keep-alive session; the response is the
    /// configured error page when the matched server has one.
    pub fn fail(&mut self, code: u16, config: &AppConfig) {
        self.keep_alive = false;
        let server = self.server_idx.map(|i| &config.servers[i]);
        self.response.set(response::error_response(code, server, false));
    }

    fn process_request(&mut self, config: &AppConfig, router: &Router) -> ConnEvent {
        self.keep_alive = self.parser.keep_alive();
        let host = self
            .parser
            .host_name()
            .split(':')
            .next()
            .unwrap_or("")
            .to_string();

        let Some(server_idx) = router.vhosts.resolve(self.local_port, &self.local_host, &host)
        else {
            self.fail(HTTP_NOT_FOUND, config);
            return ConnEvent::ResponseReady;
        };
        self.server_idx = Some(server_idx);
        let server = &config.servers[server_idx];
        debug!(
            "{} {} from {} -> server {}",
            self.parser.method(),
            self.parser.target(),
            self.remote_addr,
            server_idx
        );

        if let Some(directive) = &server.return_directive {
            self.response
                .set(response::return_directive(directive, self.keep_alive));
            return ConnEvent::ResponseReady;
        }

        let Some(location_idx) = router.tries[server_idx].longest_prefix(self.parser.target())
        else {
            self.fail(HTTP_NOT_FOUND, config);
            return ConnEvent::ResponseReady;
        };
        self.location_idx = Some(location_idx);
        let scope = RouteScope {
            server,
            location: &server.locations[location_idx],
        };

        if !self.parser.method().is_allowed(scope.allowed_methods()) {
            self.fail(HTTP_METHOD_NOT_ALLOWED, config);
            return ConnEvent::ResponseReady;
        }

        if let Some(directive) = scope.return_directive() {
            self.response
                .set(response::return_directive(directive, self.keep_alive));
            return ConnEvent::ResponseReady;
        }

        self.serve(scope, config)
    }

    fn serve(&mut self, scope: RouteScope<'_>, config: &AppConfig) -> ConnEvent {
        let target = self.parser.target().to_string();
        let Some(mut path) = fsutil::resolve_path(scope.root(), &target) else {
            self.fail(HTTP_FORBIDDEN, config);
            return ConnEvent::ResponseReady;
        };

        if target.ends_with('/') {
            let mut index_file = None;
            for index in scope.index() {
                let candidate = path.join(index);
                if fsutil::is_file(&candidate) {
                    index_file = Some(candidate);
                    break;
                }
            }
            match index_file {
                Some(found) => path = found,
                None => {
                    if scope.autoindex() && fsutil::is_directory(&path) {
                        return match fsutil::autoindex_html(&path, &target) {
                            Ok(listing) => {
                                self.response
                                    .set(response::autoindex(&listing, self.keep_alive));
                                ConnEvent::ResponseReady
                            }
                            Err(e) => {
                                self.fail(fsutil::status_for_io_error(&e), config);
                                ConnEvent::ResponseReady
                            }
                        };
                    }
                    self.fail(HTTP_NOT_FOUND, config);
                    return ConnEvent::ResponseReady;
                }
            }
        } else if fsutil::is_directory(&path) {
            self.response.set(response::redirect_to_directory(
                self.parser.host_name(),
                &target,
                self.keep_alive,
            ));
            return ConnEvent::ResponseReady;
        }

        if let Some(interpreter) = scope.server.cgi_interpreter(&path) {
            let interpreter = interpreter.to_string();
            return self.start_cgi(&interpreter, path, scope.upload_directory(), config);
        }

        match self.parser.method() {
            Method::Delete => self.delete_file(&path, config),
            Method::Post if scope.upload_directory().is_some() => {
                self.store_upload(scope, &target, config)
            }
            _ => self.serve_file(&path, config),
        }
    }

    fn serve_file(&mut self, path: &PathBuf, config: &AppConfig) -> ConnEvent {
        match fs::read(path) {
            Ok(body) => {
                self.response
                    .set(response::static_file(path, &body, self.keep_alive));
            }
            Err(e) => self.fail(fsutil::status_for_io_error(&e), config),
        }
        ConnEvent::ResponseReady
    }

    fn delete_file(&mut self, path: &PathBuf, config: &AppConfig) -> ConnEvent {
        if !fsutil::is_file(path) {
            self.fail(HTTP_NOT_FOUND, config);
            return ConnEvent::ResponseReady;
        }
        match fs::remove_file(path) {
            Ok(()) => {
                info!("deleted {:?}", path);
                self.response
                    .set(response::build(HTTP_NO_CONTENT, None, &[], b"", self.keep_alive));
            }
            Err(e) => self.fail(fsutil::status_for_io_error(&e), config),
        }
        ConnEvent::ResponseReady
    }

    fn store_upload(&mut self, scope: RouteScope<'_>, target: &str, config: &AppConfig) -> ConnEvent {
        let dir = scope.upload_directory().unwrap_or_default();
        let Some(base) = fsutil::resolve_path(scope.root(), dir) else {
            self.fail(HTTP_FORBIDDEN, config);
            return ConnEvent::ResponseReady;
        };
        let name = target
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty() && !n.contains(".."))
            .map(str::to_string)
            .unwrap_or_else(|| {
                let millis = SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("upload_{}", millis)
            });
        let dest = base.join(name);
        match fs::write(&dest, self.parser.body()) {
            Ok(()) => {
                info!("stored upload at {:?}", dest);
                self.response.set(response::build(
                    HTTP_CREATED,
                    Some("text/plain"),
                    &[],
                    b"Created\n",
                    self.keep_alive,
                ));
            }
            Err(e) => self.fail(fsutil::status_for_io_error(&e), config),
        }
        ConnEvent::ResponseReady
    }

    fn start_cgi(
        &mut self,
        interpreter: &str,
        script: PathBuf,
        upload_directory: Option<&str>,
        config: &AppConfig,
    ) -> ConnEvent {
        let ctx = CgiContext {
            server_port: self.local_port,
            remote_addr: &self.remote_addr,
            upload_directory,
        };
        match CgiSession::start(
            &self.parser,
            interpreter,
            &script,
            &ctx,
            config.client_max_body_size,
        ) {
            Ok(session) => {
                self.parser.set_cgi_processing();
                self.cgi = Some(session);
                ConnEvent::CgiStarted
            }
            Err(code) => {
                self.fail(code, config);
                ConnEvent::ResponseReady
            }
        }
    }
}
