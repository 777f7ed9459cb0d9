//! CGI/1.1 gateway sessions.
//!
//! One session owns one child process and the two non-blocking pipe
//! ends the reactor multiplexes. Pipes are Unix socketpairs so they
//! register with mio like any other stream; the child still sees plain
//! stdin/stdout with ordinary EOF semantics.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{debug, warn};
use memchr::memmem;
use mio::net::UnixStream;
use mio::Token;

use crate::http::request::{Method, RequestParser};
use crate::http::response::status_text;
use crate::prelude::{
    HTTP_BAD_GATEWAY, HTTP_FORBIDDEN, HTTP_INTERNAL_SERVER_ERROR, HTTP_NOT_FOUND,
    HTTP_PAYLOAD_TOO_LARGE, READ_BUF_SIZE, SERVER_SOFTWARE,
};

/// Request-side facts the environment builder needs beyond the parsed
/// request itself.
pub struct CgiContext<'a> {
    pub server_port: u16,
    pub remote_addr: &'a str,
    pub upload_directory: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiProgress {
    Complete,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiRead {
    More,
    Blocked,
    Eof,
}

#[derive(Debug)]
pub struct CgiSession {
    child: Option<Child>,
    pub stdin: Option<UnixStream>,
    pub stdout: Option<UnixStream>,
    pub in_token: Option<Token>,
    pub out_token: Option<Token>,
    body: Vec<u8>,
    body_offset: usize,
    raw_out: Vec<u8>,
    max_output: usize,
}

impl CgiSession {
    /// Validates interpreter and script, wires up the pipes and spawns
    /// the child. Failures map to the HTTP status the caller answers
    /// with.
    pub fn start(
        request: &RequestParser,
        interpreter: &str,
        script: &Path,
        ctx: &CgiContext,
        max_output: usize,
    ) -> Result<CgiSession, u16> {
        check_executable(Path::new(interpreter))?;
        check_readable(script)?;

        // child stdout -> server
        let (parent_out, child_out) = StdUnixStream::pair().map_err(|_| 500u16)?;
        parent_out.set_nonblocking(true).map_err(|_| 500u16)?;
        // server -> child stdin
        let (parent_in, child_in) = StdUnixStream::pair().map_err(|_| 500u16)?;
        parent_in.set_nonblocking(true).map_err(|_| 500u16)?;

        let child = Command::new(interpreter)
            .arg(script)
            .env_clear()
            .envs(build_env(request, script, ctx))
            .stdin(Stdio::from(std::os::fd::OwnedFd::from(child_in)))
            .stdout(Stdio::from(std::os::fd::OwnedFd::from(child_out)))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                warn!("cgi spawn failed for {:?}: {}", script, e);
                HTTP_INTERNAL_SERVER_ERROR
            })?;

        debug!("cgi child {} started for {:?}", child.id(), script);

        // only a POST body is proxied; everything else gets immediate EOF
        let body = if request.method() == Method::Post {
            request.body().to_vec()
        } else {
            Vec::new()
        };
        let stdin = if body.is_empty() {
            drop(parent_in);
            None
        } else {
            Some(UnixStream::from_std(parent_in))
        };

        Ok(CgiSession {
            child: Some(child),
            stdin,
            stdout: Some(UnixStream::from_std(parent_out)),
            in_token: None,
            out_token: None,
            body,
            body_offset: 0,
            raw_out: Vec::new(),
            max_output,
        })
    }

    /// Writes the pending body slice. `Complete` means every byte went
    /// out and the write pipe is ready to be closed so the child sees
    /// EOF.
    pub fn write_body(&mut self) -> CgiProgress {
        let Some(stdin) = self.stdin.as_mut() else {
            return CgiProgress::Complete;
        };
        while self.body_offset < self.body.len() {
            match stdin.write(&self.body[self.body_offset..]) {
                Ok(0) => return CgiProgress::Failed,
                Ok(n) => self.body_offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return CgiProgress::Blocked,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // the child stopped reading; its output may still be fine
                Err(e) if e.kind() == ErrorKind::BrokenPipe => break,
                Err(_) => return CgiProgress::Failed,
            }
        }
        CgiProgress::Complete
    }

    /// Drops the write pipe, signalling EOF to the child. The caller
    /// deregisters the stream first.
    pub fn close_stdin(&mut self) -> Option<UnixStream> {
        self.in_token = None;
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<UnixStream> {
        self.out_token = None;
        self.stdout.take()
    }

    /// Drains child output into the capped accumulation buffer.
    pub fn read_output(&mut self) -> Result<CgiRead, u16> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(CgiRead::Eof);
        };
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut got_any = false;
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => return Ok(CgiRead::Eof),
                Ok(n) => {
                    if self.raw_out.len() + n > self.max_output {
                        return Err(HTTP_PAYLOAD_TOO_LARGE);
                    }
                    self.raw_out.extend_from_slice(&buf[..n]);
                    got_any = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(if got_any { CgiRead::More } else { CgiRead::Blocked });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Err(HTTP_INTERNAL_SERVER_ERROR),
            }
        }
    }

    /// Turns the accumulated child output into a complete HTTP/1.1
    /// response. 502 when the output is empty, lacks the header
    /// terminator, or carries no Content-Type.
    pub fn finalize(&mut self, keep_alive: bool) -> Result<Vec<u8>, u16> {
        if self.raw_out.is_empty() {
            return Err(HTTP_BAD_GATEWAY);
        }
        let boundary = memmem::find(&self.raw_out, b"\r\n\r\n").ok_or(HTTP_BAD_GATEWAY)?;
        let (head, rest) = self.raw_out.split_at(boundary);
        let body = &rest[4..];

        let mut code: u16 = 200;
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut has_content_type = false;

        for line in String::from_utf8_lossy(head).split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim_start_matches([' ', '\t']).to_string();
            let lower = name.to_ascii_lowercase();
            match lower.as_str() {
                "status" => {
                    // "Status: 404 Not Found" -> just the digits
                    let digits = value.split_whitespace().next().unwrap_or("");
                    code = digits.parse().unwrap_or(200);
                }
                // recomputed below from the actual body
                "content-length" => {}
                _ => {
                    if lower == "content-type" {
                        has_content_type = true;
                    }
                    headers.push((name.to_string(), value));
                }
            }
        }
        if !has_content_type {
            return Err(HTTP_BAD_GATEWAY);
        }

        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", code, status_text(code)).as_bytes());
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_SOFTWARE).as_bytes());
        out.extend_from_slice(
            format!("Date: {}\r\n", httpdate::fmt_http_date(std::time::SystemTime::now()))
                .as_bytes(),
        );
        for (name, value) in &headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(
            format!(
                "Connection: {}\r\n",
                if keep_alive { "keep-alive" } else { "close" }
            )
            .as_bytes(),
        );
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        Ok(out)
    }

    /// Non-blocking reap after normal completion. Returns the child
    /// back if it has not exited yet.
    pub fn reap(&mut self) -> Option<Child> {
        let mut child = self.child.take()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("cgi child {} exited: {}", child.id(), status);
                None
            }
            Ok(None) => Some(child),
            Err(_) => None,
        }
    }

    /// Abnormal teardown: SIGTERM, then a single non-blocking wait.
    /// A still-running child is handed back for the reactor's zombie
    /// sweep.
    pub fn terminate(&mut self) -> Option<Child> {
        let mut child = self.child.take()?;
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("cgi child {} terminated: {}", child.id(), status);
                None
            }
            Ok(None) => Some(child),
            Err(_) => None,
        }
    }
}

impl Drop for CgiSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            let _ = child.try_wait();
        }
    }
}

fn map_fs_error(err: std::io::Error) -> u16 {
    match err.kind() {
        ErrorKind::NotFound => HTTP_NOT_FOUND,
        ErrorKind::PermissionDenied => HTTP_FORBIDDEN,
        _ => HTTP_INTERNAL_SERVER_ERROR,
    }
}

fn check_executable(path: &Path) -> Result<(), u16> {
    let meta = fs::metadata(path).map_err(map_fs_error)?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(HTTP_FORBIDDEN);
    }
    Ok(())
}

fn check_readable(path: &Path) -> Result<(), u16> {
    fs::File::open(path).map_err(map_fs_error)?;
    Ok(())
}

/// CGI/1.1 environment for the child. Every request header is exported
/// as `HTTP_<NAME>` with hyphens mapped to underscores.
fn build_env(request: &RequestParser, script: &Path, ctx: &CgiContext) -> Vec<(String, String)> {
    let script_path = script.to_string_lossy().into_owned();
    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), request.version().to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("SCRIPT_FILENAME".to_string(), script_path.clone()),
        ("PATH_INFO".to_string(), script_path.clone()),
        ("PATH_TRANSLATED".to_string(), script_path),
        ("SCRIPT_NAME".to_string(), request.target().to_string()),
        ("REQUEST_URI".to_string(), request.target().to_string()),
        ("QUERY_STRING".to_string(), request.query().to_string()),
        ("SERVER_NAME".to_string(), request.host_name().to_string()),
        ("SERVER_PORT".to_string(), ctx.server_port.to_string()),
        ("REMOTE_ADDR".to_string(), ctx.remote_addr.to_string()),
        ("REMOTE_HOST".to_string(), ctx.remote_addr.to_string()),
    ];

    for (name, value) in request.headers() {
        let name = name.to_ascii_uppercase().replace('-', "_");
        env.push((format!("HTTP_{}", name), value.clone()));
    }

    if request.method() == Method::Post {
        env.push((
            "CONTENT_LENGTH".to_string(),
            request.body().len().to_string(),
        ));
        env.push((
            "CONTENT_TYPE".to_string(),
            request.header("content-type").unwrap_or("").to_string(),
        ));
    }

    if let Some(dir) = ctx.upload_directory {
        env.push(("UPLOAD_DIRECTORY".to_string(), dir.to_string()));
    }

    env
}
