//! The event loop.
//!
//! Single-threaded reactor over a mio `Poll`. It owns the listening
//! sockets, the connection table and the pipe index. Connections own
//! their sockets and CGI sessions own their pipes and children; the
//! maps here are routing indexes, not owners. Each iteration blocks on
//! the poll (with a one-second tick so the idle sweep and the run flag
//! are honoured on a quiet socket set), sweeps expired connections,
//! dispatches ready descriptors by role, then reaps dead children.

use std::net::ToSocketAddrs;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Registry;

use crate::cgi::{CgiProgress, CgiRead};
use crate::http::connection::{ConnEvent, WriteResult};
use crate::prelude::*;

const EVENT_CAPACITY: usize = 1024;
const POLL_TICK: Duration = Duration::from_secs(1);
const CHILD_KILL_GRACE: Duration = Duration::from_millis(500);

struct Listener {
    socket: TcpListener,
    host: String,
    port: u16,
}

pub struct Reactor {
    poll: Poll,
    config: Arc<AppConfig>,
    router: Router,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    /// Secondary index: CGI pipe token -> owning connection token.
    pipes: HashMap<Token, Token>,
    /// Children whose connection went away before they could be
    /// reaped. Swept every iteration, SIGKILLed past the grace period.
    zombies: Vec<(Child, Instant)>,
    next_token: usize,
    /// Raised by the signal handler; checked once per iteration.
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(config: AppConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        config.validate()?;
        let router = Router::build(&config)?;
        let poll = Poll::new()?;

        let mut listeners = HashMap::new();
        let mut bound: Vec<(String, u16)> = Vec::new();
        let mut next_token = 0;
        for server in &config.servers {
            for (host, port) in server.endpoints()? {
                if bound.contains(&(host.clone(), port)) {
                    continue;
                }
                let addr = (host.as_str(), port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        ServerError::Config(format!("cannot resolve {}:{}", host, port))
                    })?;
                let mut socket = TcpListener::bind(addr)?;
                let token = Token(next_token);
                next_token += 1;
                poll.registry()
                    .register(&mut socket, token, Interest::READABLE)?;
                info!("listening on {}:{}", host, port);
                bound.push((host.clone(), port));
                listeners.insert(token, Listener { socket, host, port });
            }
        }
        if listeners.is_empty() {
            return Err(ServerError::Config("nothing to listen on".into()));
        }

        Ok(Self {
            poll,
            config: Arc::new(config),
            router,
            listeners,
            connections: HashMap::new(),
            pipes: HashMap::new(),
            zombies: Vec::new(),
            next_token,
            shutdown,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            self.sweep_expired();
            for event in events.iter() {
                self.dispatch(event);
            }
            self.reap_zombies();
        }
        self.shutdown();
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        if self.listeners.contains_key(&token) {
            self.accept_ready(token);
        } else if self.connections.contains_key(&token) {
            self.client_event(token, event);
        } else if self.pipes.contains_key(&token) {
            self.pipe_event(token, event);
        }
        // anything else is a stale event for a descriptor closed
        // earlier in this batch
    }

    fn accept_ready(&mut self, token: Token) {
        loop {
            let listener = match self.listeners.get(&token) {
                Some(l) => l,
                None => return,
            };
            match listener.socket.accept() {
                Ok((mut stream, addr)) => {
                    let conn_token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, conn_token, Interest::READABLE)
                    {
                        warn!("failed to register client socket: {}", e);
                        continue;
                    }
                    info!(
                        "new connection {} -> {}:{}",
                        addr, listener.host, listener.port
                    );
                    let conn = Connection::new(
                        stream,
                        listener.host.clone(),
                        listener.port,
                        addr.ip().to_string(),
                        &self.config,
                    );
                    self.connections.insert(conn_token, conn);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn client_event(&mut self, token: Token, event: &Event) {
        let mut to_close = false;
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let registry = self.poll.registry();

            if event.is_readable() || event.is_read_closed() {
                match conn.handle_readable(&self.config, &self.router) {
                    ConnEvent::Closed => to_close = true,
                    ConnEvent::ResponseReady => {
                        if registry
                            .reregister(&mut conn.stream, token, Interest::WRITABLE)
                            .is_err()
                        {
                            to_close = true;
                        }
                    }
                    ConnEvent::CgiStarted => {
                        if let Err(e) = arm_cgi(
                            registry,
                            &mut self.next_token,
                            &mut self.pipes,
                            conn,
                            token,
                        ) {
                            warn!("failed to arm cgi pipes: {}", e);
                            to_close = true;
                        }
                    }
                    ConnEvent::NeedMore => {}
                }
            }

            if !to_close && event.is_writable() {
                match conn.handle_writable() {
                    WriteResult::Closed => to_close = true,
                    WriteResult::Blocked => {}
                    WriteResult::Drained => {
                        if conn.keep_alive {
                            conn.reset(&self.config);
                            let _ =
                                registry.reregister(&mut conn.stream, token, Interest::READABLE);
                            match conn.resume(&self.config, &self.router) {
                                Some(ConnEvent::ResponseReady) => {
                                    let _ = registry.reregister(
                                        &mut conn.stream,
                                        token,
                                        Interest::WRITABLE,
                                    );
                                }
                                Some(ConnEvent::CgiStarted) => {
                                    if arm_cgi(
                                        registry,
                                        &mut self.next_token,
                                        &mut self.pipes,
                                        conn,
                                        token,
                                    )
                                    .is_err()
                                    {
                                        to_close = true;
                                    }
                                }
                                Some(ConnEvent::Closed) => to_close = true,
                                _ => {}
                            }
                        } else {
                            to_close = true;
                        }
                    }
                }
            }

            if event.is_error() {
                to_close = true;
            }
        }
        if to_close {
            self.close_connection(token);
        }
    }

    fn pipe_event(&mut self, pipe_token: Token, event: &Event) {
        let Some(&conn_token) = self.pipes.get(&pipe_token) else {
            return;
        };
        let mut outcome: Option<std::result::Result<Vec<u8>, u16>> = None;
        {
            let Some(conn) = self.connections.get_mut(&conn_token) else {
                self.pipes.remove(&pipe_token);
                return;
            };
            conn.touch();
            let keep_alive = conn.keep_alive;
            let Some(cgi) = conn.cgi.as_mut() else {
                self.pipes.remove(&pipe_token);
                return;
            };
            let registry = self.poll.registry();

            if (event.is_writable() || event.is_write_closed())
                && cgi.in_token == Some(pipe_token)
            {
                match cgi.write_body() {
                    CgiProgress::Complete => {
                        if let Some(mut stdin) = cgi.close_stdin() {
                            let _ = registry.deregister(&mut stdin);
                        }
                        self.pipes.remove(&pipe_token);
                    }
                    CgiProgress::Blocked => {}
                    CgiProgress::Failed => {
                        warn!("error writing request body to cgi child");
                        outcome = Some(Err(HTTP_INTERNAL_SERVER_ERROR));
                    }
                }
            }

            if outcome.is_none()
                && (event.is_readable() || event.is_read_closed())
                && cgi.out_token == Some(pipe_token)
            {
                match cgi.read_output() {
                    Ok(CgiRead::Eof) => outcome = Some(cgi.finalize(keep_alive)),
                    Ok(CgiRead::More) | Ok(CgiRead::Blocked) => {}
                    Err(code) => outcome = Some(Err(code)),
                }
            }
        }
        if let Some(result) = outcome {
            self.finish_cgi(conn_token, result);
        }
    }

    /// Tears the pipe plumbing down, reaps (or parks) the child, and
    /// arms the client socket for the response write.
    fn finish_cgi(&mut self, conn_token: Token, result: std::result::Result<Vec<u8>, u16>) {
        let mut to_close = false;
        {
            let Some(conn) = self.connections.get_mut(&conn_token) else {
                return;
            };
            let registry = self.poll.registry();
            if let Some(mut cgi) = conn.cgi.take() {
                if let Some(t) = cgi.in_token {
                    self.pipes.remove(&t);
                }
                if let Some(t) = cgi.out_token {
                    self.pipes.remove(&t);
                }
                if let Some(mut stdin) = cgi.close_stdin() {
                    let _ = registry.deregister(&mut stdin);
                }
                if let Some(mut stdout) = cgi.take_stdout() {
                    let _ = registry.deregister(&mut stdout);
                }
                if let Some(child) = cgi.reap() {
                    self.zombies.push((child, Instant::now()));
                }
            }
            match result {
                Ok(bytes) => conn.response.set(bytes),
                Err(code) => conn.fail(code, &self.config),
            }
            conn.touch();
            // the client socket was deregistered when the CGI pipes
            // took over, so this is a fresh registration
            if registry
                .register(&mut conn.stream, conn_token, Interest::WRITABLE)
                .is_err()
            {
                to_close = true;
            }
        }
        if to_close {
            self.close_connection(conn_token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            info!("closing connection from {}", conn.remote_addr);
            let registry = self.poll.registry();
            let _ = registry.deregister(&mut conn.stream);
            if let Some(mut cgi) = conn.cgi.take() {
                if let Some(t) = cgi.in_token {
                    self.pipes.remove(&t);
                }
                if let Some(t) = cgi.out_token {
                    self.pipes.remove(&t);
                }
                if let Some(mut stdin) = cgi.close_stdin() {
                    let _ = registry.deregister(&mut stdin);
                }
                if let Some(mut stdout) = cgi.take_stdout() {
                    let _ = registry.deregister(&mut stdout);
                }
                if let Some(child) = cgi.terminate() {
                    self.zombies.push((child, Instant::now()));
                }
            }
        }
    }

    /// Closes connections idle past `client_timeout`. In-flight
    /// responses are discarded, nothing is written back.
    fn sweep_expired(&mut self) {
        let timeout = Duration::from_secs(self.config.client_timeout);
        let now = Instant::now();
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_activity) > timeout)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            info!("connection timeout");
            self.close_connection(token);
        }
    }

    fn reap_zombies(&mut self) {
        self.zombies.retain_mut(|(child, since)| {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("reaped cgi child {}: {}", child.id(), status);
                    false
                }
                Ok(None) => {
                    if since.elapsed() > CHILD_KILL_GRACE {
                        let _ = child.kill();
                        // picked up on a later sweep if the kill has
                        // not landed yet
                        matches!(child.try_wait(), Ok(None))
                    } else {
                        true
                    }
                }
                Err(_) => false,
            }
        });
    }

    /// Final teardown after the run flag drops: SIGTERM every live
    /// child, give the lot a bounded grace period, SIGKILL stragglers.
    fn shutdown(&mut self) {
        info!("shutting down");
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token);
        }
        let deadline = Instant::now() + CHILD_KILL_GRACE;
        while !self.zombies.is_empty() && Instant::now() < deadline {
            self.zombies
                .retain_mut(|(child, _)| matches!(child.try_wait(), Ok(None)));
            if self.zombies.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        for (child, _) in self.zombies.iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.zombies.clear();
    }
}

/// Moves a connection that just spawned a CGI child from socket
/// multiplexing to pipe multiplexing: the client drops out of the
/// poll set, the pipe ends join it.
fn arm_cgi(
    registry: &Registry,
    next_token: &mut usize,
    pipes: &mut HashMap<Token, Token>,
    conn: &mut Connection,
    conn_token: Token,
) -> io::Result<()> {
    registry.deregister(&mut conn.stream)?;
    let Some(cgi) = conn.cgi.as_mut() else {
        return Ok(());
    };
    if let Some(stdin) = cgi.stdin.as_mut() {
        let token = Token(*next_token);
        *next_token += 1;
        registry.register(stdin, token, Interest::WRITABLE)?;
        cgi.in_token = Some(token);
        pipes.insert(token, conn_token);
    }
    if let Some(stdout) = cgi.stdout.as_mut() {
        let token = Token(*next_token);
        *next_token += 1;
        registry.register(stdout, token, Interest::READABLE)?;
        cgi.out_token = Some(token);
        pipes.insert(token, conn_token);
    }
    Ok(())
}
