//! End-to-end tests: a reactor on a background thread, plain
//! `std::net::TcpStream` clients talking real HTTP/1.1 to it.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use webserver::config::{AppConfig, LocationConfig, ReturnDirective, ServerConfig};
use webserver::server::Reactor;

fn fixture_root(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("webserver_it_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn base_config(port: u16, root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.servers.push(ServerConfig {
        listen: vec![format!("127.0.0.1:{}", port)],
        root: root.to_string_lossy().into_owned(),
        locations: vec![LocationConfig::default()],
        ..Default::default()
    });
    config
}

fn spawn_server(config: AppConfig) -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let reactor = Reactor::new(config, Arc::clone(&shutdown)).expect("reactor failed to start");
    thread::spawn(move || {
        let mut reactor = reactor;
        let _ = reactor.run();
    });
    shutdown
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// One-shot exchange over a fresh connection; the request should carry
/// `Connection: close` so read_to_end terminates.
fn exchange(port: u16, raw: &str) -> String {
    let mut stream = connect(port);
    stream.write_all(raw.as_bytes()).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn find_subseq(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads exactly one framed response off a keep-alive connection.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_subseq(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).expect("read failed");
        assert!(n > 0, "connection closed before headers were complete");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).expect("read failed");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    (head, body)
}

#[test]
fn serves_static_file() {
    let root = fixture_root("static");
    fs::write(root.join("index.html"), "hi").unwrap();
    let port = 18311;
    let shutdown = spawn_server(base_config(port, &root));

    let reply = exchange(port, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", reply);
    assert!(reply.contains("Content-Length: 2\r\n"));
    assert!(reply.contains("Content-Type: text/html\r\n"));
    assert!(reply.contains("Server: webserver/1.0\r\n"));
    assert!(reply.ends_with("hi"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn missing_file_is_404() {
    let root = fixture_root("missing");
    let port = 18312;
    let shutdown = spawn_server(base_config(port, &root));

    let reply = exchange(port, "GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", reply);

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn disallowed_method_is_405() {
    let root = fixture_root("methods");
    let port = 18313;
    let mut config = base_config(port, &root);
    config.servers[0].locations.push(LocationConfig {
        path: "/api".to_string(),
        allowed_methods: Some(vec!["GET".to_string(), "POST".to_string()]),
        ..Default::default()
    });
    let shutdown = spawn_server(config);

    let reply = exchange(port, "DELETE /api HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(
        reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "got: {}",
        reply
    );

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn return_directive_redirects() {
    let root = fixture_root("redirect");
    let port = 18314;
    let mut config = base_config(port, &root);
    config.servers[0].locations.push(LocationConfig {
        path: "/old".to_string(),
        return_directive: Some(ReturnDirective {
            code: 302,
            target: "http://z/".to_string(),
        }),
        ..Default::default()
    });
    let shutdown = spawn_server(config);

    let reply = exchange(port, "GET /old/page HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 302 Found\r\n"), "got: {}", reply);
    assert!(reply.contains("Location: http://z/\r\n"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn return_directive_literal_text() {
    let root = fixture_root("literal");
    let port = 18315;
    let mut config = base_config(port, &root);
    config.servers[0].locations.push(LocationConfig {
        path: "/greet".to_string(),
        return_directive: Some(ReturnDirective {
            code: 200,
            target: "\"hello there\"".to_string(),
        }),
        ..Default::default()
    });
    let shutdown = spawn_server(config);

    let reply = exchange(port, "GET /greet HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", reply);
    assert!(reply.contains("Content-Type: application/octet-stream\r\n"));
    assert!(reply.ends_with("hello there"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn keep_alive_round_trip() {
    let root = fixture_root("keepalive");
    fs::write(root.join("index.html"), "hi").unwrap();
    let port = 18316;
    let shutdown = spawn_server(base_config(port, &root));

    let mut stream = connect(port);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, b"hi");

    // same socket, second request
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hi");

    // a close request ends the session after its response
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close"));
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "server kept the connection open");

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn idle_connection_is_timed_out() {
    let root = fixture_root("timeout");
    let port = 18317;
    let mut config = base_config(port, &root);
    config.client_timeout = 1;
    let shutdown = spawn_server(config);

    let mut stream = connect(port);
    thread::sleep(Duration::from_secs(3));
    let mut out = Vec::new();
    let n = stream.read_to_end(&mut out).unwrap();
    assert_eq!(n, 0, "idle connection should have been closed silently");

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn active_connection_survives_the_timeout() {
    let root = fixture_root("active");
    fs::write(root.join("index.html"), "hi").unwrap();
    let port = 18318;
    let mut config = base_config(port, &root);
    config.client_timeout = 2;
    let shutdown = spawn_server(config);

    let mut stream = connect(port);
    for _ in 0..3 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        thread::sleep(Duration::from_millis(1200));
    }

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn directory_without_slash_redirects() {
    let root = fixture_root("dirredir");
    fs::create_dir_all(root.join("sub")).unwrap();
    let port = 18319;
    let shutdown = spawn_server(base_config(port, &root));

    let reply = exchange(port, "GET /sub HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(
        reply.starts_with("HTTP/1.1 301 Moved Permanently\r\n"),
        "got: {}",
        reply
    );
    assert!(reply.contains("Location: http://x/sub/\r\n"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn autoindex_lists_directory() {
    let root = fixture_root("autoindex");
    fs::create_dir_all(root.join("listing")).unwrap();
    fs::write(root.join("listing/a.txt"), "a").unwrap();
    fs::write(root.join("listing/b.txt"), "b").unwrap();
    let port = 18320;
    let mut config = base_config(port, &root);
    config.servers[0].locations[0].autoindex = Some(true);
    let shutdown = spawn_server(config);

    let reply = exchange(port, "GET /listing/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", reply);
    assert!(reply.contains("a.txt"));
    assert!(reply.contains("b.txt"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn directory_without_index_or_autoindex_is_404() {
    let root = fixture_root("noindex");
    fs::create_dir_all(root.join("empty")).unwrap();
    let port = 18321;
    let shutdown = spawn_server(base_config(port, &root));

    let reply = exchange(port, "GET /empty/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", reply);

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn delete_removes_file() {
    let root = fixture_root("delete");
    let victim = root.join("delete-me.txt");
    fs::write(&victim, "bye").unwrap();
    let port = 18322;
    let shutdown = spawn_server(base_config(port, &root));

    let reply = exchange(
        port,
        "DELETE /delete-me.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 204 No Content\r\n"), "got: {}", reply);
    assert!(!victim.exists());

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn post_stores_body_in_upload_directory() {
    let root = fixture_root("upload");
    fs::create_dir_all(root.join("uploads")).unwrap();
    let port = 18323;
    let mut config = base_config(port, &root);
    config.servers[0].locations.push(LocationConfig {
        path: "/files".to_string(),
        upload_directory: Some("uploads".to_string()),
        ..Default::default()
    });
    let shutdown = spawn_server(config);

    let reply = exchange(
        port,
        "POST /files/note.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndata",
    );
    assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", reply);
    assert_eq!(fs::read(root.join("uploads/note.txt")).unwrap(), b"data");

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn configured_error_page_is_served() {
    let root = fixture_root("errorpage");
    fs::create_dir_all(root.join("error")).unwrap();
    fs::write(root.join("error/404.html"), "<h1>custom not found</h1>").unwrap();
    let port = 18324;
    let mut config = base_config(port, &root);
    config.servers[0]
        .error_pages
        .insert(404, "/error/404.html".to_string());
    let shutdown = spawn_server(config);

    let reply = exchange(port, "GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", reply);
    assert!(reply.contains("custom not found"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn parse_error_closes_after_canned_response() {
    let root = fixture_root("parseerror");
    let port = 18325;
    let shutdown = spawn_server(base_config(port, &root));

    // no Connection: close needed, errors always end the session
    let reply = exchange(port, "GET / HTP/1.1\r\nHost: x\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", reply);
    assert!(reply.contains("Connection: close\r\n"));

    shutdown.store(true, Ordering::Relaxed);
}

#[test]
fn virtual_host_selects_server_by_host_header() {
    let root_a = fixture_root("vhost_a");
    let root_b = fixture_root("vhost_b");
    fs::write(root_a.join("index.html"), "site a").unwrap();
    fs::write(root_b.join("index.html"), "site b").unwrap();
    let port = 18326;

    let mut config = AppConfig::default();
    config.servers.push(ServerConfig {
        listen: vec![format!("127.0.0.1:{}", port)],
        server_names: vec!["a.example".to_string()],
        root: root_a.to_string_lossy().into_owned(),
        locations: vec![LocationConfig::default()],
        ..Default::default()
    });
    config.servers.push(ServerConfig {
        listen: vec![format!("127.0.0.1:{}", port)],
        server_names: vec!["b.example".to_string()],
        root: root_b.to_string_lossy().into_owned(),
        locations: vec![LocationConfig::default()],
        ..Default::default()
    });
    let shutdown = spawn_server(config);

    let reply = exchange(
        port,
        "GET / HTTP/1.1\r\nHost: b.example\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.ends_with("site b"), "got: {}", reply);

    // unknown host falls back to the endpoint's first server
    let reply = exchange(
        port,
        "GET / HTTP/1.1\r\nHost: nobody.example\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.ends_with("site a"), "got: {}", reply);

    shutdown.store(true, Ordering::Relaxed);
}
