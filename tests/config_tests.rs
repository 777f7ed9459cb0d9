use std::fs;
use std::path::PathBuf;

use webserver::config::{
    parse_size, AppConfig, LocationConfig, RouteScope, ServerConfig, DEFAULT_CLIENT_TIMEOUT,
    DEFAULT_HEADER_BUFFER_SIZE, DEFAULT_MAX_BODY_SIZE,
};

fn write_config(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("webserver_config_{}_{}.yaml", name, std::process::id()));
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn size_suffixes() {
    assert_eq!(parse_size("512").unwrap(), 512);
    assert_eq!(parse_size("2k").unwrap(), 2048);
    assert_eq!(parse_size("2K").unwrap(), 2048);
    assert_eq!(parse_size("1m").unwrap(), 1_048_576);
    assert_eq!(parse_size("1M").unwrap(), 1_048_576);
    assert!(parse_size("").is_err());
    assert!(parse_size("abc").is_err());
    assert!(parse_size("1g").is_err());
}

#[test]
fn global_defaults() {
    let path = write_config(
        "defaults",
        "servers:\n  - listen: [\"127.0.0.1:8099\"]\n",
    );
    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.client_timeout, DEFAULT_CLIENT_TIMEOUT);
    assert_eq!(config.client_header_buffer_size, DEFAULT_HEADER_BUFFER_SIZE);
    assert_eq!(config.client_max_body_size, DEFAULT_MAX_BODY_SIZE);

    let server = &config.servers[0];
    assert_eq!(server.index, vec!["index.html".to_string()]);
    assert_eq!(
        server.allowed_methods,
        vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()]
    );
    assert!(!server.autoindex);
    let _ = fs::remove_file(path);
}

#[test]
fn size_fields_accept_suffixes_and_integers() {
    let path = write_config(
        "sizes",
        "client_header_buffer_size: 4k\nclient_max_body_size: 2097152\nservers:\n  - listen: [\"127.0.0.1:8099\"]\n",
    );
    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.client_header_buffer_size, 4096);
    assert_eq!(config.client_max_body_size, 2_097_152);
    let _ = fs::remove_file(path);
}

#[test]
fn full_server_block_round_trip() {
    let yaml = r#"
client_timeout: 10
servers:
  - listen: ["127.0.0.1:8099", "127.0.0.1:8100"]
    server_names: ["example.com"]
    root: "/srv/www"
    index: ["index.html", "index.htm"]
    error_pages:
      404: "/error/404.html"
    allowed_methods: ["GET", "POST"]
    autoindex: true
    cgi_bin:
      ".py": "/usr/bin/python3"
    locations:
      - path: "/"
      - path: "/old"
        return:
          code: 302
          target: "http://example.com/"
"#;
    let path = write_config("full", yaml);
    let config = AppConfig::load(&path).unwrap();
    let server = &config.servers[0];
    assert_eq!(server.endpoints().unwrap().len(), 2);
    assert_eq!(server.root, "/srv/www");
    assert_eq!(server.error_pages.get(&404).unwrap(), "/error/404.html");
    assert_eq!(server.cgi_bin.get(".py").unwrap(), "/usr/bin/python3");
    let redirect = config.servers[0].locations[1]
        .return_directive
        .as_ref()
        .unwrap();
    assert_eq!(redirect.code, 302);
    assert_eq!(redirect.target, "http://example.com/");
    let _ = fs::remove_file(path);
}

#[test]
fn empty_config_is_rejected() {
    let config = AppConfig::default();
    assert!(config.validate().is_err());
}

#[test]
fn unknown_method_is_rejected() {
    let mut config = AppConfig::default();
    config.servers.push(ServerConfig {
        allowed_methods: vec!["PATCH".to_string()],
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn duplicate_location_paths_are_rejected() {
    let mut config = AppConfig::default();
    config.servers.push(ServerConfig {
        locations: vec![
            LocationConfig::default(),
            LocationConfig::default(),
        ],
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn listen_forms() {
    let server = ServerConfig {
        listen: vec![
            "127.0.0.1:8080".to_string(),
            "9090".to_string(),
            ":7070".to_string(),
        ],
        ..Default::default()
    };
    let endpoints = server.endpoints().unwrap();
    assert_eq!(endpoints[0], ("127.0.0.1".to_string(), 8080));
    assert_eq!(endpoints[1], ("0.0.0.0".to_string(), 9090));
    assert_eq!(endpoints[2], ("0.0.0.0".to_string(), 7070));
}

#[test]
fn location_inherits_unset_directives() {
    let server = ServerConfig {
        root: "/srv/www".to_string(),
        autoindex: true,
        locations: vec![
            LocationConfig::default(),
            LocationConfig {
                path: "/static".to_string(),
                root: Some("/srv/static".to_string()),
                autoindex: Some(false),
                allowed_methods: Some(vec!["GET".to_string()]),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let inherited = RouteScope {
        server: &server,
        location: &server.locations[0],
    };
    assert_eq!(inherited.root(), "/srv/www");
    assert!(inherited.autoindex());
    assert_eq!(inherited.allowed_methods().len(), 3);

    let overridden = RouteScope {
        server: &server,
        location: &server.locations[1],
    };
    assert_eq!(overridden.root(), "/srv/static");
    assert!(!overridden.autoindex());
    assert_eq!(overridden.allowed_methods(), ["GET".to_string()]);
}

#[test]
fn cgi_interpreter_lookup_by_extension() {
    let mut server = ServerConfig::default();
    server
        .cgi_bin
        .insert(".py".to_string(), "/usr/bin/python3".to_string());
    assert_eq!(
        server.cgi_interpreter(std::path::Path::new("/www/app.py")),
        Some("/usr/bin/python3")
    );
    assert_eq!(server.cgi_interpreter(std::path::Path::new("/www/page.html")), None);
    assert_eq!(server.cgi_interpreter(std::path::Path::new("/www/noext")), None);
}
