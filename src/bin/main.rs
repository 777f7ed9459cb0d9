use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use webserver::config::AppConfig;
use webserver::error::Result;
use webserver::server::Reactor;

const DEFAULT_CONFIG: &str = "config.yaml";

fn run() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = AppConfig::load(Path::new(&config_path))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .map_err(webserver::error::ServerError::Io)?;
    }

    let mut reactor = Reactor::new(config, shutdown)?;
    reactor.run()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("webserver: {}", e);
        std::process::exit(1);
    }
}
