//! EdmoHub - session hub daemon for EDMO modular robots

use edmo_hub::config::Config;
use edmo_hub::device::ConnectionManager;
use edmo_hub::error::Result;
use edmo_hub::session::SessionManager;
use edmo_hub::sink::default_sink;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("EdmoHub v0.3.0 starting...");

    let config = match env::args().nth(1) {
        Some(path) => {
            log::info!("Using config: {}", path);
            Config::load(&path)?
        }
        None => {
            log::info!("No config given, using defaults");
            Config::default()
        }
    };

    if let Some(directory) = &config.plugins.directory {
        // Plugin loading itself is the loader collaborator's job
        log::info!("Plugin directory: {}", directory);
    }

    let sessions = SessionManager::new(None, default_sink(), config.session.reconcile_interval());
    let (mut connections, directory_events) = ConnectionManager::start(&config.discovery)?;
    sessions.start_pump(directory_events);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| edmo_hub::Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!(
        "Discovering on serial ({} baud) and UDP broadcast (port {})",
        config.discovery.serial_baud,
        config.discovery.udp_port
    );
    log::info!("EdmoHub running. Press Ctrl-C to stop.");

    let mut last_stats = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats.elapsed().as_secs() >= 10 {
            log::info!(
                "Devices: {} candidate(s), {} active session(s)",
                sessions.candidate_count(),
                sessions.active_session_count()
            );
            last_stats = Instant::now();
        }
    }

    log::info!("Shutting down...");
    sessions.shutdown();
    connections.stop();
    sessions.stop_pump();

    log::info!("EdmoHub stopped");
    Ok(())
}
