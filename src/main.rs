//! TunForge CLI wrapper
//!
//! Reads the JSON config file, starts the client, and maps Ctrl-C/SIGTERM
//! to a cooperative stop. The process exit code is the worker's: the
//! transport plugin's serve return value, or 1 when initialization failed.

use std::path::PathBuf;
use std::time::Duration;

use log::{error, info};

use tunforge::utils::rotate_log_if_needed;
use tunforge::vpn::{client_start, client_stop, is_client_running, last_exit_code};

fn init_logging() {
    let log_dir = PathBuf::from("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let log_file_path = log_dir.join("tunforge.log");

    if let Err(e) = rotate_log_if_needed(&log_file_path) {
        eprintln!("Failed to rotate log: {}", e);
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|_| log::LevelFilter::Debug)
        .unwrap_or(log::LevelFilter::Info);

    // Log to a file when possible so crashes in the field are debuggable;
    // fall back to stderr.
    if let Ok(log_file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)
    {
        env_logger::Builder::from_default_env()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log_level)
            .format_timestamp_millis()
            .init();
    }
}

fn read_config_file(path: &str) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    // Strip a UTF-8 BOM if the file carries one
    let bytes = if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &bytes[3..]
    } else {
        &bytes[..]
    };
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args.first().map(String::as_str).unwrap_or("tunforge"));
        std::process::exit(1);
    }

    init_logging();
    info!("TunForge v{}", env!("CARGO_PKG_VERSION"));

    let config = match read_config_file(&args[1]) {
        Ok(text) => text,
        Err(e) => {
            error!("Cannot read config file '{}': {}", args[1], e);
            eprintln!("Error: cannot read config file '{}': {}", args[1], e);
            std::process::exit(1);
        }
    };

    let rc = client_start(&config);
    if rc != 0 {
        error!("Start failed rc={}", rc);
        std::process::exit(1);
    }

    if let Err(e) = ctrlc::set_handler(|| {
        let _ = client_stop();
    }) {
        error!("Failed to install signal handler: {}", e);
    }

    while is_client_running() == 1 {
        std::thread::sleep(Duration::from_secs(1));
    }

    std::process::exit(last_exit_code());
}
