//! Logger bootstrap for embedding binaries.

use std::io::{self, Write};

use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;

/// Common initialization for client entrypoints. `KILN_LOG_FILE` redirects
/// logging to a file; otherwise the standard env_logger setup applies.
pub fn init_common() {
    match std::env::var("KILN_LOG_FILE") {
        Ok(path) => {
            if let Err(err) = init_file_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                env_logger::init();
            }
        }
        Err(_) => env_logger::init(),
    }
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path}");

    Ok(())
}
