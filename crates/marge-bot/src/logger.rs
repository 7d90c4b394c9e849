//! Terminal logging via simplelog
//!
//! `--debug` raises the filter; `RUST_LOG` (error/warn/info/debug/trace)
//! wins when set. Token and key material never reach a log line.

use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, SimpleLogger, TermLogger, TerminalMode};

/// Initialise logging for the process.
pub fn init(debug: bool) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "error" => Some(LevelFilter::Error),
            "warn" => Some(LevelFilter::Warn),
            "info" => Some(LevelFilter::Info),
            "debug" => Some(LevelFilter::Debug),
            "trace" => Some(LevelFilter::Trace),
            _ => None,
        })
        .unwrap_or(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });

    let config = ConfigBuilder::new().set_time_format_rfc3339().build();

    if TermLogger::init(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        // Not a terminal (or already initialised); plain stderr will do.
        let _ = SimpleLogger::init(level, config);
    }
}
