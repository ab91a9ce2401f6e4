//! Logging setup
//!
//! The runtime logs through `tracing`. `init()` installs a `fmt` subscriber
//! once per process; embedding applications that install their own
//! subscriber simply skip it.
//!
//! # Environment Variables
//!
//! - `NODELINK_LOG=<directives>` - `EnvFilter` directives, e.g.
//!   `nodelink_runtime=debug`. Falls back to `RUST_LOG`, then `info`.
//! - `NODELINK_LOG_LEVEL=<level>` - one of NONE, ERROR, WARNING, INFO,
//!   DEBUG1, DEBUG2. Used when no directives are given.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Map a level name to a filter directive
///
/// DEBUG1 is `debug`, DEBUG2 is `trace`; standard tracing names pass
/// through.
pub fn level_directive(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_uppercase().as_str() {
        "NONE" | "OFF" => Some("off"),
        "ERROR" => Some("error"),
        "WARNING" | "WARN" => Some("warn"),
        "INFO" => Some("info"),
        "DEBUG1" | "DEBUG" => Some("debug"),
        "DEBUG2" | "TRACE" => Some("trace"),
        _ => None,
    }
}

fn filter_from_env() -> EnvFilter {
    let directives = std::env::var("NODELINK_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .or_else(|| {
            std::env::var("NODELINK_LOG_LEVEL")
                .ok()
                .and_then(|v| level_directive(&v))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "info".to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the process-wide subscriber (idempotent)
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter_from_env())
            .with_thread_names(true)
            .with_target(false)
            .try_init();
    });
}

/// Subscriber for tests: captured output, debug level unless overridden
pub fn init_for_tests() {
    INIT.call_once(|| {
        let filter = std::env::var("NODELINK_LOG")
            .ok()
            .and_then(|d| EnvFilter::try_new(d).ok())
            .unwrap_or_else(|| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("NONE"), Some("off"));
        assert_eq!(level_directive("warning"), Some("warn"));
        assert_eq!(level_directive("DEBUG1"), Some("debug"));
        assert_eq!(level_directive("debug2"), Some("trace"));
        assert_eq!(level_directive("loud"), None);
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
        tracing::info!("logging initialised");
    }
}
