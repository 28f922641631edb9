//! Diagnostic tracing for the harness itself.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG` or `-v`, output to
//!   stderr. Not persisted, not part of the loop's product output.
//!
//! - **Loop artifacts (`io/iteration_log`, `io/report`)**: per-iteration logs
//!   and the event stream under `.loopguard/<loop_id>/`. Always written,
//!   unaffected by log filters.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "loopguard=info,warn",
        _ => "loopguard=debug,info",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the filter follows `verbosity`.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=loopguard=debug loopguard run
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_default_level() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).contains("loopguard=info"));
        assert!(default_directive(3).contains("loopguard=debug"));
    }
}
