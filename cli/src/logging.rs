//! Logging setup for the binary. Logs go to stderr so stdout carries only
//! the summary.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset and `-v` is not given.
pub const DEFAULT_FILTER: &str = "warn";

/// Picks the filter directive: `-v` forces debug, else `RUST_LOG`, else warn.
pub fn filter_directive(verbose: bool, rust_log: Option<&str>) -> String {
    match (verbose, rust_log) {
        (true, _) => "debug".to_string(),
        (false, Some(s)) if !s.trim().is_empty() => s.to_string(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Installs the global `tracing` subscriber.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(verbose, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directive:?}: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_wins() {
        assert_eq!(filter_directive(true, Some("error")), "debug");
    }

    #[test]
    fn rust_log_is_used() {
        assert_eq!(filter_directive(false, Some("spkexport=trace")), "spkexport=trace");
    }

    #[test]
    fn defaults_to_warn() {
        assert_eq!(filter_directive(false, None), "warn");
        assert_eq!(filter_directive(false, Some("  ")), "warn");
    }

    #[test]
    fn directives_parse() {
        for d in ["debug", "warn", "spkexport=trace,info"] {
            assert!(EnvFilter::try_new(d).is_ok(), "{d}");
        }
    }
}
