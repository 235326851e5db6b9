//! Structured logging setup.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `DDP_LOG_FORMAT=json` for JSON logs. Rank 0 logs at `info`, every
//! other rank at `error`; `RUST_LOG` overrides both.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "DDP_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

/// Default verbosity for a rank.
pub fn level_for_rank(rank: usize) -> &'static str {
    if rank == 0 {
        "info"
    } else {
        "error"
    }
}

/// Install the global subscriber for this rank.
///
/// Fails if a subscriber is already installed.
pub fn init_for_rank(rank: usize) -> anyhow::Result<()> {
    init_with_level_and_format(level_for_rank(rank), LogFormat::from_env())
}

/// Install the global subscriber with an explicit default level and format.
pub fn init_with_level_and_format(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = match format {
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        ),
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parse() {
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    }

    #[test]
    fn only_rank_zero_logs_info() {
        assert_eq!(level_for_rank(0), "info");
        assert_eq!(level_for_rank(1), "error");
        assert_eq!(level_for_rank(7), "error");
    }

    #[test]
    fn second_init_is_an_error_not_a_panic() {
        let _ = init_with_level_and_format("warn", LogFormat::Pretty);
        assert!(init_with_level_and_format("warn", LogFormat::Pretty).is_err());
    }
}
