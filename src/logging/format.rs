//! Log output: human-readable lines by default, one JSON object per line when
//! the agent runs under a supervisor that ingests ndjson.

use crate::config::LogConfig;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const FALLBACK_LEVEL: &str = "info";

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber. `RUST_LOG` wins over the configured level.
    /// Returns `false` if a subscriber was already installed.
    pub fn init(config: &LogConfig) -> bool {
        let filter = Self::filter(&config.level);
        let installed = if config.json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry().with(filter).with(fmt).try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .try_init()
        };
        installed.is_ok()
    }

    fn filter(level: &str) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused_not_fatal() {
        let cfg = LogConfig {
            level: "debug".into(),
            json: true,
        };
        let _ = StructuredLogger::init(&cfg);
        assert!(!StructuredLogger::init(&cfg));
    }
}
