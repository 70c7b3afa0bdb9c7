//! Tracing subscriber setup. Logs go to stderr so that reports on stdout stay
//! machine-readable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

pub fn init(log_format: &str, log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let format = normalize_log_format(log_format);

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr)
                    .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339()),
            )
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    tracing::debug!(
        log_format = ?format,
        log_level = log_level,
        "Logging system initialized"
    );
}

fn normalize_log_format(format: &str) -> LogFormat {
    match format.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        "pretty" | "compact" | "text" => LogFormat::Pretty,
        _ => {
            eprintln!(
                "WARN: Invalid log format '{format}', defaulting to 'pretty'. Valid options: json, pretty"
            );
            LogFormat::Pretty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_log_format() {
        assert_eq!(normalize_log_format("JSON"), LogFormat::Json);
        assert_eq!(normalize_log_format("text"), LogFormat::Pretty);
        assert_eq!(normalize_log_format("compact"), LogFormat::Pretty);
        assert_eq!(normalize_log_format("xml"), LogFormat::Pretty);
    }
}
