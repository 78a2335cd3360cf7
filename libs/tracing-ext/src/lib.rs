//! Log subscriber setup shared by the node binary and tests
//!
//! Filtering follows `RUST_LOG` when it is set and falls back to the given
//! default directive otherwise.

use std::fmt;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber
///
/// Returns `false` if a subscriber was already installed.
pub fn init(format: LogFormat, default_directive: &str) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .with_target(true);

    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

/// Subscriber for tests; output goes through the test harness capture
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
