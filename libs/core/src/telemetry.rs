use crate::error::{Error, Result};

use std::fmt;

use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Install the global tracing subscriber.
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter)
        .map_err(|e| Error::ParseError(format!("invalid log filter {log_filter:?}: {e}")))?;

    match log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
    Ok(())
}
