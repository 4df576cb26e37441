//! Logging setup, call timing and standard spans.

use std::time::Instant;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber. `RUST_LOG` wins over the default `info`.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Guard that logs how long a control call took when dropped.
pub struct CallTimer {
    method: &'static str,
    start: Instant,
}

impl CallTimer {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            start: Instant::now(),
        }
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        let micros = self.start.elapsed().as_micros();
        debug!(method = self.method, micros, "control call finished");
    }
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for one connection actor.
    pub fn connection(id: &str, account: &str) -> Span {
        info_span!("connection", id = %id, account = %account)
    }

    /// Span for handling one account event.
    pub fn account_event(name: &'static str) -> Span {
        info_span!("account_event", event = name)
    }

    /// Span for one control-surface call.
    pub fn control(method: &'static str, connection: Option<&str>) -> Span {
        if let Some(connection) = connection {
            info_span!("control", method = method, connection = %connection)
        } else {
            info_span!("control", method = method)
        }
    }
}
