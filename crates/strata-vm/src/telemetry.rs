//! Logging setup.
//!
//! The host never installs a global subscriber. Embedders build a
//! [`Dispatch`] here (or bring their own) and hand it to
//! [`crate::VmHost::new`]; every run executes under it.

use tracing::Dispatch;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::LoggingConfig;

/// Build a dispatcher with the given filter directive.
pub fn build_dispatch(log_level: &str, json_format: bool) -> anyhow::Result<Dispatch> {
    let filter = EnvFilter::try_new(log_level)?;

    let dispatch = if json_format {
        Dispatch::new(tracing_subscriber::registry().with(filter).with(fmt::layer().json()))
    } else {
        Dispatch::new(tracing_subscriber::registry().with(filter).with(fmt::layer().pretty()))
    };
    Ok(dispatch)
}

pub fn dispatch_from_config(config: &LoggingConfig) -> anyhow::Result<Dispatch> {
    build_dispatch(&config.level, config.format == "json")
}

/// Dispatcher that drops everything.
pub fn silent() -> Dispatch {
    Dispatch::none()
}
