#![cfg_attr(test, allow(clippy::unwrap_used))]

mod err_with_sources;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt as _};

pub use err_with_sources::{ErrorWithSources, err_with_src};

/// A filter directive that silences noisy crates.
///
/// For debugging, it is useful to set a catch-all log like `debug`. That produces a
/// lot of logs from dependencies that are rarely interesting. By prepending this
/// directive to the active log filter, a simple directive like `debug` actually
/// produces useful logs; individual crates can still be turned back up by restating
/// them in the supplied directive with a lower filter, e.g. `netlink_proto=debug`.
const IRRELEVANT_CRATES: &str = "netlink_proto=warn,rtnetlink=warn,tokio_tungstenite=info,webrtc=info,webrtc_ice=info";

/// Registers a global [`tracing`] subscriber that logs to stdout.
///
/// `json` selects structured JSON events (for ingestion by a log pipeline); otherwise
/// a human-readable, ANSI-colored format is used.
pub fn init(directives: &str, json: bool) -> Result<()> {
    let filter = parse_filter(directives).context("Failed to parse log directives")?;

    let fmt_layer = if json {
        fmt::layer().json().flatten_event(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let subscriber = Registry::default().with(fmt_layer.with_filter(filter));

    set_global(subscriber)
}

fn set_global(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

fn parse_filter(directives: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
    }
}

/// Initialises a test-scoped subscriber; dropping the returned guard uninstalls it.
pub fn test(directives: &str) -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directives_still_parse() {
        parse_filter("").unwrap();
    }

    #[test]
    fn custom_directives_are_appended() {
        let filter = parse_filter("agent=trace").unwrap();
        assert!(filter.to_string().contains("agent=trace"));
    }
}
