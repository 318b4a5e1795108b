//! Tracing subscriber setup shared by the worker CLI and the engine process.
//!
//! Both binaries log to stderr: the engine's stdout carries the protocol
//! channel, and the CLI prints run reports on stdout.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "flowrunner=info";

#[derive(Clone, Debug)]
pub struct ObservabilityOptions {
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub ansi: bool,
}

impl Default for ObservabilityOptions {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
            ansi: true,
        }
    }
}

impl ObservabilityOptions {
    /// Settings for the sandboxed engine: plain text, no colors.
    pub fn engine() -> Self {
        Self {
            ansi: false,
            ..Self::default()
        }
    }
}

pub fn env_filter(options: &ObservabilityOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.default_filter))
}

/// Installs the global subscriber. Calling it twice keeps the first subscriber.
pub fn init(options: ObservabilityOptions) {
    let json_layer = options.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE)
            .boxed()
    });
    let text_layer = (!options.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(options.ansi)
            .boxed()
    });

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter(&options))
        .with(json_layer)
        .with(text_layer)
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn default_filter_applies_without_rust_log() {
        let previous = std::env::var("RUST_LOG").ok();
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::remove_var("RUST_LOG") };
        let filter = env_filter(&ObservabilityOptions::default());
        assert_eq!(filter.to_string(), DEFAULT_FILTER);
        if let Some(value) = previous {
            unsafe { std::env::set_var("RUST_LOG", value) };
        }
    }

    #[test]
    fn engine_options_disable_colors() {
        let options = ObservabilityOptions::engine();
        assert!(!options.ansi);
        assert!(!options.json);
    }
}
