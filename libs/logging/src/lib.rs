#![cfg_attr(test, allow(clippy::unwrap_used))]

mod err_with_sources;
mod format;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{Subscriber, subscriber::DefaultGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::ParseError, fmt, layer::SubscriberExt as _, reload,
    util::SubscriberInitExt as _,
};

pub use err_with_sources::{ErrorWithSources, err_with_src};
pub use format::Format;

/// Registers a global subscriber with stdout logging and `additional_layer`.
pub fn setup_global_subscriber<L>(
    directives: String,
    additional_layer: L,
) -> Result<FilterReloadHandle>
where
    L: Layer<Registry> + Send + Sync,
{
    let (filter1, reload_handle1) =
        try_filter(&directives).context("Failed to parse directives")?;
    let (filter2, reload_handle2) =
        try_filter(&directives).context("Failed to parse directives")?;

    let subscriber = Registry::default()
        .with(additional_layer.with_filter(filter1))
        .with(
            fmt::layer()
                .event_format(Format::new())
                .with_filter(filter2),
        );

    init(subscriber)?;

    Ok(reload_handle1.merge(reload_handle2))
}

/// Sets up a bootstrap logger for the time before the CLI is parsed.
pub fn setup_bootstrap() -> Result<DefaultGuard> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let (filter, _) = try_filter(&directives).context("failed to parse directives")?;
    let layer = tracing_subscriber::fmt::layer()
        .event_format(Format::new())
        .with_filter(filter);
    let subscriber = Registry::default().with(layer);

    Ok(tracing::dispatcher::set_default(&subscriber.into()))
}

pub fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter<S>(
    directives: &str,
) -> Result<(reload::Layer<EnvFilter, S>, FilterReloadHandle), ParseError>
where
    S: 'static,
{
    let env_filter = parse_filter(directives)?;

    let (layer, reload_handle) = reload::Layer::new(env_filter);
    let handle = FilterReloadHandle {
        inner: Arc::new(reload_handle),
    };

    Ok((layer, handle))
}

fn parse_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// By prepending this to the active filter, a catch-all directive like
    /// `debug` still produces useful logs. Restate a crate with a lower
    /// filter in your directive to turn it back on.
    const IRRELEVANT_CRATES: &str = "tokio=warn,runtime=warn,mio=warn";

    let env_filter = if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)?
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))?
    };

    Ok(env_filter)
}

pub struct FilterReloadHandle {
    inner: Arc<dyn Reload + Send + Sync>,
}

impl std::fmt::Debug for FilterReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FilterReloadHandle").finish_non_exhaustive()
    }
}

impl FilterReloadHandle {
    pub fn reload(&self, new_filter: &str) -> Result<()> {
        self.inner.reload(new_filter)?;

        Ok(())
    }

    pub fn merge(self, other: FilterReloadHandle) -> Self {
        Self {
            inner: Arc::new((self, other)),
        }
    }
}

trait Reload {
    fn reload(&self, new_filter: &str) -> Result<()>;
}

impl<S> Reload for tracing_subscriber::reload::Handle<EnvFilter, S>
where
    S: 'static,
{
    fn reload(&self, new_filter: &str) -> Result<()> {
        let filter = parse_filter(new_filter).context("Failed to parse new filter")?;

        self.reload(filter).context("Failed to reload filter")?;

        Ok(())
    }
}

impl Reload for (FilterReloadHandle, FilterReloadHandle) {
    fn reload(&self, new_filter: &str) -> Result<()> {
        let (a, b) = self;

        a.reload(new_filter)?;
        b.reload(new_filter)?;

        Ok(())
    }
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
