use color_eyre::eyre::{Report, WrapErr};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Installs the error report hooks and the global subscriber. `RUST_LOG`
/// overrides the default `info` filter.
pub fn init() -> Result<(), Report> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .wrap_err("Invalid log filter")?;
    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer())
        .with(ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("Unable to set global tracing subscriber")?;
    Ok(())
}
