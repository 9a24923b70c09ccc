use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Structured JSON logging, one object per line.
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Interlink structured logging initialized");
    Ok(())
}

/// Human-readable logging for development.
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Interlink console logging initialized");
    Ok(())
}

/// `level` takes any `EnvFilter` directive, e.g. `"info,interlink::transactions=debug"`.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json_format, include_spans, "Interlink logging initialized");
    Ok(())
}

/// Log the final line before the process exits; the fmt layers write synchronously.
pub fn shutdown_tracing() {
    tracing::info!("Interlink tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_config() {
        assert!(init_tracing_with_config("debug", true, true).is_ok());
        assert!(init_tracing_with_config("debug", false, false).is_err());
    }
}
