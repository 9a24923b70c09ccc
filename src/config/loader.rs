use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::ServerConfig, validation::ServerConfigValidator};

/// Load and validate configuration from a file.
///
/// The format follows the extension: YAML (default), JSON, TOML or INI.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    let config = load_config_sync(config_path)?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    Ok(config)
}

/// Parse a configuration file without validating it.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    parse_config(
        config_path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
        format,
    )
}

/// Parse configuration text, e.g. a document served by the administrative API.
pub fn parse_config_str(content: &str, format: FileFormat) -> Result<ServerConfig> {
    Config::builder()
        .add_source(File::from_str(content, format))
        .build()
        .wrap_err("Failed to build config from document")?
        .try_deserialize()
        .wrap_err("Failed to deserialize config document")
}

fn parse_config(path: &str, format: FileFormat) -> Result<ServerConfig> {
    let settings = Config::builder()
        .add_source(File::new(path, format))
        .build()
        .with_context(|| format!("Failed to build config from {path}"))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {path}"))
}

/// Load configuration without validation (used by the `validate` command to report every
/// problem instead of the first).
pub async fn load_config_unchecked(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}
