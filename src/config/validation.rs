use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::Path,
};

use eyre::Result;
use regex::Regex;

use crate::{
    config::models::{
        ChannelConfig, ChannelType, RouteConfig, RouteType, ServerConfig, TlsConfig,
    },
    core::{channel::parse_interval, path_transform::PathTransform},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Channel conflict detected: {message}")]
    ChannelConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator.
///
/// Runs at load and on every reload; a configuration that fails here never replaces the
/// running snapshot.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Some(audit) = &config.audit_listener {
            if let Err(e) = Self::validate_listen_address(&audit.listen_addr) {
                errors.push(e);
            }
        }

        if let Some(tls_config) = &config.tls {
            errors.extend(Self::validate_tls_config(tls_config));
        }

        if config.channels.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "channels".to_string(),
            });
        }

        for channel in &config.channels {
            errors.extend(Self::validate_channel(channel, config));
        }

        errors.extend(Self::check_channel_conflicts(&config.channels));

        for (name, profile) in &config.certificates {
            for (field, path) in [
                ("ca_path", &profile.ca_path),
                ("cert_path", &profile.cert_path),
                ("key_path", &profile.key_path),
            ] {
                if let Some(path) = path
                    && let Err(e) =
                        Self::file_exists(path, &format!("certificate '{name}' {field}"))
                {
                    errors.push(e);
                }
            }
            if profile.cert_path.is_some() != profile.key_path.is_some() {
                errors.push(ValidationError::InvalidField {
                    field: format!("certificate '{name}'"),
                    message: "cert_path and key_path must be set together".to_string(),
                });
            }
        }

        if config.auth.identity_header.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.identity_header".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:5001' or '0.0.0.0:5000')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_channel(channel: &ChannelConfig, config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let name = channel.name.as_str();

        if name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "channel name".to_string(),
            });
        }

        match channel.channel_type {
            ChannelType::Http | ChannelType::Polling => {
                if channel.url_pattern.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: format!("channel '{name}' url_pattern"),
                    });
                }
            }
            ChannelType::Tcp | ChannelType::Tls => {
                if channel.tcp_host.as_deref().is_none_or(str::is_empty) {
                    errors.push(ValidationError::MissingField {
                        field: format!("channel '{name}' tcp_host"),
                    });
                }
                if channel.tcp_port.is_none() {
                    errors.push(ValidationError::MissingField {
                        field: format!("channel '{name}' tcp_port"),
                    });
                }
            }
        }

        if let Err(e) = Regex::new(&channel.url_pattern) {
            errors.push(ValidationError::InvalidField {
                field: format!("channel '{name}' url_pattern"),
                message: e.to_string(),
            });
        }

        if channel.priority == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("channel '{name}' priority"),
                message: "Priority must be 1 or greater".to_string(),
            });
        }

        if channel.channel_type == ChannelType::Tls && config.tls.is_none() {
            errors.push(ValidationError::InvalidTls {
                message: format!(
                    "channel '{name}' is of type tls but no server 'tls' is configured"
                ),
            });
        }

        match (&channel.channel_type, channel.polling_interval.as_deref()) {
            (ChannelType::Polling, None) => errors.push(ValidationError::MissingField {
                field: format!("channel '{name}' polling_interval"),
            }),
            (ChannelType::Polling, Some(raw)) => {
                if let Err(reason) = parse_interval(raw) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("channel '{name}' polling_interval"),
                        message: reason,
                    });
                }
            }
            (_, Some(_)) => errors.push(ValidationError::InvalidField {
                field: format!("channel '{name}' polling_interval"),
                message: "Only polling channels take a polling_interval".to_string(),
            }),
            (_, None) => {}
        }

        if channel.is_enabled() {
            match channel.enabled_primary_count() {
                1 => {}
                0 => errors.push(ValidationError::InvalidField {
                    field: format!("channel '{name}' routes"),
                    message: "An enabled channel needs exactly one enabled primary route"
                        .to_string(),
                }),
                n => errors.push(ValidationError::InvalidField {
                    field: format!("channel '{name}' routes"),
                    message: format!("{n} enabled primary routes, expected exactly one"),
                }),
            }
        }

        let mut route_names = HashSet::new();
        for route in &channel.routes {
            if !route_names.insert(route.name.as_str()) {
                errors.push(ValidationError::ChannelConflict {
                    message: format!(
                        "channel '{name}' has more than one route named '{}'",
                        route.name
                    ),
                });
            }
            errors.extend(Self::validate_route(channel, route, config));
        }

        errors
    }

    fn validate_route(
        channel: &ChannelConfig,
        route: &RouteConfig,
        config: &ServerConfig,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field =
            |suffix: &str| format!("channel '{}' route '{}' {suffix}", channel.name, route.name);

        if route.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("channel '{}' route name", channel.name),
            });
        }

        if route.host.trim().is_empty() {
            errors.push(ValidationError::MissingField { field: field("host") });
        } else if route.host.contains("://") {
            errors.push(ValidationError::InvalidField {
                field: field("host"),
                message:
                    "Host should not contain a scheme (use 'lis.local', not 'http://lis.local')"
                        .to_string(),
            });
        }

        if route.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("port"),
                message: "Port must be between 1 and 65535".to_string(),
            });
        }

        if route.path.is_some() && route.path_transform.is_some() {
            errors.push(ValidationError::InvalidField {
                field: field("path"),
                message: "Set either 'path' or 'path_transform', not both".to_string(),
            });
        }

        if let Some(rule) = &route.path_transform {
            if let Err(e) = PathTransform::parse(rule) {
                errors.push(ValidationError::InvalidField {
                    field: field("path_transform"),
                    message: e.to_string(),
                });
            }
        }

        if let Some(cert) = &route.cert {
            if !config.certificates.contains_key(cert) {
                errors.push(ValidationError::InvalidField {
                    field: field("cert"),
                    message: format!("Unknown certificate profile '{cert}'"),
                });
            }
            if !route.secured {
                errors.push(ValidationError::InvalidField {
                    field: field("cert"),
                    message: "A certificate profile only applies to secured routes".to_string(),
                });
            }
        }

        let kind = route
            .route_type
            .unwrap_or_else(|| RouteType::inherited_from(channel.channel_type));

        if kind.is_socket() {
            if channel.channel_type == ChannelType::Polling {
                errors.push(ValidationError::InvalidField {
                    field: field("type"),
                    message: format!("Polling channels only dispatch to http routes, not {kind}"),
                });
            }
            let http_only = [
                ("path", route.path.is_some()),
                ("path_transform", route.path_transform.is_some()),
                ("username", route.username.is_some()),
                ("password", route.password.is_some()),
                ("forward_auth_header", route.forward_auth_header),
            ];
            for (name, set) in http_only {
                if set {
                    errors.push(ValidationError::InvalidField {
                        field: field(name),
                        message: format!("Not applicable to {kind} routes"),
                    });
                }
            }
        }

        if route.username.is_some() != route.password.is_some() {
            errors.push(ValidationError::InvalidField {
                field: field("username"),
                message: "username and password must be set together".to_string(),
            });
        }

        if route.timeout_secs == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: field("timeout_secs"),
                message: "Timeout must be greater than zero".to_string(),
            });
        }

        errors
    }

    fn validate_tls_config(tls: &TlsConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, path) in [
            ("cert_path", Some(&tls.cert_path)),
            ("key_path", Some(&tls.key_path)),
            ("client_ca_path", tls.client_ca_path.as_ref()),
        ] {
            let Some(path) = path else { continue };
            if path.is_empty() {
                errors.push(ValidationError::InvalidTls {
                    message: format!("{field} is empty"),
                });
            } else if !Path::new(path).exists() {
                errors.push(ValidationError::InvalidTls {
                    message: format!("{field} '{path}' does not exist"),
                });
            }
        }
        errors
    }

    fn file_exists(path: &str, field: &str) -> ValidationResult<()> {
        if Path::new(path).exists() {
            Ok(())
        } else {
            Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("File '{path}' does not exist"),
            })
        }
    }

    /// Names are unique across channels; socket channels may not share a listening address.
    fn check_channel_conflicts(channels: &[ChannelConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let mut names: HashMap<&str, usize> = HashMap::new();
        for channel in channels {
            *names.entry(channel.name.as_str()).or_default() += 1;
        }
        let mut duplicated: Vec<_> = names.into_iter().filter(|(_, n)| *n > 1).collect();
        duplicated.sort();
        for (name, count) in duplicated {
            errors.push(ValidationError::ChannelConflict {
                message: format!("channel name '{name}' is used {count} times"),
            });
        }

        let mut bound: HashMap<(&str, u16), &str> = HashMap::new();
        for channel in channels
            .iter()
            .filter(|c| matches!(c.channel_type, ChannelType::Tcp | ChannelType::Tls))
        {
            let (Some(host), Some(port)) = (channel.tcp_host.as_deref(), channel.tcp_port) else {
                continue;
            };
            if let Some(previous) = bound.insert((host, port), channel.name.as_str()) {
                errors.push(ValidationError::ChannelConflict {
                    message: format!(
                        "channels '{previous}' and '{}' both listen on {host}:{port}",
                        channel.name
                    ),
                });
            }
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {error}\n", i + 1));
        }
        message
    }
}
