//! Per-route path rewriting.
//!
//! A route either replaces the inbound path with a literal (`path`), applies a sed-style
//! substitution (`path_transform`), or forwards the path untouched. Substitution rules are
//! parsed once when the configuration is compiled; [`PathRewrite::apply`] is a pure function.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathTransformError {
    #[error("path transform must start with 's/': {0}")]
    MissingPrefix(String),

    #[error("path transform has an empty pattern: {0}")]
    EmptyPattern(String),

    #[error("unsupported path transform flags '{flags}' in {rule}")]
    UnsupportedFlags { rule: String, flags: String },

    #[error("path transform has too many segments: {0}")]
    TooManySegments(String),

    #[error("route sets both 'path' and 'path_transform'")]
    Conflict,
}

/// A parsed `s/<pattern>/<replacement>[/g]` rule.
///
/// `pattern` is a plain substring, not a regular expression. `\/` inside either part stands
/// for a literal slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTransform {
    pattern: String,
    replacement: String,
    global: bool,
}

impl PathTransform {
    pub fn parse(rule: &str) -> Result<Self, PathTransformError> {
        let body = rule
            .strip_prefix("s/")
            .ok_or_else(|| PathTransformError::MissingPrefix(rule.to_string()))?;

        let segments = split_unescaped(body);
        if segments.len() > 3 {
            return Err(PathTransformError::TooManySegments(rule.to_string()));
        }

        let pattern = segments.first().map(|s| unescape(s)).unwrap_or_default();
        if pattern.is_empty() {
            return Err(PathTransformError::EmptyPattern(rule.to_string()));
        }
        let replacement = segments.get(1).map(|s| unescape(s)).unwrap_or_default();

        let global = match segments.get(2).map(String::as_str) {
            None | Some("") => false,
            Some("g") => true,
            Some(flags) => {
                return Err(PathTransformError::UnsupportedFlags {
                    rule: rule.to_string(),
                    flags: flags.to_string(),
                });
            }
        };

        Ok(Self {
            pattern,
            replacement,
            global,
        })
    }

    pub fn apply(&self, path: &str) -> String {
        if self.global {
            path.replace(&self.pattern, &self.replacement)
        } else {
            path.replacen(&self.pattern, &self.replacement, 1)
        }
    }
}

/// Split on `/` that is not preceded by a backslash. Escapes are kept for [`unescape`].
fn split_unescaped(body: &str) -> Vec<String> {
    let mut segments = vec![String::new()];
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'/') => {
                chars.next();
                if let Some(current) = segments.last_mut() {
                    current.push_str("\\/");
                }
            }
            '/' => segments.push(String::new()),
            other => {
                if let Some(current) = segments.last_mut() {
                    current.push(other);
                }
            }
        }
    }

    segments
}

fn unescape(segment: &str) -> String {
    segment.replace("\\/", "/")
}

/// How a route derives the upstream path from the inbound one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PathRewrite {
    #[default]
    Passthrough,
    Literal(String),
    Substitute(PathTransform),
}

impl PathRewrite {
    /// Build from the two mutually exclusive route settings.
    pub fn from_route(
        path: Option<&str>,
        path_transform: Option<&str>,
    ) -> Result<Self, PathTransformError> {
        match (path, path_transform) {
            (Some(_), Some(_)) => Err(PathTransformError::Conflict),
            (Some(literal), None) => Ok(PathRewrite::Literal(literal.to_string())),
            (None, Some(rule)) => Ok(PathRewrite::Substitute(PathTransform::parse(rule)?)),
            (None, None) => Ok(PathRewrite::Passthrough),
        }
    }

    pub fn apply(&self, original: &str) -> String {
        match self {
            PathRewrite::Passthrough => original.to_string(),
            PathRewrite::Literal(path) => path.clone(),
            PathRewrite::Substitute(transform) => transform.apply(original),
        }
    }
}

/// Apply a substitution rule to a path in one step.
pub fn transform_path(path: &str, rule: &str) -> Result<String, PathTransformError> {
    Ok(PathTransform::parse(rule)?.apply(path))
}
