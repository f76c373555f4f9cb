use thiserror::Error;

/// Where a crate-level error originated.
///
/// This is diagnostic context for configuration and runtime errors raised by
/// the crate itself. Per-attempt traceability for collaborator failures lives in
/// [`crate::types::ErrorContext`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorSite {
    /// Field path or configuration key that caused the error (e.g., "services.fetcher.retry.max_delay_ms")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "circuit_breaker")
    pub source: Option<String>,
}

impl ErrorSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the crate's own failures.
///
/// Collaborator failures never surface as this type: they are captured as
/// [`crate::types::CrawlerError`] values inside the run report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_site(.site))]
    Configuration { message: String, site: ErrorSite },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_site(site: &ErrorSite) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = site.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = site.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = site.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration_with_site(msg: impl Into<String>, site: ErrorSite) -> Self {
        Error::Configuration {
            message: msg.into(),
            site,
        }
    }

    /// Shorthand for a configuration error pinned to a field path.
    pub fn invalid_field(field_path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::configuration_with_site(
            msg,
            ErrorSite::new()
                .with_field_path(field_path)
                .with_source("config_validator"),
        )
    }

    /// Prefix the field path (if any) with an enclosing section, e.g.
    /// `retry.base_delay_ms` -> `services.fetcher.retry.base_delay_ms`.
    pub fn within(mut self, prefix: &str) -> Self {
        if let Error::Configuration { ref mut site, .. } = self {
            site.field_path = Some(match site.field_path.take() {
                Some(path) => format!("{}.{}", prefix, path),
                None => prefix.to_string(),
            });
        }
        self
    }

    pub fn site(&self) -> Option<&ErrorSite> {
        match self {
            Error::Configuration { site, .. } => Some(site),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_site() {
        let err = Error::invalid_field("services.fetcher.retry.backoff_multiplier", "must be > 1");
        let text = err.to_string();
        assert!(text.starts_with("Configuration error: must be > 1"));
        assert!(text.contains("field: services.fetcher.retry.backoff_multiplier"));
        assert!(text.contains("source: config_validator"));
    }

    #[test]
    fn within_prefixes_field_path() {
        let err = Error::invalid_field("retry.base_delay_ms", "must be positive").within("services.embedder");
        assert_eq!(
            err.site().and_then(|s| s.field_path.as_deref()),
            Some("services.embedder.retry.base_delay_ms")
        );
    }

    #[test]
    fn display_without_site_has_no_suffix() {
        let err = Error::configuration_with_site("no fetcher configured", ErrorSite::new());
        assert_eq!(err.to_string(), "Configuration error: no fetcher configured");
        assert!(err.site().is_some());
    }

    #[test]
    fn io_errors_carry_no_site() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.to_string(), "I/O error: gone");
        assert!(err.site().is_none());
    }
}
