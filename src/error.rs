use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Browser instance unavailable")]
    BrowserUnavailable,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Content extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Request interception failed: {0}")]
    InterceptionFailed(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Transform worker pool is closed")]
    WorkerPoolClosed,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RenderError {
    /// Navigation timeouts are expected and never abort a render.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RenderError::NavigationTimeout(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RenderError::NavigationTimeout(_) => ErrorSeverity::Low,
            RenderError::BrowserUnavailable => ErrorSeverity::Low,
            RenderError::ConfigurationError(_) => ErrorSeverity::High,
            RenderError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            RenderError::WorkerPoolClosed => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::SerializationError(err.to_string())
    }
}

impl From<regex::Error> for RenderError {
    fn from(err: regex::Error) -> Self {
        RenderError::ConfigurationError(err.to_string())
    }
}

impl From<url::ParseError> for RenderError {
    fn from(err: url::ParseError) -> Self {
        RenderError::InvalidUrl(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RenderError::PageError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(RenderError::NavigationTimeout(Duration::from_secs(3)).is_timeout());
        assert!(!RenderError::NavigationFailed("net::ERR_NAME_NOT_RESOLVED".to_string()).is_timeout());
        assert!(!RenderError::BrowserUnavailable.is_timeout());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(RenderError::NavigationTimeout(Duration::from_secs(1)).severity(), ErrorSeverity::Low);
        assert_eq!(RenderError::PageError("closed".to_string()).severity(), ErrorSeverity::Medium);
        assert_eq!(RenderError::ConfigurationError("bad".to_string()).severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: RenderError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, RenderError::IoError(msg) if msg.contains("missing")));
    }
}
