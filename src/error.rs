#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_process_error_creation() {
        let error = DevServeError::ProcessError("test process error".to_string());
        assert_eq!(error.to_string(), "Process error: test process error");
    }

    #[test]
    fn test_config_error_creation() {
        let error = DevServeError::ConfigError("invalid config".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: DevServeError = io_error.into();
        assert!(matches!(error, DevServeError::IoError(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let invalid_toml = "invalid = [toml";
        let toml_error = toml::from_str::<toml::Value>(invalid_toml).unwrap_err();
        let error: DevServeError = toml_error.into();
        assert!(matches!(error, DevServeError::ConfigError(_)));
    }

    #[test]
    fn test_bundle_error_kind_ids_are_stable() {
        assert_eq!(BundleErrorKind::AnalyzeFailed.id(), "DEPLOYER_BUNDLER_ANALYZE_FAILED");
        assert_eq!(BundleErrorKind::TelemetryFailed.id(), "DEPLOYER_BUNDLER_TELEMETRY_FAILED");
        assert_eq!(
            BundleErrorKind::InstrumentationFailed.id(),
            "DEPLOYER_BUNDLER_INSTRUMENTATION_FAILED"
        );
        assert_eq!(
            BundleErrorKind::WorkspaceDepsFailed.id(),
            "DEPLOYER_BUNDLER_WORKSPACE_DEPS_FAILED"
        );
        assert_eq!(
            BundleErrorKind::BundleStageFailed.id(),
            "DEPLOYER_BUNDLER_BUNDLE_STAGE_FAILED"
        );
    }

    #[test]
    fn test_bundle_error_categories() {
        assert_eq!(BundleErrorKind::WorkspaceDepsFailed.category(), ErrorCategory::User);
        for kind in [
            BundleErrorKind::AnalyzeFailed,
            BundleErrorKind::TelemetryFailed,
            BundleErrorKind::InstrumentationFailed,
            BundleErrorKind::BundleStageFailed,
        ] {
            assert_eq!(kind.category(), ErrorCategory::System);
            assert_eq!(kind.domain(), ErrorDomain::Deployer);
        }
    }

    #[test]
    fn test_bundle_error_keeps_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let error = BundleError::new(
            BundleErrorKind::InstrumentationFailed,
            "Failed to write instrumentation file",
            cause,
        );

        assert_eq!(error.kind(), BundleErrorKind::InstrumentationFailed);
        assert!(error.source().unwrap().to_string().contains("read-only fs"));

        let wrapped: DevServeError = error.into();
        assert_eq!(wrapped.error_code(), "DEPLOYER_BUNDLER_INSTRUMENTATION_FAILED");
        assert_eq!(wrapped.category(), ErrorCategory::System);
    }

    #[test]
    fn test_server_start_failure_is_fatal_system_error() {
        let error = DevServeError::ServerStartFailed {
            exit_code: Some(1),
            stderr: "SyntaxError: Unexpected token".to_string(),
        };
        assert!(error.to_string().contains("SyntaxError"));
        assert_eq!(error.error_code(), "SERVER_START_FAILED");
        assert_eq!(error.category(), ErrorCategory::System);
    }
}

use std::fmt;
use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Subsystem an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Deployer,
    Supervisor,
    Config,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Deployer => write!(f, "DEPLOYER"),
            ErrorDomain::Supervisor => write!(f, "SUPERVISOR"),
            ErrorDomain::Config => write!(f, "CONFIG"),
        }
    }
}

/// Whether an error was caused by the user's project or by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "USER"),
            ErrorCategory::System => write!(f, "SYSTEM"),
        }
    }
}

/// Stages of the bundle pipeline that fail with their own identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleErrorKind {
    AnalyzeFailed,
    TelemetryFailed,
    InstrumentationFailed,
    WorkspaceDepsFailed,
    BundleStageFailed,
}

impl BundleErrorKind {
    pub fn id(&self) -> &'static str {
        match self {
            BundleErrorKind::AnalyzeFailed => "DEPLOYER_BUNDLER_ANALYZE_FAILED",
            BundleErrorKind::TelemetryFailed => "DEPLOYER_BUNDLER_TELEMETRY_FAILED",
            BundleErrorKind::InstrumentationFailed => "DEPLOYER_BUNDLER_INSTRUMENTATION_FAILED",
            BundleErrorKind::WorkspaceDepsFailed => "DEPLOYER_BUNDLER_WORKSPACE_DEPS_FAILED",
            BundleErrorKind::BundleStageFailed => "DEPLOYER_BUNDLER_BUNDLE_STAGE_FAILED",
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        ErrorDomain::Deployer
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BundleErrorKind::WorkspaceDepsFailed => ErrorCategory::User,
            BundleErrorKind::AnalyzeFailed
            | BundleErrorKind::TelemetryFailed
            | BundleErrorKind::InstrumentationFailed
            | BundleErrorKind::BundleStageFailed => ErrorCategory::System,
        }
    }
}

/// A failed bundle pipeline stage, with the underlying cause attached.
#[derive(Error, Debug)]
#[error("[{}] {message}", .kind.id())]
pub struct BundleError {
    kind: BundleErrorKind,
    message: String,
    #[source]
    source: BoxedCause,
}

impl BundleError {
    pub fn new(
        kind: BundleErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxedCause>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> BundleErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Error, Debug)]
pub enum DevServeError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Server failed to start (exit code {exit_code:?}): {stderr}")]
    ServerStartFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Entry module not found: {0}")]
    EntryNotFound(String),

    #[error("Workspace error: {0}")]
    WorkspaceError(String),

    #[error("Bundle engine error: {0}")]
    EngineError(String),

    #[error("Dependency installation failed: {0}")]
    InstallError(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<toml::de::Error> for DevServeError {
    fn from(error: toml::de::Error) -> Self {
        DevServeError::ConfigError(error.to_string())
    }
}

impl From<notify::Error> for DevServeError {
    fn from(error: notify::Error) -> Self {
        DevServeError::WatchError(error.to_string())
    }
}

impl From<glob::PatternError> for DevServeError {
    fn from(error: glob::PatternError) -> Self {
        DevServeError::ConfigError(format!("Invalid glob pattern: {error}"))
    }
}

impl DevServeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DevServeError::Bundle(e) => e.kind().id(),
            DevServeError::ProcessError(_) => "PROCESS_ERROR",
            DevServeError::ServerStartFailed { .. } => "SERVER_START_FAILED",
            DevServeError::ConfigError(_) => "CONFIG_ERROR",
            DevServeError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            DevServeError::WorkspaceError(_) => "WORKSPACE_ERROR",
            DevServeError::EngineError(_) => "ENGINE_ERROR",
            DevServeError::InstallError(_) => "INSTALL_ERROR",
            DevServeError::WatchError(_) => "WATCH_ERROR",
            DevServeError::IoError(_) => "IO_ERROR",
            DevServeError::JsonError(_) => "JSON_ERROR",
            DevServeError::HttpError(_) => "HTTP_ERROR",
            DevServeError::ConnectionError(_) => "CONNECTION_ERROR",
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        match self {
            DevServeError::Bundle(e) => e.kind().domain(),
            DevServeError::ProcessError(_)
            | DevServeError::ServerStartFailed { .. }
            | DevServeError::ConnectionError(_)
            | DevServeError::HttpError(_) => ErrorDomain::Supervisor,
            DevServeError::ConfigError(_) | DevServeError::WatchError(_) => ErrorDomain::Config,
            _ => ErrorDomain::Deployer,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DevServeError::Bundle(e) => e.kind().category(),
            DevServeError::ConfigError(_)
            | DevServeError::EntryNotFound(_)
            | DevServeError::WorkspaceError(_) => ErrorCategory::User,
            _ => ErrorCategory::System,
        }
    }
}

pub type Result<T> = std::result::Result<T, DevServeError>;
