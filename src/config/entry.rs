use crate::error::{DevServeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the options file read from the entry module's directory.
pub const ENTRY_OPTIONS_FILE: &str = "devserve.toml";

/// Options the application declares next to its entry module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntryOptions {
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default)]
    pub bundler: EntryBundlerOptions,
    #[serde(default)]
    pub telemetry: TelemetryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerOptions {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntryBundlerOptions {
    #[serde(default)]
    pub sourcemap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryOptions {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,
    pub service_name: Option<String>,
    pub sampling_ratio: Option<f64>,
    pub export: Option<ExportOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportOptions {
    #[serde(rename = "type")]
    pub kind: ExportKind,
    pub protocol: Option<OtlpProtocol>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Exporter package for `type = "custom"`.
    pub package: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Otlp,
    Console,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    Grpc,
    Http,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            service_name: None,
            sampling_ratio: None,
            export: None,
        }
    }
}

fn default_telemetry_enabled() -> bool {
    true
}

impl EntryOptions {
    pub fn options_path(entry_file: &Path) -> PathBuf {
        entry_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(ENTRY_OPTIONS_FILE)
    }

    /// Load the options for an entry module. A missing file means defaults.
    pub async fn load(entry_file: &Path) -> Result<Self> {
        Self::load_from_dir(entry_file.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub async fn load_from_dir(entry_dir: &Path) -> Result<Self> {
        let path = entry_dir.join(ENTRY_OPTIONS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        toml::from_str(&content).map_err(|e| {
            DevServeError::ConfigError(format!("Invalid {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_options_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let entry = temp_dir.path().join("index.ts");

        let options = EntryOptions::load(&entry).await.unwrap();
        assert_eq!(options, EntryOptions::default());
        assert!(options.telemetry.enabled);
        assert!(options.server.port.is_none());
    }

    #[tokio::test]
    async fn test_load_server_and_telemetry_options() {
        let temp_dir = TempDir::new().unwrap();
        let entry = temp_dir.path().join("index.ts");
        std::fs::write(
            temp_dir.path().join(ENTRY_OPTIONS_FILE),
            r#"
[server]
port = 6000

[bundler]
sourcemap = true

[telemetry]
service_name = "weather-agent"

[telemetry.export]
type = "otlp"
protocol = "grpc"
endpoint = "http://localhost:4317"
"#,
        )
        .unwrap();

        let options = EntryOptions::load(&entry).await.unwrap();
        assert_eq!(options.server.port, Some(6000));
        assert!(options.bundler.sourcemap);

        let export = options.telemetry.export.unwrap();
        assert_eq!(export.kind, ExportKind::Otlp);
        assert_eq!(export.protocol, Some(OtlpProtocol::Grpc));
    }

    #[tokio::test]
    async fn test_invalid_options_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let entry = temp_dir.path().join("index.ts");
        std::fs::write(temp_dir.path().join(ENTRY_OPTIONS_FILE), "[server\nport = ").unwrap();

        let result = EntryOptions::load(&entry).await;
        assert!(matches!(result, Err(DevServeError::ConfigError(_))));
    }
}
