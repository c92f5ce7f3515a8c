//! Files written into the output tree next to the engine's chunks.

use crate::bundler::analyzer;
use crate::bundler::deps::DependencyInstallSet;
use crate::bundler::engine::{BundleEngine, EngineOptions, ToolEntry};
use crate::bundler::workspace::ResolutionSet;
use crate::config::entry::{ExportKind, OtlpProtocol, TelemetryOptions};
use crate::error::{DevServeError, Result};
use crate::fsutil;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const INSTRUMENTATION_FILE: &str = "instrumentation.mjs";
pub const TELEMETRY_CONFIG_FILE: &str = "telemetry-config.mjs";
pub const TOOLS_FILE: &str = "tools.mjs";
pub const MANIFEST_FILE: &str = "package.json";

const INSTRUMENTATION_TEMPLATE: &str = include_str!("instrumentation-template.js");

const START_SCRIPT: &str =
    "node --import=./instrumentation.mjs --import=@opentelemetry/instrumentation/hook.mjs ./index.mjs";

/// Custom instrumentation module next to the entry, if the project has one.
pub fn custom_instrumentation(entry_dir: &Path) -> Option<PathBuf> {
    fsutil::first_existing_file(&[
        entry_dir.join("instrumentation.js"),
        entry_dir.join("instrumentation.ts"),
        entry_dir.join("instrumentation.mjs"),
    ])
}

/// Write `instrumentation.mjs`, from the built-in template or by compiling the
/// project's custom module. Returns the packages the custom module imports.
pub async fn write_instrumentation(
    engine: &dyn BundleEngine,
    options: &EngineOptions,
    entry_dir: &Path,
    build_dir: &Path,
    output_dir: &Path,
) -> Result<Vec<String>> {
    let target = output_dir.join(INSTRUMENTATION_FILE);

    let Some(custom) = custom_instrumentation(entry_dir) else {
        tokio::fs::write(&target, INSTRUMENTATION_TEMPLATE).await?;
        return Ok(Vec::new());
    };

    info!("Using custom instrumentation from {}", custom.display());
    let imports = engine
        .compile_module(&custom, options, build_dir, &target)
        .await?;
    Ok(analyzer::package_names(imports))
}

/// Write `telemetry-config.mjs` and return the exporter packages it needs.
pub async fn write_telemetry_config(
    options: &TelemetryOptions,
    output_dir: &Path,
) -> Result<Vec<String>> {
    if let Some(ratio) = options.sampling_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(DevServeError::ConfigError(format!(
                "telemetry.sampling_ratio must be between 0 and 1, got {ratio}"
            )));
        }
    }

    let mut packages = Vec::new();
    let export = match &options.export {
        None => serde_json::Value::Null,
        Some(export) => {
            match export.kind {
                ExportKind::Otlp => packages.push(
                    match export.protocol.unwrap_or(OtlpProtocol::Http) {
                        OtlpProtocol::Grpc => "@opentelemetry/exporter-trace-otlp-grpc",
                        OtlpProtocol::Http => "@opentelemetry/exporter-trace-otlp-http",
                    }
                    .to_string(),
                ),
                ExportKind::Custom => {
                    let package = export.package.clone().ok_or_else(|| {
                        DevServeError::ConfigError(
                            "telemetry.export.package is required for custom exporters".to_string(),
                        )
                    })?;
                    packages.push(package);
                }
                ExportKind::Console => {}
            }
            json!({
                "type": export.kind,
                "protocol": export.protocol,
                "endpoint": export.endpoint,
                "headers": export.headers,
                "package": export.package,
            })
        }
    };

    let config = json!({
        "enabled": options.enabled,
        "serviceName": options.service_name,
        "samplingRatio": options.sampling_ratio,
        "export": export,
    });
    let content = format!(
        "export const telemetry = {};\n",
        serde_json::to_string_pretty(&config)?
    );
    tokio::fs::write(output_dir.join(TELEMETRY_CONFIG_FILE), content).await?;

    Ok(packages)
}

/// Source of `tools.mjs`: every tool chunk imported by key, exported in
/// discovery order.
pub fn render_tools_module(tools: &[ToolEntry]) -> String {
    let mut source = String::new();
    for (i, tool) in tools.iter().enumerate() {
        source.push_str(&format!(
            "import * as tool{i} from '{}';\n",
            tool.chunk_specifier()
        ));
    }
    let names: Vec<String> = (0..tools.len()).map(|i| format!("tool{i}")).collect();
    source.push_str(&format!("\nexport const tools = [{}];\n", names.join(", ")));
    source
}

pub async fn write_tools_module(tools: &[ToolEntry], output_dir: &Path) -> Result<()> {
    tokio::fs::write(output_dir.join(TOOLS_FILE), render_tools_module(tools)).await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PnpmSettings {
    pub never_built_dependencies: Vec<String>,
}

/// The output tree's `package.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(rename = "type")]
    pub module_type: String,
    pub main: String,
    pub scripts: BTreeMap<String, String>,
    pub author: String,
    pub license: String,
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<BTreeMap<String, String>>,
    pub pnpm: PnpmSettings,
}

impl DeploymentManifest {
    pub fn new(install_set: &DependencyInstallSet, resolutions: &ResolutionSet) -> Self {
        Self {
            name: "server".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            module_type: "module".to_string(),
            main: "index.mjs".to_string(),
            scripts: BTreeMap::from([("start".to_string(), START_SCRIPT.to_string())]),
            author: "devserve".to_string(),
            license: "ISC".to_string(),
            dependencies: install_set.to_manifest_map(),
            resolutions: (!resolutions.is_empty()).then(|| resolutions.clone()),
            pnpm: PnpmSettings {
                never_built_dependencies: Vec::new(),
            },
        }
    }

    pub async fn write(&self, output_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(output_dir.join(MANIFEST_FILE), content).await?;
        Ok(())
    }
}

/// Copy `public/` from the entry directory and `.npmrc` from the project
/// root. Missing sources are skipped.
pub fn copy_static_assets(entry_dir: &Path, project_root: &Path, output_dir: &Path) -> Result<()> {
    let public = entry_dir.join("public");
    if public.is_dir() {
        let copied = fsutil::copy_dir_all(&public, output_dir)?;
        debug!("Copied {copied} public files");
    }

    if let Some(npmrc) = fsutil::first_existing_file(&[project_root.join(".npmrc")]) {
        std::fs::copy(npmrc, output_dir.join(".npmrc"))?;
        debug!("Copied .npmrc");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::engine::EntryMap;
    use crate::config::entry::ExportOptions;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records compiled modules and reports fixed imports.
    #[derive(Default)]
    struct CompilingEngine {
        compiled: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl BundleEngine for CompilingEngine {
        async fn analyze(&self, _entries: &EntryMap, _build_dir: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn write(
            &self,
            _entries: &EntryMap,
            _options: &EngineOptions,
            _build_dir: &Path,
            _output_dir: &Path,
        ) -> Result<Vec<PathBuf>> {
            Ok(Vec::new())
        }

        async fn compile_module(
            &self,
            source: &Path,
            _options: &EngineOptions,
            _build_dir: &Path,
            target: &Path,
        ) -> Result<Vec<String>> {
            self.compiled.lock().unwrap().push(source.to_path_buf());
            std::fs::write(target, "export {};\n")?;
            Ok(vec![
                "@opentelemetry/sdk-node".to_string(),
                "@acme/tracing/setup".to_string(),
                "node:process".to_string(),
                "./helpers.js".to_string(),
            ])
        }
    }

    fn tool(key: &str) -> ToolEntry {
        ToolEntry {
            key: key.to_string(),
            path: PathBuf::from(format!("/src/{key}.ts")),
        }
    }

    #[test]
    fn test_tools_module_preserves_order() {
        let source = render_tools_module(&[tool("tools/b"), tool("tools/a")]);

        assert_eq!(
            source,
            "import * as tool0 from './tools/b.mjs';\n\
             import * as tool1 from './tools/a.mjs';\n\
             \nexport const tools = [tool0, tool1];\n"
        );
    }

    #[test]
    fn test_empty_tools_module() {
        assert_eq!(render_tools_module(&[]), "\nexport const tools = [];\n");
    }

    #[test]
    fn test_manifest_resolutions_only_when_present() {
        let set = DependencyInstallSet::with_baseline();

        let manifest = DeploymentManifest::new(&set, &ResolutionSet::new());
        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json.get("resolutions").is_none());
        assert_eq!(json["type"], "module");
        assert_eq!(json["main"], "index.mjs");
        assert_eq!(json["pnpm"]["neverBuiltDependencies"], json!([]));
        assert_eq!(json["dependencies"]["@opentelemetry/sdk-node"], "^0.201.0");

        let mut resolutions = ResolutionSet::new();
        resolutions.insert(
            "@acme/shared".to_string(),
            "./workspace-module/acme-shared-1.0.0.tgz".to_string(),
        );
        let manifest = DeploymentManifest::new(&set, &resolutions);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            json["resolutions"]["@acme/shared"],
            "./workspace-module/acme-shared-1.0.0.tgz"
        );
    }

    #[tokio::test]
    async fn test_instrumentation_template_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let entry_dir = temp_dir.path().join("src");
        let output = temp_dir.path().join("output");
        std::fs::create_dir_all(&entry_dir).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        let engine = CompilingEngine::default();
        let packages = write_instrumentation(
            &engine,
            &EngineOptions::default(),
            &entry_dir,
            &temp_dir.path().join(".build"),
            &output,
        )
        .await
        .unwrap();

        let content = std::fs::read_to_string(output.join(INSTRUMENTATION_FILE)).unwrap();
        assert!(content.contains("NodeSDK"));
        assert!(packages.is_empty());
        assert!(engine.compiled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_instrumentation_is_compiled() {
        let temp_dir = TempDir::new().unwrap();
        let entry_dir = temp_dir.path().join("src");
        let output = temp_dir.path().join("output");
        std::fs::create_dir_all(&entry_dir).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(entry_dir.join("instrumentation.ts"), "const ratio: number = 0.5;").unwrap();

        let engine = CompilingEngine::default();
        let packages = write_instrumentation(
            &engine,
            &EngineOptions::default(),
            &entry_dir,
            &temp_dir.path().join(".build"),
            &output,
        )
        .await
        .unwrap();

        assert_eq!(
            *engine.compiled.lock().unwrap(),
            vec![entry_dir.join("instrumentation.ts")]
        );
        assert_eq!(
            std::fs::read_to_string(output.join(INSTRUMENTATION_FILE)).unwrap(),
            "export {};\n"
        );
        assert_eq!(packages, vec!["@opentelemetry/sdk-node", "@acme/tracing"]);
    }

    #[tokio::test]
    async fn test_telemetry_config_exporter_packages() {
        let temp_dir = TempDir::new().unwrap();
        let options = TelemetryOptions {
            service_name: Some("weather".to_string()),
            export: Some(ExportOptions {
                kind: ExportKind::Custom,
                protocol: None,
                endpoint: Some("https://collector.example.com".to_string()),
                headers: BTreeMap::new(),
                package: Some("@acme/exporter".to_string()),
            }),
            ..Default::default()
        };

        let packages = write_telemetry_config(&options, temp_dir.path()).await.unwrap();
        assert_eq!(packages, vec!["@acme/exporter"]);

        let content = std::fs::read_to_string(temp_dir.path().join(TELEMETRY_CONFIG_FILE)).unwrap();
        assert!(content.starts_with("export const telemetry = {"));
        assert!(content.contains("\"serviceName\": \"weather\""));
    }

    #[tokio::test]
    async fn test_telemetry_config_rejects_bad_sampling_ratio() {
        let temp_dir = TempDir::new().unwrap();
        let options = TelemetryOptions {
            sampling_ratio: Some(1.5),
            ..Default::default()
        };

        assert!(write_telemetry_config(&options, temp_dir.path()).await.is_err());
    }

    #[test]
    fn test_missing_static_assets_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("output");
        std::fs::create_dir_all(&output).unwrap();

        copy_static_assets(temp_dir.path(), temp_dir.path(), &output).unwrap();
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);
    }

    #[test]
    fn test_static_assets_are_copied() {
        let temp_dir = TempDir::new().unwrap();
        let entry_dir = temp_dir.path().join("src");
        let output = temp_dir.path().join("output");
        std::fs::create_dir_all(entry_dir.join("public")).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(entry_dir.join("public/robots.txt"), "User-agent: *").unwrap();
        std::fs::write(temp_dir.path().join(".npmrc"), "registry=https://r.example.com").unwrap();

        copy_static_assets(&entry_dir, temp_dir.path(), &output).unwrap();

        assert!(output.join("robots.txt").is_file());
        assert!(output.join(".npmrc").is_file());
    }
}
