use crate::error::{DevServeError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Output key of the primary entry module.
pub const PRIMARY_ENTRY_KEY: &str = "index";

const VIRTUAL_ENTRY_FILE: &str = "virtual-entry.mjs";

/// The primary entry module, either on disk or composed in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    File(PathBuf),
    Virtual {
        contents: String,
        /// Directory that anchors options and optional-file lookups.
        resolve_dir: PathBuf,
    },
}

impl EntrySource {
    /// Directory the entry module belongs to.
    pub fn directory(&self) -> &Path {
        match self {
            EntrySource::File(path) => path.parent().unwrap_or_else(|| Path::new(".")),
            EntrySource::Virtual { resolve_dir, .. } => resolve_dir,
        }
    }
}

/// A discovered tool module and its generated output key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    /// `tools/<uuid>`
    pub key: String,
    pub path: PathBuf,
}

impl ToolEntry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            key: format!("tools/{}", uuid::Uuid::new_v4()),
            path,
        }
    }

    /// Module specifier of the emitted chunk, relative to the output root.
    pub fn chunk_specifier(&self) -> String {
        format!("./{}.mjs", self.key)
    }
}

/// Every module the engine bundles, keyed by output name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMap {
    pub primary: EntrySource,
    pub tools: Vec<ToolEntry>,
}

impl EntryMap {
    pub fn new(primary: EntrySource, tools: Vec<ToolEntry>) -> Self {
        Self { primary, tools }
    }
}

/// Platform options handed to the engine in write mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub platform: String,
    pub format: String,
    pub sourcemap: bool,
    /// Extra specifiers kept out of the bundle besides installed packages.
    pub externals: Vec<String>,
    pub define: BTreeMap<String, String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            platform: "node".to_string(),
            format: "esm".to_string(),
            sourcemap: false,
            externals: Vec::new(),
            define: BTreeMap::new(),
        }
    }
}

/// The opaque module bundler.
#[async_trait]
pub trait BundleEngine: Send + Sync {
    /// Return every import specifier the entries leave external.
    async fn analyze(&self, entries: &EntryMap, build_dir: &Path) -> Result<Vec<String>>;

    /// Emit `index.mjs` and one `tools/<uuid>.mjs` chunk per tool into
    /// `output_dir`, returning the written files.
    async fn write(
        &self,
        entries: &EntryMap,
        options: &EngineOptions,
        build_dir: &Path,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Compile one standalone module to `target`, returning the import
    /// specifiers it leaves external.
    async fn compile_module(
        &self,
        source: &Path,
        options: &EngineOptions,
        build_dir: &Path,
        target: &Path,
    ) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    outputs: BTreeMap<String, MetaOutput>,
}

#[derive(Debug, Deserialize)]
struct MetaOutput {
    #[serde(default)]
    imports: Vec<MetaImport>,
}

#[derive(Debug, Deserialize)]
struct MetaImport {
    path: String,
    #[serde(default)]
    external: bool,
}

/// Drives the `esbuild` executable.
pub struct EsbuildEngine {
    binary: PathBuf,
}

impl EsbuildEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Prefer the project's local esbuild, falling back to `PATH`.
    pub fn locate(project_root: &Path, configured: Option<&Path>) -> Self {
        if let Some(path) = configured {
            return Self::new(path);
        }
        let local = project_root.join("node_modules").join(".bin").join("esbuild");
        if local.is_file() {
            Self::new(local)
        } else {
            Self::new("esbuild")
        }
    }

    async fn entry_args(entries: &EntryMap, build_dir: &Path) -> Result<Vec<String>> {
        let primary = match &entries.primary {
            EntrySource::File(path) => path.clone(),
            EntrySource::Virtual { contents, .. } => {
                tokio::fs::create_dir_all(build_dir).await?;
                let path = build_dir.join(VIRTUAL_ENTRY_FILE);
                tokio::fs::write(&path, contents).await?;
                path
            }
        };

        let mut args = vec![format!("{PRIMARY_ENTRY_KEY}={}", primary.display())];
        args.extend(
            entries
                .tools
                .iter()
                .map(|tool| format!("{}={}", tool.key, tool.path.display())),
        );
        Ok(args)
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DevServeError::EngineError(format!(
                    "Failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            return Err(DevServeError::EngineError(format!(
                "{} exited with {:?}: {}",
                self.binary.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn read_metafile(path: &Path) -> Result<Metafile> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// External import paths recorded in a metafile, in first-seen order.
fn external_imports(metafile: &Metafile) -> Vec<String> {
    let mut externals: Vec<String> = Vec::new();
    for output in metafile.outputs.values() {
        for import in output.imports.iter().filter(|i| i.external) {
            if !externals.contains(&import.path) {
                externals.push(import.path.clone());
            }
        }
    }
    externals
}

#[async_trait]
impl BundleEngine for EsbuildEngine {
    async fn analyze(&self, entries: &EntryMap, build_dir: &Path) -> Result<Vec<String>> {
        let metafile = build_dir.join("analyze-meta.json");
        let mut args = Self::entry_args(entries, build_dir).await?;
        args.extend([
            "--bundle".to_string(),
            "--platform=node".to_string(),
            "--format=esm".to_string(),
            "--packages=external".to_string(),
            "--log-level=warning".to_string(),
            format!("--outdir={}", build_dir.join("analyze").display()),
            format!("--metafile={}", metafile.display()),
        ]);

        self.run(&args).await?;
        Ok(external_imports(&Self::read_metafile(&metafile).await?))
    }

    async fn write(
        &self,
        entries: &EntryMap,
        options: &EngineOptions,
        build_dir: &Path,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let metafile = build_dir.join("write-meta.json");
        let mut args = Self::entry_args(entries, build_dir).await?;
        args.extend([
            "--bundle".to_string(),
            format!("--platform={}", options.platform),
            format!("--format={}", options.format),
            "--packages=external".to_string(),
            "--out-extension:.js=.mjs".to_string(),
            "--log-level=warning".to_string(),
            format!("--outdir={}", output_dir.display()),
            format!("--metafile={}", metafile.display()),
        ]);
        if options.sourcemap {
            args.push("--sourcemap".to_string());
        }
        args.extend(options.externals.iter().map(|e| format!("--external:{e}")));
        args.extend(options.define.iter().map(|(k, v)| format!("--define:{k}={v}")));

        self.run(&args).await?;

        let written = Self::read_metafile(&metafile).await?;
        Ok(written.outputs.keys().map(PathBuf::from).collect())
    }

    async fn compile_module(
        &self,
        source: &Path,
        options: &EngineOptions,
        build_dir: &Path,
        target: &Path,
    ) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(build_dir).await?;
        let metafile = build_dir.join("module-meta.json");
        let mut args = vec![
            source.display().to_string(),
            "--bundle".to_string(),
            format!("--platform={}", options.platform),
            format!("--format={}", options.format),
            "--packages=external".to_string(),
            "--log-level=warning".to_string(),
            format!("--outfile={}", target.display()),
            format!("--metafile={}", metafile.display()),
        ];
        if options.sourcemap {
            args.push("--sourcemap".to_string());
        }

        self.run(&args).await?;
        Ok(external_imports(&Self::read_metafile(&metafile).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tool_keys_are_unique() {
        let a = ToolEntry::new(PathBuf::from("src/tools/a/index.ts"));
        let b = ToolEntry::new(PathBuf::from("other/tools/a/index.ts"));

        assert!(a.key.starts_with("tools/"));
        assert_ne!(a.key, b.key);
        assert_eq!(a.chunk_specifier(), format!("./{}.mjs", a.key));
    }

    #[test]
    fn test_external_imports_from_metafile() {
        let json = r#"{
            "inputs": {},
            "outputs": {
                "out/index.mjs": {
                    "imports": [
                        {"path": "left-pad", "kind": "import-statement", "external": true},
                        {"path": "out/chunk.mjs", "kind": "import-statement"},
                        {"path": "node:fs", "kind": "import-statement", "external": true}
                    ]
                },
                "out/tools/x.mjs": {
                    "imports": [
                        {"path": "left-pad", "kind": "import-statement", "external": true},
                        {"path": "@scope/pkg/sub", "kind": "require-call", "external": true}
                    ]
                }
            }
        }"#;
        let metafile: Metafile = serde_json::from_str(json).unwrap();

        assert_eq!(
            external_imports(&metafile),
            vec!["left-pad", "node:fs", "@scope/pkg/sub"]
        );
    }

    #[tokio::test]
    async fn test_virtual_entry_is_materialized() {
        let temp_dir = TempDir::new().unwrap();
        let entries = EntryMap::new(
            EntrySource::Virtual {
                contents: "export const app = 1;".to_string(),
                resolve_dir: temp_dir.path().to_path_buf(),
            },
            vec![ToolEntry {
                key: "tools/abc".to_string(),
                path: PathBuf::from("/src/tools/abc.ts"),
            }],
        );
        let build_dir = temp_dir.path().join(".build");

        let args = EsbuildEngine::entry_args(&entries, &build_dir).await.unwrap();

        let virtual_path = build_dir.join(VIRTUAL_ENTRY_FILE);
        assert_eq!(args[0], format!("index={}", virtual_path.display()));
        assert_eq!(args[1], "tools/abc=/src/tools/abc.ts");
        assert_eq!(
            std::fs::read_to_string(virtual_path).unwrap(),
            "export const app = 1;"
        );
    }

    #[test]
    fn test_entry_directory() {
        let file = EntrySource::File(PathBuf::from("/app/src/mastra/index.ts"));
        assert_eq!(file.directory(), Path::new("/app/src/mastra"));

        let virt = EntrySource::Virtual {
            contents: String::new(),
            resolve_dir: PathBuf::from("/app"),
        };
        assert_eq!(virt.directory(), Path::new("/app"));
    }
}
