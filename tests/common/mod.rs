#![allow(dead_code)]

use async_trait::async_trait;
use devserve::bundler::{
    BundleEngine, BundleInput, BundleLayout, Bundler, DevTarget, EngineOptions, EntryMap,
    EntrySource, PackageInstaller, WorkspacePackageMap,
};
use devserve::error::{DevServeError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Engine double: reports a configurable set of externals and writes one
/// placeholder chunk per entry.
#[derive(Default)]
pub struct FakeEngine {
    externals: Mutex<Vec<String>>,
    fail_analyze: bool,
}

impl FakeEngine {
    pub fn with_externals(externals: &[&str]) -> Self {
        Self {
            externals: Mutex::new(externals.iter().map(|s| s.to_string()).collect()),
            fail_analyze: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            externals: Mutex::new(Vec::new()),
            fail_analyze: true,
        }
    }

    pub fn set_externals(&self, externals: &[&str]) {
        *self.externals.lock().unwrap() = externals.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl BundleEngine for FakeEngine {
    async fn analyze(&self, _entries: &EntryMap, _build_dir: &Path) -> Result<Vec<String>> {
        if self.fail_analyze {
            return Err(DevServeError::EngineError("syntax error in index.ts".to_string()));
        }
        Ok(self.externals.lock().unwrap().clone())
    }

    async fn write(
        &self,
        entries: &EntryMap,
        _options: &EngineOptions,
        _build_dir: &Path,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = vec![output_dir.join("index.mjs")];
        std::fs::write(&written[0], "export default {};\n")?;

        std::fs::create_dir_all(output_dir.join("tools"))?;
        for tool in &entries.tools {
            let chunk = output_dir.join(format!("{}.mjs", tool.key));
            std::fs::write(&chunk, format!("// {}\n", tool.path.display()))?;
            written.push(chunk);
        }
        Ok(written)
    }

    /// Drops `: number` annotations and reports the module's imports.
    async fn compile_module(
        &self,
        source: &Path,
        _options: &EngineOptions,
        _build_dir: &Path,
        target: &Path,
    ) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(source)?;
        let mut imports = Vec::new();
        let mut compiled = String::new();
        for line in content.lines() {
            if let Some(rest) = line.trim().strip_prefix("import ") {
                if let Some(specifier) = rest.split(['\'', '"']).nth(1) {
                    imports.push(specifier.to_string());
                }
            }
            compiled.push_str(&line.replace(": number", ""));
            compiled.push('\n');
        }
        std::fs::write(target, compiled)?;
        Ok(imports)
    }
}

/// Counts installs instead of running a package manager.
#[derive(Default)]
pub struct CountingInstaller {
    installs: AtomicUsize,
}

impl CountingInstaller {
    pub fn count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for CountingInstaller {
    async fn install(&self, _output_dir: &Path) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A project tree in a temp directory: `src/server/index.ts` plus whatever
/// the test adds.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub source_dir: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("app");
        let source_dir = root.join("src/server");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("index.ts"), "export const server = {};\n").unwrap();

        Self {
            temp_dir,
            root,
            source_dir,
        }
    }

    pub fn entry(&self) -> PathBuf {
        self.source_dir.join("index.ts")
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Make `name` resolvable from the entry directory, like an installed package.
    pub fn install_package(&self, name: &str, version: &str) {
        self.write(
            &format!("node_modules/{name}/package.json"),
            &serde_json::json!({ "name": name, "version": version }).to_string(),
        );
    }

    pub fn tool(&self, name: &str) {
        self.write(
            &format!("src/server/tools/{name}.ts"),
            "export const tool = {};\n",
        );
    }

    pub fn input(&self) -> BundleInput {
        BundleInput {
            project_root: self.root.clone(),
            entry: EntrySource::File(self.entry()),
            tool_patterns: vec![self
                .source_dir
                .join("tools/**/*.{js,ts}")
                .display()
                .to_string()],
        }
    }

    pub fn layout(&self) -> BundleLayout {
        BundleLayout::for_project(&self.root)
    }

    pub fn bundler(&self, engine: Arc<FakeEngine>) -> Bundler {
        self.bundler_with_workspace(engine, WorkspacePackageMap::default())
    }

    pub fn bundler_with_workspace(
        &self,
        engine: Arc<FakeEngine>,
        workspace_map: WorkspacePackageMap,
    ) -> Bundler {
        Bundler::new(engine, Arc::new(DevTarget), workspace_map, self.layout())
    }

    pub fn read_output(&self, file: &str) -> String {
        std::fs::read_to_string(self.layout().output_dir.join(file)).unwrap()
    }

    pub fn manifest(&self) -> serde_json::Value {
        serde_json::from_str(&self.read_output("package.json")).unwrap()
    }
}
