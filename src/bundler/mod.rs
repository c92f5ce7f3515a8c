//! Turns the application's entry module and tools into a runnable output tree.

pub mod analyzer;
pub mod deps;
pub mod engine;
pub mod installer;
pub mod workspace;
pub mod writer;

pub use deps::{DependencyInstallSet, DependencyOrigin, DependencyRecord, InstallSource};
pub use engine::{BundleEngine, EngineOptions, EntryMap, EntrySource, EsbuildEngine, ToolEntry};
pub use installer::{CommandInstaller, PackageInstaller, PackageManager};
pub use workspace::{ResolutionSet, WorkspacePackage, WorkspacePackageMap};
pub use writer::DeploymentManifest;

use crate::config::entry::EntryOptions;
use crate::error::{BundleError, BundleErrorKind, DevServeError, Result};
use crate::fsutil;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Directory under the project root holding all generated files.
pub const STATE_DIR: &str = ".devserve";

/// Where intermediate and final build files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl BundleLayout {
    pub fn for_project(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR);
        Self {
            build_dir: state_dir.join(".build"),
            output_dir: state_dir.join("output"),
        }
    }
}

/// Platform-specific parts of a build.
#[async_trait]
pub trait BundleTarget: Send + Sync {
    fn name(&self) -> &'static str;

    fn engine_options(&self, options: &EntryOptions) -> EngineOptions;

    /// Extra files the platform needs in the output tree.
    async fn write_output(&self, _output_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Local development: plain Node ESM output.
pub struct DevTarget;

#[async_trait]
impl BundleTarget for DevTarget {
    fn name(&self) -> &'static str {
        "dev"
    }

    fn engine_options(&self, options: &EntryOptions) -> EngineOptions {
        EngineOptions {
            sourcemap: options.bundler.sourcemap,
            ..EngineOptions::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleInput {
    pub project_root: PathBuf,
    pub entry: EntrySource,
    pub tool_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub output_dir: PathBuf,
    pub tools: Vec<ToolEntry>,
    pub install_set: DependencyInstallSet,
    pub resolutions: ResolutionSet,
    pub manifest: DeploymentManifest,
    /// The manifest's dependency map differs from the previous bundle's.
    pub dependencies_changed: bool,
}

pub struct Bundler {
    engine: Arc<dyn BundleEngine>,
    target: Arc<dyn BundleTarget>,
    workspace_map: WorkspacePackageMap,
    layout: BundleLayout,
    last_dependencies: Mutex<Option<BTreeMap<String, String>>>,
}

fn stage_error(
    kind: BundleErrorKind,
    message: &str,
) -> impl FnOnce(DevServeError) -> BundleError + '_ {
    move |e| BundleError::new(kind, message, e)
}

impl Bundler {
    pub fn new(
        engine: Arc<dyn BundleEngine>,
        target: Arc<dyn BundleTarget>,
        workspace_map: WorkspacePackageMap,
        layout: BundleLayout,
    ) -> Self {
        Self {
            engine,
            target,
            workspace_map,
            layout,
            last_dependencies: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Start from empty build and output directories.
    pub async fn prepare(&self) -> Result<()> {
        fsutil::empty_dir(&self.layout.build_dir)?;
        fsutil::empty_dir(&self.layout.output_dir)?;
        debug!("Prepared {}", self.layout.output_dir.display());
        Ok(())
    }

    /// Run the whole pipeline once.
    pub async fn bundle(&self, input: &BundleInput) -> Result<BundleOutcome> {
        if let EntrySource::File(path) = &input.entry {
            if !path.is_file() {
                return Err(DevServeError::EntryNotFound(path.display().to_string()));
            }
        }

        let build_dir = &self.layout.build_dir;
        let output_dir = &self.layout.output_dir;
        tokio::fs::create_dir_all(build_dir).await?;
        tokio::fs::create_dir_all(output_dir).await?;

        let entry_dir = input.entry.directory().to_path_buf();
        let options = EntryOptions::load_from_dir(&entry_dir)
            .await
            .unwrap_or_else(|e| {
                warn!("Ignoring entry options: {e}");
                EntryOptions::default()
            });

        info!("Bundling for target '{}'", self.target.name());

        let tools = analyzer::discover_tools(&input.tool_patterns, &input.project_root);
        let entries = EntryMap::new(input.entry.clone(), tools);

        let externals = analyzer::analyze(self.engine.as_ref(), &entries, build_dir).await?;

        let workspace = workspace::resolve_workspace_dependencies(
            &externals,
            &entry_dir,
            &self.workspace_map,
            output_dir,
        )
        .await?;

        let mut install_set = DependencyInstallSet::new();
        for record in &workspace.records {
            install_set.add_record(record);
        }
        for (name, artifact) in &workspace.resolutions {
            install_set.add_artifact(name, artifact.clone());
        }

        let engine_options = self.target.engine_options(&options);
        self.engine
            .write(&entries, &engine_options, build_dir, output_dir)
            .await
            .map_err(stage_error(
                BundleErrorKind::BundleStageFailed,
                "Failed to write the bundle.",
            ))?;

        let instrumentation_packages = writer::write_instrumentation(
            self.engine.as_ref(),
            &engine_options,
            &entry_dir,
            build_dir,
            output_dir,
        )
        .await
        .map_err(stage_error(
            BundleErrorKind::InstrumentationFailed,
            "Failed to write instrumentation file.",
        ))?;

        let telemetry_packages = writer::write_telemetry_config(&options.telemetry, output_dir)
            .await
            .map_err(stage_error(
                BundleErrorKind::TelemetryFailed,
                "Failed to write telemetry config.",
            ))?;
        for package in instrumentation_packages.iter().chain(&telemetry_packages) {
            install_set.add_version_if_absent(package, deps::LATEST);
        }
        install_set.apply_baseline();

        let manifest = DeploymentManifest::new(&install_set, &workspace.resolutions);
        async {
            writer::write_tools_module(&entries.tools, output_dir).await?;
            self.target.write_output(output_dir).await?;
            manifest.write(output_dir).await?;
            writer::copy_static_assets(&entry_dir, &input.project_root, output_dir)
        }
        .await
        .map_err(stage_error(
            BundleErrorKind::BundleStageFailed,
            "Failed to assemble the output directory.",
        ))?;

        let dependencies_changed = {
            let mut last = self
                .last_dependencies
                .lock()
                .map_err(|e| DevServeError::ProcessError(format!("Lock poisoned: {e}")))?;
            let changed = last.as_ref() != Some(&manifest.dependencies);
            *last = Some(manifest.dependencies.clone());
            changed
        };

        info!(
            "Bundled {} tools and {} dependencies into {}",
            entries.tools.len(),
            install_set.len(),
            output_dir.display()
        );

        Ok(BundleOutcome {
            output_dir: output_dir.clone(),
            tools: entries.tools,
            install_set,
            resolutions: workspace.resolutions,
            manifest,
            dependencies_changed,
        })
    }
}
