//! Workspace (monorepo) dependency resolution.
//!
//! Externals that resolve to a package developed in the same monorepo are not
//! fetched from the registry. Instead the package, and every other workspace
//! package it transitively depends on, is packed into a tarball inside the
//! output tree and referenced by path.

use crate::bundler::deps::{DependencyRecord, LATEST, normalize_package_name};
use crate::error::{BundleError, BundleErrorKind, DevServeError, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Directory inside the output tree that holds packed workspace packages.
pub const WORKSPACE_MODULE_DIR: &str = "workspace-module";

const DEPENDENCY_SECTIONS: [&str; 4] = [
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

/// Workspace package name -> artifact path relative to the output directory.
pub type ResolutionSet = BTreeMap<String, String>;

/// A package developed inside the monorepo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePackage {
    pub name: String,
    pub location: PathBuf,
    pub version: String,
    pub dependencies: BTreeMap<String, String>,
}

/// All workspace packages of the monorepo, keyed by package name.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePackageMap {
    root: Option<PathBuf>,
    packages: HashMap<String, WorkspacePackage>,
}

impl WorkspacePackageMap {
    /// Build the map from the monorepo enclosing `start`. A project that is not
    /// part of a workspace yields an empty map.
    pub fn discover(start: &Path) -> Result<Self> {
        let Some(root) = find_workspace_root(start) else {
            debug!("No workspace root found above {}", start.display());
            return Ok(Self::default());
        };

        let mut packages = HashMap::new();
        for pattern in workspace_patterns(&root)? {
            let full_pattern = root.join(&pattern);
            for dir in glob::glob(&full_pattern.to_string_lossy())?.flatten() {
                if let Some(pkg) = read_workspace_package(&dir)? {
                    packages.insert(pkg.name.clone(), pkg);
                }
            }
        }

        info!(
            "Found {} workspace packages under {}",
            packages.len(),
            root.display()
        );

        Ok(Self {
            root: Some(root),
            packages,
        })
    }

    pub fn from_packages(packages: impl IntoIterator<Item = WorkspacePackage>) -> Self {
        Self {
            root: None,
            packages: packages
                .into_iter()
                .map(|pkg| (pkg.name.clone(), pkg))
                .collect(),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&WorkspacePackage> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Walk up from `start` to the first directory that declares workspaces.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| {
            dir.join("pnpm-workspace.yaml").is_file()
                || read_json(&dir.join("package.json"))
                    .map(|pkg| pkg.get("workspaces").is_some())
                    .unwrap_or(false)
        })
        .map(Path::to_path_buf)
}

fn workspace_patterns(root: &Path) -> Result<Vec<String>> {
    let pnpm = root.join("pnpm-workspace.yaml");
    if pnpm.is_file() {
        let content = std::fs::read_to_string(&pnpm)?;
        return Ok(parse_pnpm_workspace_patterns(&content));
    }

    let package = read_json(&root.join("package.json"))?;
    let patterns = match package.get("workspaces") {
        Some(Value::Array(arr)) => arr,
        // { "packages": [...] } (yarn-style)
        Some(Value::Object(obj)) => match obj.get("packages") {
            Some(Value::Array(arr)) => arr,
            _ => return Ok(Vec::new()),
        },
        _ => return Ok(Vec::new()),
    };

    Ok(patterns
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|p| !p.starts_with('!'))
        .map(String::from)
        .collect())
}

/// Extract the `packages:` list of a pnpm-workspace.yaml file.
fn parse_pnpm_workspace_patterns(content: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut in_packages = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('-') {
            in_packages = trimmed == "packages:";
            continue;
        }
        if in_packages {
            if let Some(item) = trimmed.strip_prefix('-') {
                let pattern = item.trim().trim_matches(|c| c == '\'' || c == '"');
                if !pattern.is_empty() && !pattern.starts_with('!') {
                    patterns.push(pattern.to_string());
                }
            }
        }
    }

    patterns
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn read_workspace_package(dir: &Path) -> Result<Option<WorkspacePackage>> {
    let manifest = dir.join("package.json");
    if !dir.is_dir() || !manifest.is_file() {
        return Ok(None);
    }

    let package = read_json(&manifest).map_err(|e| {
        DevServeError::WorkspaceError(format!("Invalid {}: {e}", manifest.display()))
    })?;

    let Some(name) = package.get("name").and_then(Value::as_str) else {
        return Ok(None);
    };

    Ok(Some(WorkspacePackage {
        name: name.to_string(),
        location: dir.to_path_buf(),
        version: package
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("0.0.0")
            .to_string(),
        dependencies: string_map(package.get("dependencies")),
    }))
}

/// Name and version read from an installed package's package.json.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: Option<String>,
}

/// Resolve `name`'s package.json the way Node does, walking `node_modules`
/// directories upward from `from_dir`.
pub fn resolve_package_descriptor(from_dir: &Path, name: &str) -> Option<PackageDescriptor> {
    from_dir.ancestors().find_map(|dir| {
        let candidate = dir.join("node_modules").join(name).join("package.json");
        if !candidate.is_file() {
            return None;
        }
        let package = read_json(&candidate).ok()?;
        Some(PackageDescriptor {
            name: package.get("name")?.as_str()?.to_string(),
            version: package
                .get("version")
                .and_then(Value::as_str)
                .map(String::from),
        })
    })
}

/// Externals split by where they will be installed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedDependencies {
    pub registry: Vec<DependencyRecord>,
    /// Workspace packages, in first-seen order.
    pub workspace: Vec<DependencyRecord>,
}

impl ClassifiedDependencies {
    pub fn workspace_names(&self) -> Vec<String> {
        self.workspace.iter().map(|r| r.name.clone()).collect()
    }
}

/// Classify each external as registry- or workspace-sourced, resolving
/// descriptors from the entry module's directory.
///
/// Resolution failures never fail the build; the dependency falls back to
/// `latest`.
pub fn classify_externals(
    externals: &[String],
    entry_dir: &Path,
    workspace_map: &WorkspacePackageMap,
) -> ClassifiedDependencies {
    let mut classified = ClassifiedDependencies::default();
    let mut seen = HashSet::new();

    for external in externals {
        let name = normalize_package_name(external);
        if !seen.insert(name.clone()) {
            continue;
        }

        match resolve_package_descriptor(entry_dir, &name) {
            Some(descriptor) if workspace_map.contains(&descriptor.name) => {
                debug!("{} is a workspace package", descriptor.name);
                if !classified.workspace.iter().any(|r| r.name == descriptor.name) {
                    let version = descriptor.version.unwrap_or_else(|| LATEST.to_string());
                    classified
                        .workspace
                        .push(DependencyRecord::workspace(descriptor.name, version));
                }
            }
            Some(descriptor) => {
                let version = descriptor.version.unwrap_or_else(|| LATEST.to_string());
                classified.registry.push(DependencyRecord::registry(name, version));
            }
            None => {
                debug!("Could not resolve {name}, installing latest");
                classified.registry.push(DependencyRecord::registry(name, LATEST));
            }
        }
    }

    classified
}

/// File name of a package's packed artifact.
pub fn artifact_file_name(name: &str, version: &str) -> String {
    let slug = name.trim_start_matches('@').replace('/', "-");
    format!("{slug}-{version}.tgz")
}

/// Every workspace package reachable from the initial set, each once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceClosure {
    /// Package names in breadth-first discovery order.
    pub packages: Vec<String>,
    pub resolutions: ResolutionSet,
}

/// Compute the transitive closure of workspace packages required by
/// `initial`.
pub fn collect_transitive_workspace_dependencies(
    workspace_map: &WorkspacePackageMap,
    initial: &[String],
) -> Result<WorkspaceClosure> {
    let mut closure = WorkspaceClosure::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut file_names: HashMap<String, String> = HashMap::new();
    let mut queue: VecDeque<String> = initial.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }

        let pkg = workspace_map.get(&name).ok_or_else(|| {
            DevServeError::WorkspaceError(format!(
                "Package '{name}' is not part of the workspace"
            ))
        })?;

        for (dep, range) in &pkg.dependencies {
            if workspace_map.contains(dep) {
                if !seen.contains(dep) {
                    queue.push_back(dep.clone());
                }
            } else if range.starts_with("workspace:") {
                return Err(DevServeError::WorkspaceError(format!(
                    "'{name}' depends on '{dep}' via {range}, but no workspace package has that name"
                )));
            }
        }

        let file_name = artifact_file_name(&pkg.name, &pkg.version);
        if let Some(other) = file_names.insert(file_name.clone(), name.clone()) {
            return Err(DevServeError::WorkspaceError(format!(
                "'{other}' and '{name}' would both be packed as {file_name}"
            )));
        }
        closure
            .resolutions
            .insert(name.clone(), format!("./{WORKSPACE_MODULE_DIR}/{file_name}"));
        closure.packages.push(name);
    }

    Ok(closure)
}

/// Pack each package of the closure into `<output_dir>/workspace-module`.
pub async fn pack_workspace_dependencies(
    workspace_map: &WorkspacePackageMap,
    packages: &[String],
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let dest_dir = output_dir.join(WORKSPACE_MODULE_DIR);
    let mut artifacts = Vec::with_capacity(packages.len());

    for name in packages {
        let pkg = workspace_map
            .get(name)
            .cloned()
            .ok_or_else(|| DevServeError::WorkspaceError(format!("Unknown package '{name}'")))?;
        let map = workspace_map.clone();
        let dest = dest_dir.clone();

        let artifact = tokio::task::spawn_blocking(move || pack_package(&pkg, &map, &dest))
            .await
            .map_err(|e| DevServeError::WorkspaceError(format!("Packing task failed: {e}")))??;

        info!("Packed {} -> {}", name, artifact.display());
        artifacts.push(artifact);
    }

    Ok(artifacts)
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && matches!(
            entry.file_name().to_str(),
            Some("node_modules") | Some(".git")
        )
}

fn pack_package(
    pkg: &WorkspacePackage,
    workspace_map: &WorkspacePackageMap,
    dest_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let artifact = dest_dir.join(artifact_file_name(&pkg.name, &pkg.version));

    let encoder = GzEncoder::new(File::create(&artifact)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(&pkg.location)
        .into_iter()
        .filter_entry(|e| !is_excluded(e))
    {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&pkg.location)
            .map_err(std::io::Error::other)?;
        if relative == Path::new("package.json") {
            continue;
        }
        builder.append_path_with_name(entry.path(), Path::new("package").join(relative))?;
    }

    let manifest = packed_manifest(pkg, workspace_map)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "package/package.json", manifest.as_slice())?;

    builder.into_inner()?.finish()?;
    Ok(artifact)
}

/// The package's manifest with `workspace:` ranges replaced by versions.
fn packed_manifest(pkg: &WorkspacePackage, workspace_map: &WorkspacePackageMap) -> Result<Vec<u8>> {
    let mut manifest = read_json(&pkg.location.join("package.json"))?;

    for section in DEPENDENCY_SECTIONS {
        let Some(deps) = manifest.get_mut(section).and_then(Value::as_object_mut) else {
            continue;
        };
        for (dep, range) in deps.iter_mut() {
            let Some(spec) = range.as_str().and_then(|r| r.strip_prefix("workspace:")) else {
                continue;
            };
            let target = workspace_map.get(dep).ok_or_else(|| {
                DevServeError::WorkspaceError(format!(
                    "'{}' depends on unknown workspace package '{dep}'",
                    pkg.name
                ))
            })?;
            let resolved = match spec {
                "*" | "" => target.version.clone(),
                "^" | "~" => format!("{spec}{}", target.version),
                explicit => explicit.to_string(),
            };
            *range = Value::String(resolved);
        }
    }

    Ok(serde_json::to_vec_pretty(&manifest)?)
}

/// Outcome of resolving the analyzed externals against the workspace.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceResolution {
    /// Registry records followed by workspace records.
    pub records: Vec<DependencyRecord>,
    pub resolutions: ResolutionSet,
    pub artifacts: Vec<PathBuf>,
}

/// Classify externals, then pack every workspace package they reach.
///
/// Any closure or packing failure is reported as `WORKSPACE_DEPS_FAILED`.
pub async fn resolve_workspace_dependencies(
    externals: &[String],
    entry_dir: &Path,
    workspace_map: &WorkspacePackageMap,
    output_dir: &Path,
) -> std::result::Result<WorkspaceResolution, BundleError> {
    let classified = classify_externals(externals, entry_dir, workspace_map);
    let workspace_names = classified.workspace_names();
    let mut resolution = WorkspaceResolution {
        records: [classified.registry, classified.workspace].concat(),
        ..Default::default()
    };

    if workspace_names.is_empty() {
        return Ok(resolution);
    }

    let packed = async {
        let closure = collect_transitive_workspace_dependencies(workspace_map, &workspace_names)?;
        let artifacts =
            pack_workspace_dependencies(workspace_map, &closure.packages, output_dir).await?;
        Ok::<_, DevServeError>((closure.resolutions, artifacts))
    }
    .await
    .map_err(|e| {
        BundleError::new(
            BundleErrorKind::WorkspaceDepsFailed,
            "Failed to collect and pack workspace dependencies.",
            e,
        )
    })?;

    resolution.resolutions = packed.0;
    resolution.artifacts = packed.1;
    Ok(resolution)
}
