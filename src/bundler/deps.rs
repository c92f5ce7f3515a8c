use std::collections::BTreeMap;
use std::fmt;

/// Version constraint used when a package's descriptor can't be resolved.
pub const LATEST: &str = "latest";

/// Observability and runtime packages every output tree depends on.
pub const BASELINE_DEPENDENCIES: [(&str, &str); 9] = [
    ("@opentelemetry/core", "^2.0.1"),
    ("@opentelemetry/auto-instrumentations-node", "^0.59.0"),
    ("@opentelemetry/exporter-trace-otlp-grpc", "^0.201.0"),
    ("@opentelemetry/exporter-trace-otlp-http", "^0.201.0"),
    ("@opentelemetry/resources", "^2.0.1"),
    ("@opentelemetry/sdk-node", "^0.201.0"),
    ("@opentelemetry/sdk-trace-base", "^2.0.1"),
    ("@opentelemetry/semantic-conventions", "^1.33.0"),
    ("@opentelemetry/instrumentation", "^0.202.0"),
];

/// Reduce an import specifier to its package name.
///
/// `@scope/pkg/deep/path` becomes `@scope/pkg` and `pkg/sub` becomes `pkg`.
pub fn normalize_package_name(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(name) if !name.is_empty() => format!("{scope}/{name}"),
            _ => scope.to_string(),
        },
        Some(name) if !name.is_empty() => name.to_string(),
        _ => specifier.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyOrigin {
    Registry,
    Workspace,
}

/// A classified external dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    pub name: String,
    pub version_constraint: String,
    pub origin: DependencyOrigin,
}

impl DependencyRecord {
    pub fn registry(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: normalize_package_name(&name.into()),
            version_constraint: version.into(),
            origin: DependencyOrigin::Registry,
        }
    }

    pub fn workspace(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: normalize_package_name(&name.into()),
            version_constraint: version.into(),
            origin: DependencyOrigin::Workspace,
        }
    }
}

/// Where a package in the install set comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Version(String),
    Artifact(String),
}

impl fmt::Display for InstallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallSource::Version(v) => write!(f, "{v}"),
            InstallSource::Artifact(path) => write!(f, "{path}"),
        }
    }
}

/// The final package set written into the deployment manifest.
///
/// Keys are normalized package names. A packed workspace artifact is never
/// replaced by a registry version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyInstallSet {
    entries: BTreeMap<String, InstallSource>,
}

impl DependencyInstallSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the pinned baseline.
    pub fn with_baseline() -> Self {
        let mut set = Self::new();
        set.apply_baseline();
        set
    }

    /// Add a registry dependency. Returns false if the name is already
    /// provided by a packed artifact.
    pub fn add_version(&mut self, name: &str, version: impl Into<String>) -> bool {
        let key = normalize_package_name(name);
        if matches!(self.entries.get(&key), Some(InstallSource::Artifact(_))) {
            return false;
        }
        self.entries.insert(key, InstallSource::Version(version.into()));
        true
    }

    /// Add a registry dependency only if nothing is known about the name yet.
    pub fn add_version_if_absent(&mut self, name: &str, version: impl Into<String>) {
        let key = normalize_package_name(name);
        self.entries
            .entry(key)
            .or_insert_with(|| InstallSource::Version(version.into()));
    }

    /// Point a package at a packed artifact, replacing any registry version.
    pub fn add_artifact(&mut self, name: &str, path: impl Into<String>) {
        self.entries
            .insert(normalize_package_name(name), InstallSource::Artifact(path.into()));
    }

    pub fn add_record(&mut self, record: &DependencyRecord) {
        match record.origin {
            DependencyOrigin::Registry => {
                self.add_version(&record.name, record.version_constraint.clone());
            }
            // Workspace packages enter the set through their artifact path.
            DependencyOrigin::Workspace => {}
        }
    }

    /// Pin the baseline packages, overriding discovered versions.
    pub fn apply_baseline(&mut self) {
        for (name, version) in BASELINE_DEPENDENCIES {
            self.add_version(name, version);
        }
    }

    pub fn get(&self, name: &str) -> Option<&InstallSource> {
        self.entries.get(&normalize_package_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstallSource)> {
        self.entries.iter()
    }

    /// Flatten to the `dependencies` map of the manifest.
    pub fn to_manifest_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, source)| (name.clone(), source.to_string()))
            .collect()
    }
}
