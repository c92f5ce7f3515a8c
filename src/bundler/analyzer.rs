use crate::bundler::deps::normalize_package_name;
use crate::bundler::engine::{BundleEngine, EntryMap, ToolEntry};
use crate::error::{BundleError, BundleErrorKind};
use crate::fsutil;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Node core modules, which never become install dependencies.
const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

pub fn is_node_builtin(specifier: &str) -> bool {
    if specifier.starts_with("node:") {
        return true;
    }
    let root = specifier.split('/').next().unwrap_or(specifier);
    NODE_BUILTINS.contains(&root)
}

/// Expand `{a,b}` groups. Nested groups are expanded left to right.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

/// Find the entry module of a matched tool path.
fn tool_entry_file(path: &Path) -> Option<PathBuf> {
    let candidate = fsutil::first_existing(&[
        path.join("index.ts"),
        path.join("index.js"),
        path.to_path_buf(),
    ]);

    match candidate {
        Some(file) if file.is_file() => Some(file),
        Some(dir) => {
            warn!("No entry module in tool directory {}, skipping", dir.display());
            None
        }
        None => {
            warn!("Tool path {} does not exist, skipping", path.display());
            None
        }
    }
}

/// Expand tool patterns into tool entries, in discovery order.
///
/// Relative patterns are resolved against `root`. Unusable matches are
/// skipped, never fatal.
pub fn discover_tools(patterns: &[String], root: &Path) -> Vec<ToolEntry> {
    let mut tools: Vec<ToolEntry> = Vec::new();

    for pattern in patterns.iter().flat_map(|p| expand_braces(p)) {
        let full = if Path::new(&pattern).is_absolute() {
            PathBuf::from(&pattern)
        } else {
            root.join(&pattern)
        };

        let matches = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Invalid tool pattern '{pattern}': {e}");
                continue;
            }
        };

        for path in matches.flatten() {
            let Some(file) = tool_entry_file(&path) else {
                continue;
            };
            if tools.iter().any(|t| t.path == file) {
                continue;
            }
            debug!("Discovered tool {}", file.display());
            tools.push(ToolEntry::new(file));
        }
    }

    tools
}

/// Reduce import specifiers to installable package names, dropping relative
/// paths and Node builtins.
pub fn package_names(imports: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for import in imports {
        if import.starts_with('.') || import.starts_with('/') || is_node_builtin(&import) {
            continue;
        }
        let name = normalize_package_name(&import);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Run the engine in analysis mode and reduce its imports to package names.
pub async fn analyze(
    engine: &dyn BundleEngine,
    entries: &EntryMap,
    build_dir: &Path,
) -> Result<Vec<String>, BundleError> {
    let imports = engine.analyze(entries, build_dir).await.map_err(|e| {
        BundleError::new(
            BundleErrorKind::AnalyzeFailed,
            "Failed to analyze the application's dependencies.",
            e,
        )
    })?;

    let externals = package_names(imports);
    debug!("Found {} external dependencies", externals.len());
    Ok(externals)
}
