//! The `dev` and `build` sessions.
//!
//! A dev session bundles the application, installs its dependencies, starts
//! the server under a [`Supervisor`] and then reacts to three things until it
//! ends: settled source changes (rebuild, then restart), a session-fatal
//! supervisor condition, and Ctrl+C.

use crate::bundler::{
    BundleInput, BundleLayout, BundleOutcome, Bundler, CommandInstaller, DevTarget, EntrySource,
    EsbuildEngine, PackageInstaller, WorkspacePackageMap,
};
use crate::config::{BuildEvent, DotenvSource, EntryOptions, EnvSource, GlobalConfig, SourceWatcher};
use crate::dev::coordinator::RebuildCoordinator;
use crate::dev::port::resolve_port;
use crate::error::{DevServeError, Result};
use crate::fsutil;
use crate::logging::log_build_event;
use crate::process::{
    HttpRefreshNotifier, NodeLauncher, SessionExit, StartOptions, Supervisor,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source directory used when `--dir` is not given, relative to the cwd.
pub const DEFAULT_SOURCE_DIR: &str = "src/server";

/// Entry module candidates inside the source directory, in probe order.
pub const ENTRY_CANDIDATES: [&str; 2] = ["index.ts", "index.js"];

/// Tools picked up without any `--tools` flag, relative to the source directory.
pub const DEFAULT_TOOLS_PATTERN: &str = "tools/**/*.{js,ts}";

/// Arguments shared by `dev` and `build`.
#[derive(Debug, Clone, Default)]
pub struct SessionArgs {
    pub dir: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub port: Option<u16>,
    pub tools: Vec<String>,
    pub env_file: Option<String>,
    pub start: StartOptions,
}

/// Locations a session works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub source_dir: PathBuf,
}

impl ProjectPaths {
    pub fn resolve(cwd: &Path, dir: Option<&Path>, root: Option<&Path>) -> Self {
        let absolute = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) };
        Self {
            root: root.map(absolute).unwrap_or_else(|| cwd.to_path_buf()),
            source_dir: dir
                .map(absolute)
                .unwrap_or_else(|| cwd.join(DEFAULT_SOURCE_DIR)),
        }
    }

    /// The entry module, or [`DevServeError::EntryNotFound`].
    pub fn entry_file(&self) -> Result<PathBuf> {
        let candidates: Vec<PathBuf> = ENTRY_CANDIDATES
            .iter()
            .map(|name| self.source_dir.join(name))
            .collect();
        fsutil::first_existing_file(&candidates)
            .ok_or_else(|| DevServeError::EntryNotFound(candidates[0].display().to_string()))
    }

    /// The default tools pattern followed by any extra ones.
    pub fn tool_patterns(&self, extra: &[String]) -> Vec<String> {
        let mut patterns = vec![self.source_dir.join(DEFAULT_TOOLS_PATTERN).display().to_string()];
        patterns.extend(extra.iter().cloned());
        patterns
    }

    /// Directories to watch: the source directory and the static part of
    /// each extra tools pattern that exists.
    pub fn watch_roots(&self, extra_tools: &[String]) -> Vec<PathBuf> {
        let mut roots = vec![self.source_dir.clone()];
        for pattern in extra_tools {
            let base = pattern_base(Path::new(pattern));
            let base = if base.is_absolute() { base } else { self.root.join(base) };
            if base.is_dir() && !roots.iter().any(|r| base.starts_with(r)) {
                roots.push(base);
            }
        }
        roots
    }
}

/// Leading path components of a glob pattern that contain no glob syntax.
fn pattern_base(pattern: &Path) -> PathBuf {
    pattern
        .components()
        .take_while(|c| match c {
            Component::Normal(part) => !part
                .to_string_lossy()
                .contains(['*', '?', '[', '{']),
            _ => true,
        })
        .collect()
}

/// Split `--custom-args` into individual node arguments.
pub fn parse_custom_args(raw: &str) -> Result<Vec<String>> {
    shlex::split(raw)
        .ok_or_else(|| DevServeError::ConfigError(format!("Invalid custom arguments: {raw}")))
}

/// Bundling and installation for one project.
pub struct DevSession {
    paths: ProjectPaths,
    input: BundleInput,
    bundler: Bundler,
    installer: Arc<dyn PackageInstaller>,
}

impl DevSession {
    /// Wire up the real engine and package manager for the project.
    pub fn new(config: &GlobalConfig, args: &SessionArgs, cwd: &Path) -> Result<Self> {
        let paths = ProjectPaths::resolve(cwd, args.dir.as_deref(), args.root.as_deref());
        let entry = paths.entry_file()?;

        let workspace_map = WorkspacePackageMap::discover(&paths.source_dir)?;
        debug!("Found {} workspace packages", workspace_map.len());

        let engine = EsbuildEngine::locate(
            &paths.root,
            config.bundler.engine_path.as_deref().map(Path::new),
        );
        let bundler = Bundler::new(
            Arc::new(engine),
            Arc::new(DevTarget),
            workspace_map,
            BundleLayout::for_project(&paths.root),
        );
        let installer =
            CommandInstaller::for_project(&paths.root, config.bundler.package_manager.as_deref())?;

        let input = BundleInput {
            project_root: paths.root.clone(),
            entry: EntrySource::File(entry),
            tool_patterns: paths.tool_patterns(&args.tools),
        };

        Ok(Self::with_components(paths, input, bundler, Arc::new(installer)))
    }

    pub fn with_components(
        paths: ProjectPaths,
        input: BundleInput,
        bundler: Bundler,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            paths,
            input,
            bundler,
            installer,
        }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn output_dir(&self) -> &Path {
        &self.bundler.layout().output_dir
    }

    /// Prepare, bundle and install from scratch.
    pub async fn build_once(&self) -> Result<BundleOutcome> {
        self.bundler.prepare().await?;
        let outcome = self.bundler.bundle(&self.input).await?;
        self.installer.install(&outcome.output_dir).await?;
        Ok(outcome)
    }

    /// Re-run the pipeline after a source change.
    ///
    /// Dependencies are only reinstalled when the manifest's dependency set
    /// changed. `BundleStart` and then the terminal event are sent on
    /// `events`; the terminal event is also returned.
    pub async fn rebuild(&self, events: &mpsc::UnboundedSender<BuildEvent>) -> BuildEvent {
        log_build_event("bundle-start", &self.paths.source_dir.display().to_string());
        let _ = events.send(BuildEvent::BundleStart);

        let result = async {
            let outcome = self.bundler.bundle(&self.input).await?;
            if outcome.dependencies_changed {
                info!("Dependencies changed, reinstalling");
                self.installer.install(&outcome.output_dir).await?;
            }
            Ok::<_, DevServeError>(outcome)
        }
        .await;

        let event = match result {
            Ok(outcome) => {
                log_build_event("bundle-end", &outcome.output_dir.display().to_string());
                BuildEvent::BundleEnd
            }
            Err(e) => {
                error!("Rebuild failed: {e}");
                BuildEvent::Error(e.to_string())
            }
        };
        let _ = events.send(event.clone());
        event
    }
}

fn spawn_rebuild(
    session: &Arc<DevSession>,
    events: &mpsc::UnboundedSender<BuildEvent>,
) -> JoinHandle<()> {
    let session = session.clone();
    let events = events.clone();
    tokio::spawn(async move {
        session.rebuild(&events).await;
    })
}

/// `devserve build`: bundle and install once.
pub async fn run_build(config: &GlobalConfig, args: &SessionArgs) -> Result<BundleOutcome> {
    let cwd = std::env::current_dir()?;
    let session = DevSession::new(config, args, &cwd)?;
    let outcome = session.build_once().await?;
    info!("Build written to {}", outcome.output_dir.display());
    Ok(outcome)
}

/// `devserve dev`: run until interrupted or the server can't be kept up.
/// Returns the process exit code.
pub async fn run_dev(config: &GlobalConfig, args: &SessionArgs) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let session = Arc::new(DevSession::new(config, args, &cwd)?);
    let paths = session.paths().clone();
    let output_dir = session.output_dir().to_path_buf();

    session.build_once().await?;

    let entry_options = EntryOptions::load_from_dir(&paths.source_dir)
        .await
        .unwrap_or_else(|e| {
            warn!("Ignoring entry options: {e}");
            EntryOptions::default()
        });

    let env_source: Arc<dyn EnvSource> =
        Arc::new(DotenvSource::new(&paths.root, args.env_file.clone()));
    let env_vars = env_source.load().await?;

    let env_port = env_vars
        .get("PORT")
        .cloned()
        .or_else(|| std::env::var("PORT").ok());
    let port = resolve_port(
        args.port,
        entry_options.server.port,
        env_port.as_deref(),
        &config.ports,
    )?;
    debug!("Using port {} ({:?})", port.port, port.source);

    let (supervisor, mut session_exit) = Supervisor::new(
        Arc::new(NodeLauncher::new()),
        Arc::new(HttpRefreshNotifier::new()?),
        config.restart_policy(),
        config.supervisor_settings(),
    );

    supervisor
        .start(&output_dir, port.port, env_vars, args.start.clone())
        .await?;

    let coordinator = Arc::new(RebuildCoordinator::new(
        supervisor.clone(),
        env_source,
        output_dir.clone(),
        port.port,
        args.start.clone(),
    ));

    let mut watcher = SourceWatcher::new(
        paths.watch_roots(&args.tools),
        vec![paths.root.join(crate::bundler::STATE_DIR)],
        Duration::from_millis(config.watcher.debounce_ms),
    );
    watcher.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut watching = true;

    let (build_tx, mut build_rx) = mpsc::unbounded_channel();
    let mut build_task: Option<JoinHandle<()>> = None;
    let mut rebuild_pending = false;

    let exit = loop {
        tokio::select! {
            change = watcher.next_change(), if watching => match change {
                Some(changed) => {
                    debug!("{} files changed", changed.len());
                    if build_task.is_some() {
                        rebuild_pending = true;
                    } else {
                        build_task = Some(spawn_rebuild(&session, &build_tx));
                    }
                }
                None => {
                    warn!("File watcher stopped, changes will no longer be picked up");
                    watching = false;
                }
            },
            Some(event) = build_rx.recv() => {
                match event {
                    BuildEvent::BundleStart => {
                        debug!("Rebuild started");
                        continue;
                    }
                    BuildEvent::BundleEnd => {
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            if let Err(e) = coordinator.on_build_finished().await {
                                error!("Failed to restart server: {e}");
                            }
                        });
                    }
                    BuildEvent::Error(_) => {}
                }
                build_task = None;
                if std::mem::take(&mut rebuild_pending) {
                    build_task = Some(spawn_rebuild(&session, &build_tx));
                }
            }
            exit = session_exit.recv() => {
                break exit.unwrap_or(SessionExit::RestartsExhausted);
            }
            _ = &mut ctrl_c => {
                info!("Shutting down...");
                break SessionExit::Interrupted;
            }
        }
    };

    if let Some(task) = build_task {
        task.abort();
    }
    watcher.stop();
    if let Err(e) = supervisor.stop().await {
        error!("Failed to stop server: {e}");
    }

    Ok(exit.exit_code())
}
