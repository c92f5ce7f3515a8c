use crate::error::{DevServeError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, info};

/// Installs the output tree's dependencies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, output_dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Bun,
    Npm,
}

impl PackageManager {
    /// Detect the project's package manager from the nearest lockfile.
    pub fn detect(project_root: &Path) -> Self {
        for dir in project_root.ancestors() {
            if dir.join("pnpm-lock.yaml").is_file() {
                return PackageManager::Pnpm;
            }
            if dir.join("yarn.lock").is_file() {
                return PackageManager::Yarn;
            }
            if dir.join("bun.lockb").is_file() || dir.join("bun.lock").is_file() {
                return PackageManager::Bun;
            }
            if dir.join("package-lock.json").is_file() {
                return PackageManager::Npm;
            }
        }
        PackageManager::Npm
    }

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
            PackageManager::Npm => "npm",
        }
    }

    /// The output tree usually sits inside the project's workspace, so it is
    /// installed as a standalone package.
    pub fn install_args(&self) -> Vec<&'static str> {
        match self {
            PackageManager::Pnpm => vec!["install", "--ignore-workspace"],
            PackageManager::Yarn => vec!["install", "--no-immutable"],
            PackageManager::Bun => vec!["install"],
            PackageManager::Npm => vec!["install", "--no-audit", "--no-fund"],
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())
    }
}

impl FromStr for PackageManager {
    type Err = DevServeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pnpm" => Ok(PackageManager::Pnpm),
            "yarn" => Ok(PackageManager::Yarn),
            "bun" => Ok(PackageManager::Bun),
            "npm" => Ok(PackageManager::Npm),
            other => Err(DevServeError::ConfigError(format!(
                "Unknown package manager '{other}'"
            ))),
        }
    }
}

/// Runs the package manager's `install` in the output directory.
pub struct CommandInstaller {
    manager: PackageManager,
}

impl CommandInstaller {
    pub fn new(manager: PackageManager) -> Self {
        Self { manager }
    }

    /// Use `forced` when set, otherwise detect from `project_root`.
    pub fn for_project(project_root: &Path, forced: Option<&str>) -> Result<Self> {
        let manager = match forced {
            Some(name) => name.parse()?,
            None => PackageManager::detect(project_root),
        };
        Ok(Self::new(manager))
    }

    pub fn manager(&self) -> PackageManager {
        self.manager
    }

    fn command(&self, output_dir: &Path) -> Command {
        let mut command = Command::new(self.manager.program());
        command
            .args(self.manager.install_args())
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, output_dir: &Path) -> Result<()> {
        info!("Installing dependencies with {}", self.manager);

        let output = self.command(output_dir).output().await.map_err(|e| {
            DevServeError::InstallError(format!("Failed to run {}: {e}", self.manager))
        })?;

        debug!("{}", String::from_utf8_lossy(&output.stdout).trim());

        if !output.status.success() {
            return Err(DevServeError::InstallError(format!(
                "{} install exited with {:?}: {}",
                self.manager,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}
