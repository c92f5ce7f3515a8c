use crate::error::{DevServeError, Result};
use crate::process::ipc::{IPC_PATH_ENV, IpcPath, ServerMessage, SideChannel};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 50;

/// How long a force-killed process may take to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to spawn one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// How a server process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Termination handle of a running server.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Ask the process to exit, force-killing it after `grace`. Returns once
    /// the process is gone.
    async fn terminate(&self, grace: Duration) -> Result<()>;
}

/// A spawned server process.
pub struct ServerInstance {
    pub pid: Option<u32>,
    pub messages: mpsc::Receiver<ServerMessage>,
    pub exited: oneshot::Receiver<ExitOutcome>,
    pub control: Box<dyn ServerControl>,
}

/// Spawns server processes.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerInstance>;
}

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Spawns real processes with a side channel attached.
#[derive(Debug, Default)]
pub struct NodeLauncher;

impl NodeLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerLauncher for NodeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerInstance> {
        let ipc_path = IpcPath::unique();
        let (side_channel, messages) = SideChannel::open(ipc_path.clone()).await?;

        debug!(
            "Spawning {} {} in {}",
            spec.program.display(),
            spec.args.join(" "),
            spec.working_dir.display()
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env_vars)
            .env(IPC_PATH_ENV, ipc_path.to_socket_path())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            DevServeError::ProcessError(format!(
                "Failed to spawn {}: {e}",
                spec.program.display()
            ))
        })?;
        let pid = child.id();
        info!("Server process started with PID {:?}", pid);

        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("{line}");
                    if let Ok(mut tail) = tail.lock() {
                        tail.push(line);
                    }
                }
            })
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(async move {
            // Dropping the control also kills the process.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
            }
            drop(side_channel);

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for server process: {e}");
                    None
                }
            };
            let stderr_tail = tail.lock().map(|t| t.render()).unwrap_or_default();

            let _ = done_tx.send(true);
            let _ = exit_tx.send(ExitOutcome {
                exit_code,
                stderr_tail,
            });
        });

        Ok(ServerInstance {
            pid,
            messages,
            exited: exit_rx,
            control: Box::new(ProcessControl {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
                done: done_rx,
            }),
        })
    }
}

struct ProcessControl {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    done: watch::Receiver<bool>,
}

impl ProcessControl {
    fn interrupt(&self) -> bool {
        use sysinfo::{Signal as SysinfoSignal, System};

        let Some(pid) = self.pid else {
            return false;
        };
        let system = System::new_all();
        system
            .process(sysinfo::Pid::from_u32(pid))
            .and_then(|process| process.kill_with(SysinfoSignal::Interrupt))
            .unwrap_or(false)
    }

    fn force_kill(&self) {
        if let Ok(mut kill_tx) = self.kill_tx.lock() {
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[async_trait]
impl ServerControl for ProcessControl {
    async fn terminate(&self, grace: Duration) -> Result<()> {
        let mut done = self.done.clone();
        if *done.borrow() {
            return Ok(());
        }

        if self.interrupt() {
            debug!("Sent SIGINT to server process {:?}", self.pid);
            if tokio::time::timeout(grace, done.wait_for(|d| *d)).await.is_ok() {
                return Ok(());
            }
            warn!(
                "Server process {:?} did not exit within {:?}, killing it",
                self.pid, grace
            );
        }

        self.force_kill();
        tokio::time::timeout(KILL_TIMEOUT, done.wait_for(|d| *d))
            .await
            .map_err(|_| {
                DevServeError::ProcessError(format!(
                    "Server process {:?} could not be killed",
                    self.pid
                ))
            })?
            .map_err(|_| DevServeError::ProcessError("Server reaper stopped".to_string()))?;
        Ok(())
    }
}
