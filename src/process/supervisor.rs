//! Supervision of the development server process.
//!
//! A [`Supervisor`] owns at most one live server. It spawns the server from
//! the output tree, waits for the ready signal on the side channel, restarts
//! the server after crashes with a fixed backoff and a bounded attempt count,
//! and reports a session-fatal condition once the budget is used up.

use crate::error::{DevServeError, Result};
use crate::process::ipc::ServerMessage;
use crate::process::launcher::{ExitOutcome, LaunchSpec, ServerControl, ServerLauncher};
use crate::process::refresh::{RefreshNotifier, notify_refresh};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(1000);

/// Crash-restart budget, fixed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub node_path: PathBuf,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub refresh_retry_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            node_path: PathBuf::from("node"),
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(5000),
            refresh_retry_delay: Duration::from_millis(1500),
        }
    }
}

/// Node flags requested on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub inspect: bool,
    pub inspect_brk: bool,
    pub custom_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Crashed,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned { generation: u64, pid: Option<u32> },
    Ready { generation: u64 },
    Exited { generation: u64, exit_code: Option<i32> },
    RestartScheduled { attempt: u32 },
    RestartSuppressed,
    RestartsExhausted { attempts: u32 },
}

/// Conditions that end the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Interrupted,
    RestartsExhausted,
}

impl SessionExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionExit::Interrupted => 0,
            SessionExit::RestartsExhausted => 1,
        }
    }
}

/// Build the command line and environment of the server process.
pub fn build_launch_spec(
    settings: &SupervisorSettings,
    output_dir: &Path,
    port: u16,
    env_vars: &HashMap<String, String>,
    options: &StartOptions,
) -> LaunchSpec {
    let mut args = Vec::new();
    if options.inspect {
        args.push("--inspect".to_string());
    }
    if options.inspect_brk {
        args.push("--inspect-brk".to_string());
    }
    args.extend(options.custom_args.iter().cloned());
    args.push("--import=./instrumentation.mjs".to_string());
    args.push("--import=@opentelemetry/instrumentation/hook.mjs".to_string());
    args.push("index.mjs".to_string());

    let storage = output_dir
        .parent()
        .unwrap_or(output_dir)
        .join("devserve.db");

    let mut env = HashMap::from([("NODE_ENV".to_string(), "production".to_string())]);
    env.extend(env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("DEVSERVE_DEV".to_string(), "true".to_string());
    env.insert("PORT".to_string(), port.to_string());
    env.insert(
        "DEVSERVE_DEFAULT_STORAGE_URL".to_string(),
        format!("file:{}", storage.display()),
    );

    LaunchSpec {
        program: settings.node_path.clone(),
        args,
        working_dir: output_dir.to_path_buf(),
        env_vars: env,
    }
}

#[derive(Debug, Clone)]
struct LaunchParams {
    output_dir: PathBuf,
    port: u16,
    env_vars: HashMap<String, String>,
    options: StartOptions,
}

struct ServerProcessHandle {
    generation: u64,
    control: Option<Arc<dyn ServerControl>>,
    state: ServerState,
    restart_attempts: u32,
    terminating: bool,
}

/// What `start` hears first from a freshly spawned process.
enum FirstSignal {
    Ready,
    Exited(ExitOutcome),
}

enum ExitAction {
    Stopped,
    ReportToStart,
    Restart,
    Crashed,
}

struct Inner {
    launcher: Arc<dyn ServerLauncher>,
    notifier: Arc<dyn RefreshNotifier>,
    policy: RestartPolicy,
    settings: SupervisorSettings,
    handle: Mutex<ServerProcessHandle>,
    last_launch: Mutex<Option<LaunchParams>>,
    restarting: AtomicBool,
    events: broadcast::Sender<SupervisorEvent>,
    session_exit: mpsc::UnboundedSender<SessionExit>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

/// Held while a purposeful restart is in flight.
pub struct RestartGuard {
    inner: Arc<Inner>,
}

impl Drop for RestartGuard {
    fn drop(&mut self) {
        self.inner.restarting.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn ServerLauncher>,
        notifier: Arc<dyn RefreshNotifier>,
        policy: RestartPolicy,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionExit>) {
        let (events, _) = broadcast::channel(64);
        let (session_exit, exit_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            inner: Arc::new(Inner {
                launcher,
                notifier,
                policy,
                settings,
                handle: Mutex::new(ServerProcessHandle {
                    generation: 0,
                    control: None,
                    state: ServerState::Stopped,
                    restart_attempts: 0,
                    terminating: false,
                }),
                last_launch: Mutex::new(None),
                restarting: AtomicBool::new(false),
                events,
                session_exit,
            }),
        };
        (supervisor, exit_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ServerState {
        self.handle().state
    }

    pub fn restart_attempts(&self) -> u32 {
        self.handle().restart_attempts
    }

    fn handle(&self) -> MutexGuard<'_, ServerProcessHandle> {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Claim the in-flight flag. `None` while another restart holds it.
    pub fn try_begin_restart(&self) -> Option<RestartGuard> {
        self.inner
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RestartGuard {
                inner: self.inner.clone(),
            })
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.restarting.load(Ordering::SeqCst)
    }

    /// Spawn the server from `output_dir` and wait for the first of ready or
    /// exit, bounded by the ready timeout.
    ///
    /// An exit with a nonzero code before ready fails with
    /// [`DevServeError::ServerStartFailed`]. A timeout only logs; readiness is
    /// still handled whenever it arrives.
    pub async fn start(
        &self,
        output_dir: &Path,
        port: u16,
        env_vars: HashMap<String, String>,
        options: StartOptions,
    ) -> Result<()> {
        let params = LaunchParams {
            output_dir: output_dir.to_path_buf(),
            port,
            env_vars,
            options,
        };
        *self
            .inner
            .last_launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(params.clone());

        self.stop().await?;

        info!("Starting server...");
        let (first_tx, first_rx) = oneshot::channel();
        self.launch(&params, Some(first_tx)).await?;

        let ready_timeout = self.inner.settings.ready_timeout;
        match tokio::time::timeout(ready_timeout, first_rx).await {
            Ok(Ok(FirstSignal::Ready)) => {
                info!("Server ready on port {port}");
                Ok(())
            }
            Ok(Ok(FirstSignal::Exited(outcome))) if outcome.success() => {
                warn!("Server exited before signalling readiness");
                Ok(())
            }
            Ok(Ok(FirstSignal::Exited(outcome))) => {
                if !outcome.stderr_tail.is_empty() {
                    error!("Server error output:\n{}", outcome.stderr_tail);
                }
                Err(DevServeError::ServerStartFailed {
                    exit_code: outcome.exit_code,
                    stderr: outcome.stderr_tail,
                })
            }
            Ok(Err(_)) => Err(DevServeError::ProcessError(
                "Server monitor stopped unexpectedly".to_string(),
            )),
            Err(_) => {
                warn!("Server did not signal readiness within {:?}", ready_timeout);
                Ok(())
            }
        }
    }

    /// Purposefully terminate the live server, if any.
    pub async fn stop(&self) -> Result<()> {
        let control = {
            let mut handle = self.handle();
            match handle.control.clone() {
                Some(control) => {
                    handle.terminating = true;
                    control
                }
                None => return Ok(()),
            }
        };

        debug!("Stopping current server...");
        control.terminate(self.inner.settings.shutdown_grace).await
    }

    async fn launch(
        &self,
        params: &LaunchParams,
        first_tx: Option<oneshot::Sender<FirstSignal>>,
    ) -> Result<u64> {
        let spec = build_launch_spec(
            &self.inner.settings,
            &params.output_dir,
            params.port,
            &params.env_vars,
            &params.options,
        );
        let instance = self.inner.launcher.launch(&spec).await?;

        let generation = {
            let mut handle = self.handle();
            handle.generation += 1;
            handle.control = Some(Arc::from(instance.control));
            handle.state = ServerState::Starting;
            handle.terminating = false;
            handle.generation
        };
        self.emit(SupervisorEvent::Spawned {
            generation,
            pid: instance.pid,
        });

        tokio::spawn(self.clone().monitor(
            generation,
            params.port,
            instance.messages,
            instance.exited,
            first_tx,
        ));

        Ok(generation)
    }

    async fn monitor(
        self,
        generation: u64,
        port: u16,
        mut messages: mpsc::Receiver<ServerMessage>,
        mut exited: oneshot::Receiver<ExitOutcome>,
        mut first_tx: Option<oneshot::Sender<FirstSignal>>,
    ) {
        let mut messages_open = true;
        loop {
            tokio::select! {
                biased;
                message = messages.recv(), if messages_open => match message {
                    Some(ServerMessage::ServerReady) => self.on_ready(generation, port, &mut first_tx),
                    None => messages_open = false,
                },
                outcome = &mut exited => {
                    let outcome = outcome.unwrap_or(ExitOutcome {
                        exit_code: None,
                        stderr_tail: String::new(),
                    });
                    self.on_exit(generation, outcome, first_tx.take());
                    break;
                }
            }
        }
    }

    fn on_ready(
        &self,
        generation: u64,
        port: u16,
        first_tx: &mut Option<oneshot::Sender<FirstSignal>>,
    ) {
        {
            let mut handle = self.handle();
            if handle.generation != generation {
                return;
            }
            handle.state = ServerState::Ready;
            handle.restart_attempts = 0;
        }
        self.emit(SupervisorEvent::Ready { generation });

        if let Some(tx) = first_tx.take() {
            let _ = tx.send(FirstSignal::Ready);
        }

        let notifier = self.inner.notifier.clone();
        let retry_delay = self.inner.settings.refresh_retry_delay;
        tokio::spawn(async move {
            notify_refresh(notifier.as_ref(), port, retry_delay).await;
        });
    }

    fn on_exit(
        &self,
        generation: u64,
        outcome: ExitOutcome,
        first_tx: Option<oneshot::Sender<FirstSignal>>,
    ) {
        self.emit(SupervisorEvent::Exited {
            generation,
            exit_code: outcome.exit_code,
        });

        let action = {
            let mut handle = self.handle();
            if handle.generation != generation {
                return;
            }
            handle.control = None;

            if handle.terminating {
                handle.state = ServerState::Stopped;
                ExitAction::Stopped
            } else if first_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
                handle.state = ServerState::Crashed;
                ExitAction::ReportToStart
            } else if outcome.success() {
                handle.state = ServerState::Stopped;
                ExitAction::Stopped
            } else if handle.state == ServerState::Ready || handle.restart_attempts > 0 {
                handle.state = ServerState::Restarting;
                ExitAction::Restart
            } else {
                handle.state = ServerState::Crashed;
                ExitAction::Crashed
            }
        };

        match action {
            ExitAction::Stopped => debug!("Server exited with {:?}", outcome.exit_code),
            ExitAction::ReportToStart => {
                if let Some(tx) = first_tx {
                    let _ = tx.send(FirstSignal::Exited(outcome));
                }
            }
            ExitAction::Restart => {
                if !outcome.stderr_tail.is_empty() {
                    error!("Server error output:\n{}", outcome.stderr_tail);
                }
                self.schedule_crash_restart(generation);
            }
            ExitAction::Crashed => {
                error!(
                    "Server exited with {:?} before becoming ready:\n{}",
                    outcome.exit_code, outcome.stderr_tail
                );
            }
        }
    }

    /// Relaunch after the backoff unless the crashed `generation` has been
    /// replaced in the meantime.
    fn schedule_crash_restart(&self, generation: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let policy = supervisor.inner.policy;
            tokio::time::sleep(policy.backoff).await;

            if supervisor.is_restarting() {
                info!("Rebuild restart in progress, skipping crash restart");
                supervisor.emit(SupervisorEvent::RestartSuppressed);
                return;
            }

            let attempt = {
                let mut handle = supervisor.handle();
                if handle.generation != generation || handle.state != ServerState::Restarting {
                    None
                } else {
                    handle.restart_attempts += 1;
                    if handle.restart_attempts > policy.max_attempts {
                        handle.state = ServerState::Crashed;
                    }
                    Some(handle.restart_attempts)
                }
            };
            let Some(attempt) = attempt else {
                info!("Server was replaced during backoff, skipping crash restart");
                supervisor.emit(SupervisorEvent::RestartSuppressed);
                return;
            };

            if attempt > policy.max_attempts {
                error!(
                    "Server failed to start after {} error attempts. Giving up.",
                    policy.max_attempts
                );
                supervisor.emit(SupervisorEvent::RestartsExhausted {
                    attempts: policy.max_attempts,
                });
                let _ = supervisor
                    .inner
                    .session_exit
                    .send(SessionExit::RestartsExhausted);
                return;
            }

            error!(
                "Attempting to restart server after error... (Attempt {}/{})",
                attempt, policy.max_attempts
            );
            supervisor.emit(SupervisorEvent::RestartScheduled { attempt });

            let params = supervisor
                .inner
                .last_launch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(params) = params else {
                warn!("No previous launch to restart");
                return;
            };

            if let Err(e) = supervisor.launch(&params, None).await {
                error!("Restart attempt failed: {e}");
                supervisor.schedule_crash_restart(generation);
            }
        });
    }
}
