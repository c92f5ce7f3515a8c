use crate::error::Result;
use crate::process::ipc::ServerMessage;
use crate::process::launcher::{ExitOutcome, LaunchSpec, ServerControl, ServerInstance, ServerLauncher};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// How a fake server process behaves once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Signal ready, then run until terminated.
    ReadyThenRun,
    /// Signal ready, then exit with the code.
    ReadyThenExit(i32),
    /// Exit with the code without ever signalling ready.
    ExitImmediately(i32),
    /// Run until terminated without signalling ready.
    Silent,
}

/// Scripted launcher for supervisor tests.
///
/// Each launch takes the next scripted behavior, falling back to a fixed one
/// once the script is used up.
#[derive(Debug)]
pub struct FakeLauncher {
    script: StdMutex<VecDeque<FakeBehavior>>,
    fallback: FakeBehavior,
    launches: StdMutex<Vec<LaunchSpec>>,
    live: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(fallback: FakeBehavior) -> Self {
        Self::with_script(Vec::new(), fallback)
    }

    pub fn with_script(script: Vec<FakeBehavior>, fallback: FakeBehavior) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            fallback,
            launches: StdMutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Fake processes currently running.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct FakeControl {
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    done: watch::Receiver<bool>,
}

#[async_trait]
impl ServerControl for FakeControl {
    async fn terminate(&self, _grace: Duration) -> Result<()> {
        if let Some(tx) = self.kill_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let mut done = self.done.clone();
        let _ = done.wait_for(|d| *d).await;
        Ok(())
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ServerInstance> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        self.launches.lock().unwrap().push(spec.clone());
        let pid = self.launch_count() as u32;

        let (message_tx, messages) = mpsc::channel(4);
        let (exit_tx, exited) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = watch::channel(false);

        let live = self.live.clone();
        live.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let outcome = match behavior {
                FakeBehavior::ReadyThenRun => {
                    let _ = message_tx.send(ServerMessage::ServerReady).await;
                    let _ = kill_rx.await;
                    ExitOutcome { exit_code: None, stderr_tail: String::new() }
                }
                FakeBehavior::ReadyThenExit(code) => {
                    let _ = message_tx.send(ServerMessage::ServerReady).await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ExitOutcome {
                        exit_code: Some(code),
                        stderr_tail: "fake server crash".to_string(),
                    }
                }
                FakeBehavior::ExitImmediately(code) => ExitOutcome {
                    exit_code: Some(code),
                    stderr_tail: "fake server failure".to_string(),
                },
                FakeBehavior::Silent => {
                    let _ = kill_rx.await;
                    ExitOutcome { exit_code: None, stderr_tail: String::new() }
                }
            };

            live.fetch_sub(1, Ordering::SeqCst);
            drop(message_tx);
            let _ = done_tx.send(true);
            let _ = exit_tx.send(outcome);
        });

        Ok(ServerInstance {
            pid: Some(pid),
            messages,
            exited,
            control: Box::new(FakeControl {
                kill_tx: StdMutex::new(Some(kill_tx)),
                done: done_rx,
            }),
        })
    }
}
