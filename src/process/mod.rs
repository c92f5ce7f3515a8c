pub mod ipc;
pub mod launcher;
pub mod refresh;
pub mod supervisor;

pub use ipc::{IpcPath, ServerMessage};
pub use launcher::{ExitOutcome, LaunchSpec, NodeLauncher, ServerControl, ServerInstance, ServerLauncher};
pub use refresh::{HttpRefreshNotifier, RefreshNotifier};
pub use supervisor::{
    RestartGuard, RestartPolicy, ServerState, SessionExit, StartOptions, Supervisor,
    SupervisorEvent, SupervisorSettings,
};
