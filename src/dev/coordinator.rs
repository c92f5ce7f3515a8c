use crate::config::env::EnvSource;
use crate::error::Result;
use crate::process::{StartOptions, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Restarts the server once a watch-triggered build has finished.
pub struct RebuildCoordinator {
    supervisor: Supervisor,
    env_source: Arc<dyn EnvSource>,
    output_dir: PathBuf,
    port: u16,
    options: StartOptions,
}

impl RebuildCoordinator {
    pub fn new(
        supervisor: Supervisor,
        env_source: Arc<dyn EnvSource>,
        output_dir: PathBuf,
        port: u16,
        options: StartOptions,
    ) -> Self {
        Self {
            supervisor,
            env_source,
            output_dir,
            port,
            options,
        }
    }

    /// Swap the running server for one started from the fresh output.
    ///
    /// Returns `false` without doing anything while another restart is in
    /// flight; such triggers are dropped, not queued.
    pub async fn on_build_finished(&self) -> Result<bool> {
        let Some(_guard) = self.supervisor.try_begin_restart() else {
            debug!("Restart already in progress, dropping rebuild trigger");
            return Ok(false);
        };

        info!("[devserve] Restarting server...");
        self.supervisor.stop().await?;
        let env_vars = self.env_source.load().await?;
        self.supervisor
            .start(&self.output_dir, self.port, env_vars, self.options.clone())
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DevServeError;
    use crate::process::refresh::MockRefreshNotifier;
    use crate::process::{RestartPolicy, RefreshNotifier, SupervisorSettings};
    use crate::test_utils::{FakeBehavior, FakeLauncher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticEnv(HashMap<String, String>);

    #[async_trait]
    impl EnvSource for StaticEnv {
        async fn load(&self) -> Result<HashMap<String, String>> {
            Ok(self.0.clone())
        }
    }

    /// Fails the first load, succeeds afterwards.
    struct FlakyEnv(AtomicUsize);

    #[async_trait]
    impl EnvSource for FlakyEnv {
        async fn load(&self) -> Result<HashMap<String, String>> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DevServeError::ConfigError("bad .env".to_string()))
            } else {
                Ok(HashMap::new())
            }
        }
    }

    fn supervisor(launcher: Arc<FakeLauncher>) -> Supervisor {
        let mut notifier = MockRefreshNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));
        let notifier: Arc<dyn RefreshNotifier> = Arc::new(notifier);
        let (supervisor, _exit) = Supervisor::new(
            launcher,
            notifier,
            RestartPolicy::default(),
            SupervisorSettings::default(),
        );
        supervisor
    }

    fn coordinator(supervisor: Supervisor, env: Arc<dyn EnvSource>) -> RebuildCoordinator {
        RebuildCoordinator::new(
            supervisor,
            env,
            PathBuf::from("/app/.devserve/output"),
            4111,
            StartOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_rebuild_restarts_with_fresh_env() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::ReadyThenRun));
        let supervisor = supervisor(launcher.clone());
        let env = HashMap::from([("API_KEY".to_string(), "secret".to_string())]);
        let coordinator = coordinator(supervisor.clone(), Arc::new(StaticEnv(env)));

        supervisor
            .start(
                Path::new("/app/.devserve/output"),
                4111,
                HashMap::new(),
                StartOptions::default(),
            )
            .await
            .unwrap();

        assert!(coordinator.on_build_finished().await.unwrap());
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.live_count(), 1);
        assert!(!supervisor.is_restarting());

        let relaunch = &launcher.launches()[1];
        assert_eq!(relaunch.env_vars.get("API_KEY"), Some(&"secret".to_string()));
        assert_eq!(relaunch.env_vars.get("PORT"), Some(&"4111".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_restart() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::ReadyThenRun));
        let supervisor = supervisor(launcher.clone());
        let coordinator = coordinator(supervisor.clone(), Arc::new(StaticEnv(HashMap::new())));

        supervisor
            .start(
                Path::new("/app/.devserve/output"),
                4111,
                HashMap::new(),
                StartOptions::default(),
            )
            .await
            .unwrap();

        let (first, second) =
            tokio::join!(coordinator.on_build_finished(), coordinator.on_build_finished());
        let mut results = vec![first.unwrap(), second.unwrap()];
        results.sort();

        assert_eq!(results, vec![false, true]);
        assert_eq!(launcher.launch_count(), 2);
        assert_eq!(launcher.live_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_while_flag_held_is_dropped() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::ReadyThenRun));
        let supervisor = supervisor(launcher.clone());
        let coordinator = coordinator(supervisor.clone(), Arc::new(StaticEnv(HashMap::new())));

        let guard = supervisor.try_begin_restart().unwrap();
        assert!(!coordinator.on_build_finished().await.unwrap());
        assert_eq!(launcher.launch_count(), 0);

        drop(guard);
        assert!(coordinator.on_build_finished().await.unwrap());
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_flag_released_after_error() {
        let launcher = Arc::new(FakeLauncher::new(FakeBehavior::ReadyThenRun));
        let supervisor = supervisor(launcher.clone());
        let coordinator = coordinator(supervisor.clone(), Arc::new(FlakyEnv(AtomicUsize::new(0))));

        assert!(coordinator.on_build_finished().await.is_err());
        assert!(!supervisor.is_restarting());

        assert!(coordinator.on_build_finished().await.unwrap());
        assert_eq!(launcher.launch_count(), 1);
    }
}
