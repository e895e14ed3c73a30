use crate::{
    auth::{jwt::JwtKeys, store::UserStore},
    config::AppConfig,
    logs::broadcaster::LogBroadcaster,
    server::{
        probe::{ProcessProbe, SystemProbe},
        supervisor::{LaunchSpec, Supervisor, RESTART_PAUSE},
    },
};
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<UserStore>,
    pub jwt: JwtKeys,
    pub supervisor: Supervisor,
    pub logs: LogBroadcaster,
}

impl AppState {
    pub async fn init(config: AppConfig) -> Self {
        let probe = Arc::new(SystemProbe) as Arc<dyn ProcessProbe>;
        Self::from_parts(config, probe).await
    }

    pub async fn from_parts(config: AppConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        let users = Arc::new(UserStore::open(&config.data_dir).await);
        let logs = LogBroadcaster::default();
        let supervisor =
            Supervisor::with_timing(logs.clone(), probe, config.stop_grace, RESTART_PAUSE);
        Self {
            jwt: JwtKeys::new(&config.jwt),
            config: Arc::new(config),
            users,
            supervisor,
            logs,
        }
    }

    /// How to launch the dedicated server from the configured install directory.
    pub fn launch(&self) -> LaunchSpec {
        LaunchSpec::for_server(&self.config.server_path)
    }

    /// Where the dedicated server writes its console logs.
    pub fn server_log_dir(&self) -> PathBuf {
        self.config.server_path.join("profile").join("logs")
    }

    #[cfg(test)]
    pub async fn fake(data_dir: &std::path::Path) -> Self {
        use crate::{config::JwtConfig, server::probe::NoProbe};
        use std::time::Duration;

        let config = AppConfig {
            data_dir: data_dir.to_path_buf(),
            server_path: data_dir.join("server"),
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test".into(),
                ttl_minutes: 5,
            },
            stop_grace: Duration::from_millis(200),
        };
        Self::from_parts(config, Arc::new(NoProbe)).await
    }
}
