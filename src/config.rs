use std::{path::PathBuf, time::Duration};

use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Directory holding `users.json`.
    pub data_dir: PathBuf,
    /// Install directory of the dedicated server.
    pub server_path: PathBuf,
    pub jwt: JwtConfig,
    pub stop_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("ARSM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let server_path = std::env::var("SERVER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_server_path());

        let secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => {
                warn!("JWT_SECRET not set; generated a random secret, tokens will not survive a restart");
                random_secret()
            }
        };
        let jwt = JwtConfig {
            secret,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "arsm".into()),
            ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 24),
        };
        let stop_grace = Duration::from_secs(
            std::env::var("STOP_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3),
        );

        anyhow::ensure!(jwt.ttl_minutes > 0, "JWT_TTL_MINUTES must be positive");

        Ok(Self {
            data_dir,
            server_path,
            jwt,
            stop_grace,
        })
    }
}

fn default_server_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if cfg!(windows) {
        PathBuf::from("C:\\ArmaReforgerServer")
    } else {
        home.join("arma-reforger-server")
    }
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}
