mod app;
mod auth;
mod config;
mod error;
mod logs;
mod server;
mod state;

use crate::{config::AppConfig, logs::tailer::LogTailer, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "reforger_panel=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        server_path = %config.server_path.display(),
        "configuration loaded"
    );

    let app_state = AppState::init(config).await;

    if app_state.users.is_enabled().await {
        tracing::info!(path = %app_state.users.path().display(), "authentication enabled");
        if app_state.users.uses_default_password().await {
            tracing::warn!("the admin account still uses the default password; change it after logging in");
        }
    } else {
        tracing::warn!("authentication disabled; every request is treated as admin");
    }

    LogTailer::new(app_state.server_log_dir(), app_state.logs.clone()).spawn();

    app::serve(app::build_app(app_state)).await
}
