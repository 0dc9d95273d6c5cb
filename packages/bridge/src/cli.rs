use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{default_base_data_dir, Config, SecurityMethod, DEFAULT_HOST, DEFAULT_PORT};
use crate::router::{build_router, AppState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "codex-bridge")]
#[command(about = "HTTP API bridge for codex app-server", version)]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "api-key", env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Path to the codex binary; resolved from PATH when unset.
    #[arg(long, env = "CODEX_BINARY_PATH")]
    codex_binary_path: Option<PathBuf>,

    /// Working directory for the child processes.
    #[arg(long, env = "CODEX_WORKING_DIR")]
    codex_working_dir: Option<PathBuf>,

    /// Root for per-user CODEX_HOME directories.
    #[arg(long, env = "BASE_DATA_DIR")]
    base_data_dir: Option<PathBuf>,

    /// Registry capacity cap; 0 means unlimited.
    #[arg(long, env = "MAX_SESSIONS", default_value_t = 20)]
    max_sessions: usize,

    /// Idle seconds before a session is reaped; 0 disables the reaper.
    #[arg(long, env = "IDLE_TIMEOUT_SECONDS", default_value_t = 1800)]
    idle_timeout_seconds: u64,

    #[arg(long, env = "CLEANUP_INTERVAL_SECONDS", default_value_t = 60)]
    cleanup_interval_seconds: u64,

    /// Per-turn wall clock limit in seconds.
    #[arg(long, env = "TURN_TIMEOUT_SECONDS", default_value_t = 600)]
    turn_timeout_seconds: u64,

    #[arg(
        long,
        env = "ALLOW_USER_ID_OVERRIDE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    allow_user_id_override: bool,

    #[arg(long, env = "SECURITY_METHOD", value_enum, default_value = "none")]
    security_method: SecurityMethod,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            openai_api_key: self.openai_api_key,
            codex_binary_path: self.codex_binary_path,
            codex_working_dir: self.codex_working_dir,
            host: self.host,
            port: self.port,
            base_data_dir: self.base_data_dir.unwrap_or_else(default_base_data_dir),
            max_sessions: self.max_sessions,
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            allow_user_id_override: self.allow_user_id_override,
            security_method: self.security_method,
            turn_timeout: Duration::from_secs(self.turn_timeout_seconds),
        }
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.into_config();

    if config.openai_api_key.is_some() {
        tracing::info!("OpenAI API key: configured");
    } else {
        tracing::warn!("OPENAI_API_KEY not set");
    }
    match config.resolve_codex_binary() {
        Ok(binary) => tracing::info!(binary = %binary.display(), "codex binary resolved"),
        Err(_) => tracing::warn!("codex binary not found"),
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config));
    let _reaper = state.manager().spawn_reaper();
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "server listening");

    let shutdown_state = state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown_state.manager().shutdown(SHUTDOWN_GRACE).await;
        })
        .await?;

    Ok(())
}
