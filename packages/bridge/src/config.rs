use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use codex_bridge_error::BridgeError;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecurityMethod {
    None,
    Keycloak,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub codex_binary_path: Option<PathBuf>,
    pub codex_working_dir: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub base_data_dir: PathBuf,
    /// 0 means unlimited.
    pub max_sessions: usize,
    /// Zero disables the idle reaper.
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub allow_user_id_override: bool,
    pub security_method: SecurityMethod,
    pub turn_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            codex_binary_path: None,
            codex_working_dir: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            base_data_dir: default_base_data_dir(),
            max_sessions: 20,
            idle_timeout: Duration::from_secs(1800),
            cleanup_interval: Duration::from_secs(60),
            allow_user_id_override: true,
            security_method: SecurityMethod::None,
            turn_timeout: Duration::from_secs(600),
        }
    }
}

impl Config {
    /// Path to the codex binary: the configured path when it exists,
    /// otherwise the first `codex` found on `PATH`.
    pub fn resolve_codex_binary(&self) -> Result<PathBuf, BridgeError> {
        if let Some(path) = &self.codex_binary_path {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        if let Some(found) = find_in_path("codex") {
            return Ok(found);
        }

        Err(BridgeError::internal(
            "Codex binary not found. Set CODEX_BINARY_PATH or add codex to PATH.",
        ))
    }

    /// The child's `CODEX_HOME` for one user: `{base}/users/{user_id}`.
    pub fn user_data_dir(&self, user_id: &str) -> PathBuf {
        self.base_data_dir
            .join("users")
            .join(sanitize_path_component(user_id))
    }

    /// Runs `codex --version` to confirm the binary is usable.
    pub async fn check_codex_availability(&self) -> (bool, Option<String>) {
        let Ok(binary) = self.resolve_codex_binary() else {
            return (false, None);
        };

        let output = tokio::time::timeout(
            VERSION_CHECK_TIMEOUT,
            tokio::process::Command::new(&binary)
                .arg("--version")
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (true, Some(version))
            }
            Ok(Ok(_)) | Ok(Err(_)) => (false, None),
            Err(_) => {
                tracing::warn!(binary = %binary.display(), "codex --version timed out");
                (false, None)
            }
        }
    }
}

pub fn default_base_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("codex-bridge"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/codex-bridge"))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// User ids become directory names; anything outside a conservative
/// character set is replaced so a crafted id cannot traverse out of the
/// base data dir.
fn sanitize_path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_dir_neutralizes_separators() {
        let config = Config {
            base_data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        let dir = config.user_data_dir("../../etc/passwd");
        assert_eq!(dir, PathBuf::from("/data/users/.._.._etc_passwd"));
    }

    #[test]
    fn plain_user_ids_are_preserved() {
        let config = Config {
            base_data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        assert_eq!(
            config.user_data_dir("alice-7"),
            PathBuf::from("/data/users/alice-7")
        );
    }
}
