use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub fs_root: PathBuf,
    pub main_site: String,
    pub port: u16,
    pub secret_key: String,
    pub algorithm: String,
    pub access_token_expire_minutes: i64,
    pub superuser_username: String,
    pub superuser_email: String,
    pub superuser_first_name: String,
    pub superuser_last_name: String,
    pub superuser_password: String,
    pub elastic_url: String,
    pub worker_poll_interval_ms: u64,
    pub worker_heartbeat_seconds: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional_string("MB_DATABASE_URL")
            .context("MB_DATABASE_URL must be set for the record store")?;
        let database_url = normalize_database_url(database_url);

        let fs_root = env_path("MB_FS_ROOT", "/tmp/mb_fs_root")?;
        let port = env_u16("MB_PORT", 8000);
        let main_site = env_string("MB_MAIN_SITE", &format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let secret_key =
            env_optional_string("MB_SECRET_KEY").context("MB_SECRET_KEY must be set")?;
        let algorithm = env_string("MB_ALGORITHM", "HS256");
        if algorithm != "HS256" {
            anyhow::bail!("MB_ALGORITHM only supports HS256, got {algorithm}");
        }
        let access_token_expire_minutes =
            env_u64("MB_ACCESS_TOKEN_EXPIRE_MINUTES", 30).clamp(1, 7 * 24 * 60) as i64;

        let superuser_username = env_string("MB_SUPERUSER_USERNAME", "admin");
        let superuser_email = env_string("MB_SUPERUSER_EMAIL", "admin@localhost");
        let superuser_first_name = env_string("MB_SUPERUSER_FIRST_NAME", "Super");
        let superuser_last_name = env_string("MB_SUPERUSER_LAST_NAME", "User");
        let superuser_password = env_optional_string("MB_SUPERUSER_PASSWORD")
            .context("MB_SUPERUSER_PASSWORD must be set")?;

        let elastic_url = env_string("MB_ELASTIC_URL", "http://localhost:9200")
            .trim_end_matches('/')
            .to_string();

        let worker_poll_interval_ms = env_u64("MB_WORKER_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let worker_heartbeat_seconds =
            env_u64("MB_WORKER_HEARTBEAT_SECONDS", 30).clamp(5, 600) as i64;

        let mut config = Self {
            database_url,
            fs_root,
            main_site,
            port,
            secret_key,
            algorithm,
            access_token_expire_minutes,
            superuser_username,
            superuser_email,
            superuser_first_name,
            superuser_last_name,
            superuser_password,
            elastic_url,
            worker_poll_interval_ms,
            worker_heartbeat_seconds,
        };
        config.fs_root = validate_fs_root(config.fs_root)?;
        Ok(config)
    }

    /// Whether a blob URI points at this deployment's own `/access/` tree.
    pub fn is_local_uri(&self, uri: &str) -> bool {
        uri.strip_prefix(&self.main_site)
            .is_some_and(|rest| rest.starts_with("/access/"))
    }
}

fn validate_fs_root(path: PathBuf) -> Result<PathBuf> {
    if !path.is_absolute() {
        anyhow::bail!("MB_FS_ROOT must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("MB_FS_ROOT must not contain '..' segments");
        }
    }
    Ok(path)
}

/// Blob paths arrive from the wire; keep them inside the filesystem root.
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim_start_matches('/');
    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => anyhow::bail!("path {relative} escapes the filesystem root"),
        }
    }
    Ok(root.join(candidate))
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
