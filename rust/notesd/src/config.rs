use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_MINUTES: u64 = 30;
const DEFAULT_MAX_UPLOAD_MB: u64 = 500;
const DEFAULT_MAX_FILES_PER_UPLOAD: usize = 10;
const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub session_ttl: Duration,
    pub max_upload_bytes: u64,
    pub max_files_per_upload: usize,
    pub admin_email: Option<String>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_MINUTES * 60),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            max_files_per_upload: DEFAULT_MAX_FILES_PER_UPLOAD,
            admin_email: None,
            smtp: None,
        }
    }
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> anyhow::Result<Config> {
        let _ = dotenv::dotenv();
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let session_minutes: u64 = parse_var(&get, "NOTESD_SESSION_MINUTES", DEFAULT_SESSION_MINUTES)?;
        let max_upload_mb: u64 = parse_var(&get, "NOTESD_MAX_UPLOAD_MB", DEFAULT_MAX_UPLOAD_MB)?;
        let max_files: usize = parse_var(
            &get,
            "NOTESD_MAX_FILES_PER_UPLOAD",
            DEFAULT_MAX_FILES_PER_UPLOAD,
        )?;
        if max_files == 0 {
            return Err(anyhow!("NOTESD_MAX_FILES_PER_UPLOAD must be at least 1"));
        }

        let smtp = match get("MAIL_SERVER") {
            Some(server) => {
                let port: u16 = parse_var(&get, "MAIL_PORT", DEFAULT_SMTP_PORT)?;
                let username = get("MAIL_USERNAME");
                let sender = get("MAIL_DEFAULT_SENDER")
                    .or_else(|| username.clone())
                    .ok_or_else(|| {
                        anyhow!("MAIL_DEFAULT_SENDER or MAIL_USERNAME is required with MAIL_SERVER")
                    })?;
                Some(SmtpConfig {
                    server,
                    port,
                    username,
                    password: get("MAIL_PASSWORD"),
                    sender,
                })
            }
            None => None,
        };

        Ok(Config {
            workspace: get("NOTESD_WORKSPACE").map(PathBuf::from),
            session_ttl: Duration::from_secs(session_minutes * 60),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            max_files_per_upload: max_files,
            admin_email: get("NOTESD_ADMIN_EMAIL"),
            smtp,
        })
    }
}

fn parse_var<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
