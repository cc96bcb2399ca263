use std::path::PathBuf;

use anyhow::Context;
use rusqlite::Connection;
use serde::Deserialize;

use super::helpers::close_logs;
use super::session::SessionStore;
use crate::config::Config;
use crate::db;
use crate::services::mail::Mailer;
use crate::store::sessions as session_logs;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Token returned by `auth.login`.
    #[serde(default)]
    pub session: Option<String>,
    /// Origin of the end user's action, relayed by the front end.
    #[serde(default)]
    pub client: ClientMeta,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: Config,
    pub sessions: SessionStore,
    pub mailer: Box<dyn Mailer>,
}

impl AppState {
    pub fn new(config: Config, mailer: Box<dyn Mailer>) -> Self {
        AppState {
            workspace: None,
            db: None,
            sessions: SessionStore::new(config.session_ttl),
            config,
            mailer,
        }
    }

    /// Switches to `path`, creating or migrating its database. Sessions of
    /// the previous workspace end here.
    pub fn open_workspace(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let conn = db::open_db(&path)
            .with_context(|| format!("failed to open workspace {}", path.to_string_lossy()))?;
        self.close_workspace();
        match session_logs::close_dangling(&conn) {
            Ok(0) => {}
            Ok(n) => log::info!("closed {} session logs left open by a previous run", n),
            Err(e) => log::warn!("could not close dangling session logs: {}", e),
        }
        log::info!("workspace open: {}", path.display());
        self.workspace = Some(path);
        self.db = Some(conn);
        Ok(())
    }

    /// Ends every session and drops the connection.
    pub fn close_workspace(&mut self) {
        let ended = self.sessions.clear();
        if let Some(conn) = self.db.as_ref() {
            close_logs(conn, &ended);
        }
        self.db = None;
        self.workspace = None;
    }
}
