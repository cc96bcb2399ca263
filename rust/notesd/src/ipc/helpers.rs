use std::path::Path;

use rusqlite::Connection;

use super::error::{finish, HandlerErr};
use super::session::{Lookup, Session, SessionStore};
use super::types::{AppState, Request};
use crate::config::Config;
use crate::services::mail::Mailer;
use crate::store::receipts::ClientInfo;
use crate::store::users::{self, User};
use crate::store::{sessions as session_logs, Role};

pub const ANY_ROLE: &[Role] = &[Role::Admin, Role::Teacher, Role::Guardian];

/// What an authenticated handler gets to work with.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub workspace: &'a Path,
    pub config: &'a Config,
    pub mailer: &'a dyn Mailer,
    pub user: User,
    pub client: ClientInfo<'a>,
}

impl Ctx<'_> {
    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }
}

pub fn no_workspace() -> HandlerErr {
    HandlerErr::new("no_workspace", "select a workspace first")
}

/// Runs `f` with a validated session whose user holds one of `roles`.
pub fn with_session<F>(state: &mut AppState, req: &Request, roles: &[Role], f: F) -> serde_json::Value
where
    F: FnOnce(&Ctx<'_>, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    finish(&req.id, run_with_session(state, req, roles, f))
}

fn run_with_session<F>(
    state: &mut AppState,
    req: &Request,
    roles: &[Role],
    f: F,
) -> Result<serde_json::Value, HandlerErr>
where
    F: FnOnce(&Ctx<'_>, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let AppState {
        workspace,
        db,
        config,
        sessions,
        mailer,
    } = state;
    let (Some(conn), Some(workspace)) = (db.as_ref(), workspace.as_ref()) else {
        return Err(no_workspace());
    };
    let user = authorize(conn, sessions, req, roles)?;
    let ctx = Ctx {
        conn,
        workspace,
        config,
        mailer: mailer.as_ref(),
        user,
        client: ClientInfo {
            ip: req.client.ip.as_deref(),
            user_agent: req.client.user_agent.as_deref(),
        },
    };
    f(&ctx, &req.params)
}

fn authorize(
    conn: &Connection,
    sessions: &mut SessionStore,
    req: &Request,
    roles: &[Role],
) -> Result<User, HandlerErr> {
    let user = authenticate_request(conn, sessions, req)?;
    if !roles.contains(&user.role) {
        return Err(HandlerErr::forbidden(format!(
            "{} is not allowed for {}",
            req.method,
            user.role.display_name()
        )));
    }
    Ok(user)
}

/// Session check for handlers that also need to touch the session store.
pub fn require_user(state: &mut AppState, req: &Request, roles: &[Role]) -> Result<User, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace());
    };
    authorize(conn, &mut state.sessions, req, roles)
}

/// Resolves the request's token to a live, active user. Accounts that were
/// deactivated or deleted since login lose their session here.
pub fn authenticate_request(
    conn: &Connection,
    sessions: &mut SessionStore,
    req: &Request,
) -> Result<User, HandlerErr> {
    let Some(token) = req.session.as_deref() else {
        return Err(HandlerErr::unauthenticated("login required"));
    };
    let session = match sessions.touch(token) {
        Lookup::Active(s) => s,
        Lookup::Expired(s) => {
            close_logs(conn, &[s]);
            return Err(HandlerErr::unauthenticated("session expired"));
        }
        Lookup::Unknown => return Err(HandlerErr::unauthenticated("unknown session")),
    };
    match users::find_by_id(conn, &session.user_id)? {
        Some(u) if u.active => Ok(u),
        Some(_) => {
            let ended: Vec<Session> = sessions.close(token).into_iter().collect();
            close_logs(conn, &ended);
            Err(HandlerErr::new("account_inactive", "account is inactive"))
        }
        None => {
            let ended: Vec<Session> = sessions.close(token).into_iter().collect();
            close_logs(conn, &ended);
            Err(HandlerErr::unauthenticated("account no longer exists"))
        }
    }
}

/// Stamps logout time on the logs of ended sessions; failures are logged.
pub fn close_logs(conn: &Connection, ended: &[Session]) {
    for s in ended {
        if let Err(e) = session_logs::close_log(conn, &s.log_id) {
            log::warn!("could not close session log {}: {}", s.log_id, e);
        }
    }
}

/// Runs `f` against the open workspace without a session (public methods).
pub fn with_db<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let res = match state.db.as_ref() {
        Some(conn) => f(conn, &req.params),
        None => Err(no_workspace()),
    };
    finish(&req.id, res)
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Passwords and base64 payloads are taken verbatim.
pub fn get_required_raw_str<'p>(
    params: &'p serde_json::Value,
    key: &str,
) -> Result<&'p str, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

pub fn get_str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must hold strings", key)))
        })
        .collect()
}

/// Limit parameter clamped to `1..=max`.
pub fn get_limit(params: &serde_json::Value, default: i64, max: i64) -> Result<i64, HandlerErr> {
    Ok(get_optional_i64(params, "limit")?
        .unwrap_or(default)
        .clamp(1, max))
}

pub fn parse_required<T>(
    params: &serde_json::Value,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("invalid {}: {}", key, raw)))
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}
