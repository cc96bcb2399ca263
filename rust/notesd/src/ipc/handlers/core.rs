use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{close_logs, get_optional_str, get_required_raw_str, get_required_str, with_db};
use crate::ipc::types::{AppState, Request};
use crate::services::users::{self as user_service, UserInput};
use crate::store::{users, Role};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "activeSessions": state.sessions.active_count(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match state.open_workspace(path.clone()) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

fn handle_workspace_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let bundle = match get_required_str(&req.params, "bundlePath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };
    let path = match get_required_str(&req.params, "path") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    let expired = state.sessions.purge_expired();
    if let Some(conn) = state.db.as_ref() {
        close_logs(conn, &expired);
    }
    let live = state.sessions.active_count();
    if live > 0 {
        return err(
            &req.id,
            "conflict",
            "log out every session before importing a workspace",
            Some(json!({ "activeSessions": live })),
        );
    }
    if let Err(e) = backup::verify_workspace_bundle(&bundle) {
        log::warn!("rejected bundle {}: {:#}", bundle.display(), e);
        return err(&req.id, "import_failed", format!("{e:#}"), None);
    }

    // The database file is replaced underneath us, so nothing may hold it.
    let previous = state.workspace.clone();
    state.close_workspace();

    let summary = match backup::import_workspace_bundle(&bundle, &path) {
        Ok(s) => s,
        Err(e) => {
            log::error!("import of {} failed: {:#}", bundle.display(), e);
            if let Some(prev) = previous {
                if let Err(e) = state.open_workspace(prev) {
                    log::error!("could not reopen previous workspace: {:#}", e);
                }
            }
            return err(&req.id, "import_failed", format!("{e:#}"), None);
        }
    };
    if let Err(e) = state.open_workspace(path.clone()) {
        return err(&req.id, "db_open_failed", format!("{e:#}"), None);
    }
    ok(
        &req.id,
        json!({
            "workspacePath": path.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "entryCount": summary.entry_count,
            "exportedAt": summary.exported_at,
        }),
    )
}

fn handle_bootstrap_admin(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_db(state, req, |conn, params| {
        let input = UserInput {
            email: get_required_str(params, "email")?,
            first_name: get_required_str(params, "firstName")?,
            last_name: get_optional_str(params, "lastName").unwrap_or_default(),
            role_id: Role::Admin.id(),
            national_id: get_optional_str(params, "nationalId"),
            permit: get_optional_str(params, "permit"),
            password: Some(get_required_raw_str(params, "password")?.to_string()),
            active: true,
        };
        let user = user_service::bootstrap_admin(conn, &input)?;
        log::info!("first administrator created: {}", user.email);
        Ok(json!({ "user": user.to_json() }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "workspace.import" => Some(handle_workspace_import(state, req)),
        "setup.bootstrapAdmin" => Some(handle_bootstrap_admin(state, req)),
        "setup.status" => Some(with_db(state, req, |conn, _| {
            Ok(json!({
                "adminExists": users::admin_exists(conn)?,
            }))
        })),
        _ => None,
    }
}
