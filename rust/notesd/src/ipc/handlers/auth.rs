use crate::ipc::error::{finish, HandlerErr};
use crate::ipc::helpers::{
    close_logs, get_optional_i64, get_optional_str, get_required_raw_str, get_required_str,
    no_workspace, parse_required, to_json, with_session, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::services::auth::{self, LoginMethod};
use crate::services::registrations::{self as registration_service, RegistrationInput};
use crate::services::users as user_service;
use crate::store::sessions as session_logs;
use serde_json::json;

fn login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace());
    };
    let params = &req.params;
    let method = parse_required(params, "loginMethod", LoginMethod::parse)?;
    let identifier = method.normalize(&get_required_str(params, "identifier")?);
    let password = get_required_raw_str(params, "password")?;
    auth::validate_identifier_format(method, &identifier)?;

    // Sweep idle sessions so their logs get a logout time.
    let expired = state.sessions.purge_expired();
    close_logs(conn, &expired);

    let Some(user) = auth::authenticate(conn, method, &identifier, password)? else {
        log::info!("failed login via {:?} for {}", method, identifier);
        return Err(HandlerErr::new("invalid_credentials", "invalid credentials"));
    };
    if !user.active {
        log::info!("login refused for inactive account {}", user.email);
        return Err(HandlerErr::new(
            "account_inactive",
            "account is inactive; contact an administrator",
        ));
    }

    let log_id = session_logs::open_log(
        conn,
        &user.id,
        req.client.ip.as_deref(),
        req.client.user_agent.as_deref(),
    )?;
    let token = state.sessions.open(&user.id, &log_id);
    log::info!("login: {} ({})", user.email, user.role.display_name());
    Ok(json!({
        "session": token,
        "home": user.role.home(),
        "user": user.to_json(),
    }))
}

fn logout(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(token) = req.session.as_deref() else {
        return Err(HandlerErr::unauthenticated("login required"));
    };
    let Some(session) = state.sessions.close(token) else {
        return Ok(json!({ "loggedOut": false }));
    };
    if let Some(conn) = state.db.as_ref() {
        close_logs(conn, std::slice::from_ref(&session));
    }
    Ok(json!({ "loggedOut": true }))
}

fn register(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let AppState {
        db, config, mailer, ..
    } = state;
    let Some(conn) = db.as_ref() else {
        return Err(no_workspace());
    };
    let params = &req.params;
    let input = RegistrationInput {
        name: get_required_str(params, "name")?,
        email: get_required_str(params, "email")?,
        phone: get_required_str(params, "phone")?,
        school_name: get_optional_str(params, "schoolName"),
        student_count: get_optional_i64(params, "studentCount")?,
    };
    let request = registration_service::submit(
        conn,
        mailer.as_ref(),
        config.admin_email.as_deref(),
        &input,
    )?;
    Ok(json!({ "request": to_json(&request)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(finish(&req.id, login(state, req))),
        "auth.logout" => Some(finish(&req.id, logout(state, req))),
        "auth.register" => Some(finish(&req.id, register(state, req))),
        "auth.me" => Some(with_session(state, req, ANY_ROLE, |ctx, _| {
            Ok(json!({
                "home": ctx.user.role.home(),
                "user": ctx.user.to_json(),
            }))
        })),
        "auth.changePassword" => Some(with_session(state, req, ANY_ROLE, |ctx, params| {
            let current = get_required_raw_str(params, "currentPassword")?;
            let new_password = get_required_raw_str(params, "newPassword")?;
            user_service::change_password(ctx.conn, &ctx.user.id, current, new_password)?;
            log::info!("password changed by {}", ctx.user.email);
            Ok(json!({ "changed": true }))
        })),
        _ => None,
    }
}
