use crate::backup;
use crate::ipc::error::{finish, HandlerErr};
use crate::ipc::helpers::{
    close_logs, get_bool, get_limit, get_optional_i64, get_optional_str, get_required_str,
    no_workspace, require_user, to_json, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::services::registrations as registration_service;
use crate::services::students as student_service;
use crate::services::users::{self as user_service, UserInput};
use crate::store::audit::{self, AuditFilter, DEFAULT_PAGE_SIZE};
use crate::store::students::{self, StudentFields};
use crate::store::{
    guardians, media, notifications, observations, registrations, sessions as session_logs, users,
    AuditAction, RequestStatus, Role,
};
use serde_json::json;
use std::path::PathBuf;

const ADMIN: &[Role] = &[Role::Admin];

fn user_input(params: &serde_json::Value) -> Result<UserInput, HandlerErr> {
    let role_id = get_optional_i64(params, "roleId")?
        .ok_or_else(|| HandlerErr::bad_params("missing roleId"))?;
    Ok(UserInput {
        email: get_required_str(params, "email")?,
        first_name: get_required_str(params, "firstName")?,
        last_name: get_optional_str(params, "lastName").unwrap_or_default(),
        role_id,
        national_id: get_optional_str(params, "nationalId"),
        permit: get_optional_str(params, "permit"),
        password: params
            .get("password")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .map(str::to_string),
        active: get_bool(params, "active", true),
    })
}

fn users_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = match get_optional_i64(params, "roleId")? {
        Some(id) => Some(
            Role::from_id(id)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown roleId {}", id)))?,
        ),
        None => None,
    };
    let list = users::list(ctx.conn, role)?;
    Ok(json!({
        "users": list.iter().map(|u| u.to_json()).collect::<Vec<_>>(),
    }))
}

fn users_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let user = users::find_by_id(ctx.conn, &user_id)?
        .ok_or_else(|| HandlerErr::not_found("user not found"))?;
    let mut out = json!({ "user": user.to_json() });
    if user.role == Role::Guardian {
        out["students"] = to_json(&guardians::students_for_guardian(ctx.conn, &user.id)?)?;
    }
    Ok(out)
}

/// Deactivation and deletion also end the target's open sessions.
fn users_toggle_active(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let admin = require_user(state, req, ADMIN)?;
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace());
    };
    let user_id = get_required_str(&req.params, "userId")?;
    let active = user_service::toggle_active(conn, &admin.id, &user_id)?;
    if !active {
        let ended = state.sessions.drop_user(&user_id);
        close_logs(conn, &ended);
    }
    Ok(json!({ "userId": user_id, "active": active }))
}

fn users_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let admin = require_user(state, req, ADMIN)?;
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace());
    };
    let user_id = get_required_str(&req.params, "userId")?;
    user_service::delete_user(conn, &admin.id, &user_id)?;
    let ended = state.sessions.drop_user(&user_id);
    close_logs(conn, &ended);
    Ok(json!({ "deleted": true }))
}

fn audit_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let action = match get_optional_str(params, "action") {
        Some(a) => Some(
            AuditAction::parse(&a)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown action {}", a)))?,
        ),
        None => None,
    };
    let filter = AuditFilter {
        start: get_optional_str(params, "start"),
        end: get_optional_str(params, "end"),
        action,
        admin_id: get_optional_str(params, "adminId"),
        text: get_optional_str(params, "text"),
        offset: get_optional_i64(params, "offset")?.unwrap_or(0).max(0),
        limit: get_limit(params, DEFAULT_PAGE_SIZE, 500)?,
    };
    let (entries, total) = audit::list(ctx.conn, &filter)?;
    Ok(json!({
        "entries": to_json(&entries)?,
        "total": total,
        "offset": filter.offset,
        "limit": filter.limit,
    }))
}

fn dashboard_stats(ctx: &Ctx<'_>) -> Result<serde_json::Value, HandlerErr> {
    let (media_count, media_bytes) = media::totals(ctx.conn)?;
    Ok(json!({
        "users": to_json(&users::counts(ctx.conn)?)?,
        "students": students::count(ctx.conn)?,
        "observations": observations::count(ctx.conn)?,
        "media": {
            "count": media_count,
            "bytes": media_bytes,
            "size": crate::services::uploads::format_size(media_bytes.max(0) as u64),
        },
        "sessions": to_json(&session_logs::stats(ctx.conn)?)?,
        "pendingRegistrations": registrations::pending_count(ctx.conn)?,
        "unreadNotifications": notifications::unread_count(ctx.conn)?,
    }))
}

fn student_fields(params: &serde_json::Value) -> Result<StudentFields, HandlerErr> {
    Ok(StudentFields {
        first_name: get_required_str(params, "firstName")?,
        last_name: get_required_str(params, "lastName")?,
        grade: get_required_str(params, "grade")?,
        birth_date: get_optional_str(params, "birthDate"),
        teacher_id: get_optional_str(params, "teacherId"),
        enrolled_at: get_optional_str(params, "enrolledAt"),
        health_provider: get_optional_str(params, "healthProvider"),
        special_conditions: get_optional_str(params, "specialConditions"),
        active: get_bool(params, "active", true),
    })
}

fn students_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = students::find_by_id(ctx.conn, &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({
        "student": to_json(&student)?,
        "guardians": to_json(&guardians::active_links_for_student(ctx.conn, &student_id)?)?,
        "observations": to_json(&observations::list(ctx.conn, None, Some(&student_id))?)?,
    }))
}

fn registrations_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = match get_optional_str(params, "status") {
        Some(s) => Some(
            RequestStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status {}", s)))?,
        ),
        None => None,
    };
    Ok(json!({
        "requests": to_json(&registrations::list(ctx.conn, status)?)?,
        "pendingCount": registrations::pending_count(ctx.conn)?,
    }))
}

fn registrations_approve(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let role_id = get_optional_i64(params, "roleId")?.unwrap_or(Role::Teacher.id());
    let role = Role::from_id(role_id)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown roleId {}", role_id)))?;
    let (user, password) = registration_service::approve(ctx.conn, &request_id, role)?;
    log::info!("registration {} approved by {}", request_id, ctx.user.email);
    Ok(json!({
        "user": user.to_json(),
        "temporaryPassword": password,
    }))
}

fn workspace_export(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let summary = backup::export_workspace_bundle(ctx.conn, ctx.workspace, &out_path)
        .map_err(|e| {
            log::error!("export failed: {:#}", e);
            HandlerErr::new("export_failed", format!("{e:#}"))
        })?;
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "totalBytes": summary.total_bytes,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "admin.users.list" => with_session(state, req, ADMIN, users_list),
        "admin.users.get" => with_session(state, req, ADMIN, users_get),
        "admin.users.create" => with_session(state, req, ADMIN, |ctx, params| {
            let input = user_input(params)?;
            if input.password.is_none() {
                return Err(HandlerErr::bad_params("missing password"));
            }
            let user = user_service::create_user(ctx.conn, &ctx.user.id, &input)?;
            Ok(json!({ "user": user.to_json() }))
        }),
        "admin.users.update" => with_session(state, req, ADMIN, |ctx, params| {
            let user_id = get_required_str(params, "userId")?;
            let user = user_service::update_user(ctx.conn, &ctx.user.id, &user_id, &user_input(params)?)?;
            Ok(json!({ "user": user.to_json() }))
        }),
        "admin.users.toggleActive" => finish(&req.id, users_toggle_active(state, req)),
        "admin.users.delete" => finish(&req.id, users_delete(state, req)),
        "admin.users.resetPassword" => with_session(state, req, ADMIN, |ctx, params| {
            let user_id = get_required_str(params, "userId")?;
            let password = user_service::reset_password(ctx.conn, &ctx.user.id, &user_id)?;
            Ok(json!({ "userId": user_id, "temporaryPassword": password }))
        }),
        "admin.audit.list" => with_session(state, req, ADMIN, audit_list),
        "admin.audit.recent" => with_session(state, req, ADMIN, |ctx, params| {
            let limit = get_limit(params, 10, 100)?;
            Ok(json!({ "entries": to_json(&audit::recent(ctx.conn, limit)?)? }))
        }),
        "admin.sessions.list" => with_session(state, req, ADMIN, |ctx, params| {
            let limit = get_limit(params, 50, 500)?;
            Ok(json!({ "sessions": to_json(&session_logs::list(ctx.conn, limit)?)? }))
        }),
        "admin.sessions.stats" => with_session(state, req, ADMIN, |ctx, _| {
            to_json(&session_logs::stats(ctx.conn)?)
        }),
        "admin.dashboard.stats" => with_session(state, req, ADMIN, |ctx, _| dashboard_stats(ctx)),
        "admin.students.list" => with_session(state, req, ADMIN, |ctx, params| {
            let teacher_id = get_optional_str(params, "teacherId");
            let list = student_service::overview(ctx.conn, teacher_id.as_deref())?;
            Ok(json!({ "students": to_json(&list)? }))
        }),
        "admin.students.get" => with_session(state, req, ADMIN, students_get),
        "admin.students.create" => with_session(state, req, ADMIN, |ctx, params| {
            let student = student_service::create(ctx.conn, &student_fields(params)?)?;
            Ok(json!({ "student": to_json(&student)? }))
        }),
        "admin.students.update" => with_session(state, req, ADMIN, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            let student = student_service::update(ctx.conn, &student_id, &student_fields(params)?)?;
            Ok(json!({ "student": to_json(&student)? }))
        }),
        "admin.students.setTeacher" => with_session(state, req, ADMIN, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            let teacher_id = get_optional_str(params, "teacherId");
            let student = student_service::set_teacher(ctx.conn, &student_id, teacher_id.as_deref())?;
            Ok(json!({ "student": to_json(&student)? }))
        }),
        "admin.students.delete" => with_session(state, req, ADMIN, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            let removed = student_service::delete(ctx.conn, ctx.workspace, &student_id)?;
            Ok(json!({ "deleted": true, "mediaRemoved": removed }))
        }),
        "admin.registrations.list" => with_session(state, req, ADMIN, registrations_list),
        "admin.registrations.approve" => with_session(state, req, ADMIN, registrations_approve),
        "admin.registrations.reject" => with_session(state, req, ADMIN, |ctx, params| {
            let request_id = get_required_str(params, "requestId")?;
            registration_service::reject(ctx.conn, &request_id)?;
            Ok(json!({ "requestId": request_id, "status": RequestStatus::Rechazada.as_str() }))
        }),
        "admin.registrations.delete" => with_session(state, req, ADMIN, |ctx, params| {
            let request_id = get_required_str(params, "requestId")?;
            if !registrations::delete(ctx.conn, &request_id)? {
                return Err(HandlerErr::not_found("registration request not found"));
            }
            Ok(json!({ "deleted": true }))
        }),
        "admin.notifications.list" => with_session(state, req, ADMIN, |ctx, params| {
            let limit = get_limit(params, 20, 200)?;
            Ok(json!({
                "notifications": to_json(&notifications::recent(ctx.conn, limit)?)?,
                "unreadCount": notifications::unread_count(ctx.conn)?,
            }))
        }),
        "admin.notifications.markRead" => with_session(state, req, ADMIN, |ctx, params| {
            let id = get_required_str(params, "notificationId")?;
            if !notifications::mark_read(ctx.conn, &id)? {
                return Err(HandlerErr::not_found("notification not found"));
            }
            Ok(json!({ "updated": true }))
        }),
        "admin.notifications.markAllRead" => with_session(state, req, ADMIN, |ctx, _| {
            Ok(json!({ "updated": notifications::mark_all_read(ctx.conn)? }))
        }),
        "admin.workspace.export" => with_session(state, req, ADMIN, workspace_export),
        _ => return None,
    };
    Some(resp)
}
