use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, to_json, with_session, Ctx, ANY_ROLE};
use crate::ipc::types::{AppState, Request};
use crate::services::guardians::{self as guardian_service, GuardianCommand, MAX_GUARDIANS_PER_STUDENT};
use crate::store::{guardians, students, RelationType, Role};
use serde_json::json;

const STAFF: &[Role] = &[Role::Admin, Role::Teacher];

/// Admins reach every student, teachers their assigned ones and guardians
/// (read-only callers) the students they are linked to.
fn ensure_student_access(ctx: &Ctx<'_>, student_id: &str) -> Result<(), HandlerErr> {
    if !students::exists(ctx.conn, student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let allowed = match ctx.user.role {
        Role::Admin => true,
        Role::Teacher => students::is_assigned_to_teacher(ctx.conn, student_id, &ctx.user.id)?,
        Role::Guardian => guardians::is_linked(ctx.conn, student_id, &ctx.user.id)?,
    };
    if allowed {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("you do not have access to this student"))
    }
}

fn list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ensure_student_access(ctx, &student_id)?;
    let links = guardians::active_links_for_student(ctx.conn, &student_id)?;
    Ok(json!({
        "studentId": student_id,
        "activeCount": links.len(),
        "maxGuardians": MAX_GUARDIANS_PER_STUDENT,
        "guardians": to_json(&links)?,
    }))
}

fn run(ctx: &Ctx<'_>, cmd: GuardianCommand<'_>) -> Result<serde_json::Value, HandlerErr> {
    let outcome = guardian_service::execute(ctx.conn, &cmd)?;
    to_json(&outcome)
}

fn assign(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let guardian_id = get_required_str(params, "guardianId")?;
    ensure_student_access(ctx, &student_id)?;
    // An unknown type counts as unspecified and gets resolved.
    let relation = get_optional_str(params, "relationType").and_then(|r| RelationType::parse(&r));
    run(
        ctx,
        GuardianCommand::Assign {
            student_id: &student_id,
            guardian_id: &guardian_id,
            relation,
        },
    )
}

fn remove(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let guardian_id = get_required_str(params, "guardianId")?;
    ensure_student_access(ctx, &student_id)?;
    run(
        ctx,
        GuardianCommand::Remove {
            student_id: &student_id,
            guardian_id: &guardian_id,
        },
    )
}

fn change_type(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let guardian_id = get_required_str(params, "guardianId")?;
    let raw = get_required_str(params, "relationType")?;
    let relation = RelationType::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("invalid relationType: {}", raw)))?;
    ensure_student_access(ctx, &student_id)?;
    run(
        ctx,
        GuardianCommand::ChangeType {
            student_id: &student_id,
            guardian_id: &guardian_id,
            relation,
        },
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "students.guardians.list" => with_session(state, req, ANY_ROLE, list),
        "students.guardians.history" => with_session(state, req, STAFF, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            ensure_student_access(ctx, &student_id)?;
            Ok(json!({
                "links": to_json(&guardians::history_for_student(ctx.conn, &student_id)?)?,
            }))
        }),
        "students.guardians.available" => with_session(state, req, STAFF, |ctx, params| {
            let student_id = get_optional_str(params, "studentId");
            if let Some(id) = student_id.as_deref() {
                ensure_student_access(ctx, id)?;
            }
            Ok(json!({
                "guardians": to_json(&guardians::available_guardians(ctx.conn, student_id.as_deref())?)?,
            }))
        }),
        "students.guardians.byGuardian" => with_session(state, req, STAFF, |ctx, params| {
            let guardian_id = get_required_str(params, "guardianId")?;
            let mut list = guardians::students_for_guardian(ctx.conn, &guardian_id)?;
            if ctx.user.role == Role::Teacher {
                let mut visible = Vec::with_capacity(list.len());
                for s in list {
                    if students::is_assigned_to_teacher(ctx.conn, &s.student_id, &ctx.user.id)? {
                        visible.push(s);
                    }
                }
                list = visible;
            }
            Ok(json!({ "students": to_json(&list)? }))
        }),
        "students.guardians.assign" => with_session(state, req, STAFF, assign),
        "students.guardians.remove" => with_session(state, req, STAFF, remove),
        "students.guardians.changeType" => with_session(state, req, STAFF, change_type),
        _ => return None,
    };
    Some(resp)
}
