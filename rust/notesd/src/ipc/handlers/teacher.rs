use base64::Engine;
use serde_json::json;

use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_str, get_required_raw_str, get_required_str, parse_required, to_json, with_session,
    Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::services::guardians as guardian_service;
use crate::services::observations::{self as observation_service, ObservationText, UploadFile};
use crate::services::students as student_service;
use crate::services::uploads::{format_size, UploadPolicy};
use crate::services::users::{new_user_from, UserInput};
use crate::store::{media, observations, receipts, students, ObservationKind, RelationType, Role};

const TEACHER: &[Role] = &[Role::Teacher];
const STAFF: &[Role] = &[Role::Admin, Role::Teacher];

fn observation_text(params: &serde_json::Value) -> Result<ObservationText, HandlerErr> {
    Ok(ObservationText {
        title: get_required_str(params, "title")?,
        description: get_required_str(params, "description")?,
        kind: parse_required(params, "kind", ObservationKind::parse)?,
    })
}

fn observations_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    // Teachers see their own notes; admins may filter by any teacher.
    let teacher_id = match ctx.user.role {
        Role::Admin => get_optional_str(params, "teacherId"),
        _ => Some(ctx.user.id.clone()),
    };
    let list = observations::list(ctx.conn, teacher_id.as_deref(), student_id.as_deref())?;
    Ok(json!({ "observations": to_json(&list)? }))
}

fn observations_get(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "observationId")?;
    let obs = observation_service::get_for(ctx.conn, &ctx.user, &id)?;
    Ok(json!({
        "observation": to_json(&obs)?,
        "media": to_json(&media::list_for_observation(ctx.conn, &id)?)?,
        "readingStatus": to_json(&receipts::reading_status(ctx.conn, &id)?)?,
    }))
}

fn guardians_create(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !students::exists(ctx.conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    if ctx.user.role == Role::Teacher
        && !students::is_assigned_to_teacher(ctx.conn, &student_id, &ctx.user.id)?
    {
        return Err(HandlerErr::forbidden("student is not assigned to you"));
    }
    let input = UserInput {
        email: get_required_str(params, "email")?,
        first_name: get_required_str(params, "firstName")?,
        last_name: get_optional_str(params, "lastName").unwrap_or_default(),
        role_id: Role::Guardian.id(),
        national_id: get_optional_str(params, "nationalId"),
        permit: get_optional_str(params, "permit"),
        password: Some(get_required_raw_str(params, "password")?.to_string()),
        active: true,
    };
    let relation = get_optional_str(params, "relationType").and_then(|r| RelationType::parse(&r));
    let new_guardian = new_user_from(&input)?;
    let (guardian, outcome) =
        guardian_service::create_and_assign(ctx.conn, &new_guardian, &student_id, relation)?;
    Ok(json!({
        "guardian": guardian.to_json(),
        "assignment": to_json(&outcome)?,
    }))
}

fn decode_files(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<Vec<UploadFile>, HandlerErr> {
    let Some(items) = params.get("files").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("files must be an array"));
    };
    let max_bytes = ctx.config.max_upload_bytes;
    let mut files = Vec::with_capacity(items.len());
    for item in items {
        let file_name = get_required_str(item, "fileName")?;
        let encoded = get_required_raw_str(item, "contentBase64")?;
        // Refuse oversized payloads before decoding them.
        if (encoded.len() as u64 / 4) * 3 > max_bytes + 3 {
            return Err(HandlerErr::new(
                "payload_too_large",
                format!("{} is too large (max {} MB)", file_name, max_bytes / (1024 * 1024)),
            )
            .with_details(json!({ "maxMb": max_bytes / (1024 * 1024), "fileName": file_name })));
        }
        let content = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HandlerErr::bad_params(format!("{}: invalid base64: {}", file_name, e)))?;
        files.push(UploadFile { file_name, content });
    }
    Ok(files)
}

fn media_upload(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let observation_id = get_required_str(params, "observationId")?;
    let files = decode_files(ctx, params)?;
    let policy = UploadPolicy {
        max_bytes: ctx.config.max_upload_bytes,
        max_files: ctx.config.max_files_per_upload,
    };
    let saved = observation_service::upload(
        ctx.conn,
        ctx.workspace,
        &policy,
        &ctx.user,
        &observation_id,
        &files,
    )?;
    let total: i64 = saved.iter().map(|m| m.size_bytes).sum();
    Ok(json!({
        "media": to_json(&saved)?,
        "count": saved.len(),
        "totalSize": format_size(total.max(0) as u64),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "teacher.students.list" => with_session(state, req, TEACHER, |ctx, _| {
            let list = student_service::overview(ctx.conn, Some(&ctx.user.id))?;
            Ok(json!({ "students": to_json(&list)? }))
        }),
        "teacher.observations.create" => with_session(state, req, TEACHER, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            let obs = observation_service::create(ctx.conn, &ctx.user, &student_id, &observation_text(params)?)?;
            Ok(json!({ "observation": to_json(&obs)? }))
        }),
        "teacher.observations.list" => with_session(state, req, STAFF, observations_list),
        "teacher.observations.get" => with_session(state, req, STAFF, observations_get),
        "teacher.observations.update" => with_session(state, req, STAFF, |ctx, params| {
            let id = get_required_str(params, "observationId")?;
            let obs = observation_service::update(ctx.conn, &ctx.user, &id, &observation_text(params)?)?;
            Ok(json!({ "observation": to_json(&obs)? }))
        }),
        "teacher.observations.delete" => with_session(state, req, STAFF, |ctx, params| {
            let id = get_required_str(params, "observationId")?;
            let removed = observation_service::delete(ctx.conn, ctx.workspace, &ctx.user, &id)?;
            Ok(json!({ "deleted": true, "mediaRemoved": removed }))
        }),
        "teacher.observations.readingStatus" => with_session(state, req, STAFF, |ctx, params| {
            let id = get_required_str(params, "observationId")?;
            observation_service::get_for(ctx.conn, &ctx.user, &id)?;
            Ok(json!({ "guardians": to_json(&receipts::reading_status(ctx.conn, &id)?)? }))
        }),
        "teacher.stats" => with_session(state, req, TEACHER, |ctx, _| {
            to_json(&receipts::teacher_stats(ctx.conn, &ctx.user.id)?)
        }),
        "teacher.guardians.create" => with_session(state, req, STAFF, guardians_create),
        "teacher.media.upload" => with_session(state, req, STAFF, media_upload),
        "teacher.media.list" => with_session(state, req, STAFF, |ctx, params| {
            let id = get_required_str(params, "observationId")?;
            observation_service::get_for(ctx.conn, &ctx.user, &id)?;
            Ok(json!({ "media": to_json(&media::list_for_observation(ctx.conn, &id)?)? }))
        }),
        _ => return None,
    };
    Some(resp)
}
