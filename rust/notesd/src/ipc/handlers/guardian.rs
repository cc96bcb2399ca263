use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_bool, get_limit, get_optional_str, get_required_str, get_str_list, to_json, with_session,
    Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::store::observations::{self, Observation};
use crate::store::{guardians, media, receipts, Role};
use serde_json::json;

const GUARDIAN: &[Role] = &[Role::Guardian];

/// Guardians only act on observations about students they are actively
/// linked to.
fn linked_observation(ctx: &Ctx<'_>, observation_id: &str) -> Result<Observation, HandlerErr> {
    let obs = observations::find_by_id(ctx.conn, observation_id)?
        .ok_or_else(|| HandlerErr::not_found("observation not found"))?;
    if !guardians::is_linked(ctx.conn, &obs.student_id, &ctx.user.id)? {
        return Err(HandlerErr::forbidden("observation is not about one of your students"));
    }
    Ok(obs)
}

fn ensure_linked_student(ctx: &Ctx<'_>, student_id: &str) -> Result<(), HandlerErr> {
    if guardians::is_linked(ctx.conn, student_id, &ctx.user.id)? {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("student is not linked to you"))
    }
}

fn observations_list(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    if let Some(id) = student_id.as_deref() {
        ensure_linked_student(ctx, id)?;
    }
    let unread_only = get_bool(params, "unreadOnly", false);
    let list = receipts::guardian_observations(ctx.conn, &ctx.user.id, student_id.as_deref(), unread_only)?;
    Ok(json!({ "observations": to_json(&list)? }))
}

fn mark_read(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "observationId")?;
    linked_observation(ctx, &id)?;
    let changed = receipts::mark_as_read(ctx.conn, &id, &ctx.user.id, ctx.client)?;
    Ok(json!({
        "observationId": id,
        "changed": changed,
        "isRead": true,
        "message": if changed { "marked as read" } else { "already read" },
    }))
}

fn mark_unread(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "observationId")?;
    linked_observation(ctx, &id)?;
    let changed = receipts::mark_as_unread(ctx.conn, &id, &ctx.user.id)?;
    Ok(json!({
        "observationId": id,
        "changed": changed,
        "isRead": false,
    }))
}

fn mark_viewed(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "observationId")?;
    linked_observation(ctx, &id)?;
    receipts::mark_as_viewed(ctx.conn, &id, &ctx.user.id, ctx.client)?;
    let receipt = receipts::find(ctx.conn, &id, &ctx.user.id)?;
    Ok(json!({
        "observationId": id,
        "viewedAt": receipt.as_ref().and_then(|r| r.viewed_at.clone()),
        "viewCount": receipt.map(|r| r.view_count).unwrap_or(0),
    }))
}

fn bulk_mark_viewed(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut ids = get_str_list(params, "observationIds")?;
    ids.sort();
    ids.dedup();
    // Every id is checked before any receipt is written.
    for id in &ids {
        linked_observation(ctx, id)?;
    }
    let updated = receipts::bulk_mark_as_viewed(ctx.conn, &ids, &ctx.user.id, ctx.client)?;
    Ok(json!({ "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "guardian.students.list" => with_session(state, req, GUARDIAN, |ctx, _| {
            Ok(json!({
                "students": to_json(&guardians::students_for_guardian(ctx.conn, &ctx.user.id)?)?,
            }))
        }),
        "guardian.observations.list" => with_session(state, req, GUARDIAN, observations_list),
        "guardian.observations.unread" => with_session(state, req, GUARDIAN, |ctx, _| {
            let list = receipts::guardian_observations(ctx.conn, &ctx.user.id, None, true)?;
            Ok(json!({ "observations": to_json(&list)?, "count": list.len() }))
        }),
        "guardian.observations.markRead" => with_session(state, req, GUARDIAN, mark_read),
        "guardian.observations.markUnread" => with_session(state, req, GUARDIAN, mark_unread),
        "guardian.observations.toggleRead" => with_session(state, req, GUARDIAN, |ctx, params| {
            let id = get_required_str(params, "observationId")?;
            linked_observation(ctx, &id)?;
            let is_read = receipts::toggle_read(ctx.conn, &id, &ctx.user.id, ctx.client)?;
            Ok(json!({ "observationId": id, "isRead": is_read }))
        }),
        "guardian.observations.markViewed" => with_session(state, req, GUARDIAN, mark_viewed),
        "guardian.observations.bulkMarkViewed" => with_session(state, req, GUARDIAN, bulk_mark_viewed),
        "guardian.observations.recentViews" => with_session(state, req, GUARDIAN, |ctx, params| {
            let limit = get_limit(params, 10, 100)?;
            Ok(json!({
                "views": to_json(&receipts::recent_views(ctx.conn, &ctx.user.id, limit)?)?,
            }))
        }),
        "guardian.stats" => with_session(state, req, GUARDIAN, |ctx, _| {
            to_json(&receipts::guardian_stats(ctx.conn, &ctx.user.id)?)
        }),
        "guardian.media.list" => with_session(state, req, GUARDIAN, |ctx, params| {
            let student_id = get_required_str(params, "studentId")?;
            ensure_linked_student(ctx, &student_id)?;
            Ok(json!({ "media": to_json(&media::list_for_student(ctx.conn, &student_id)?)? }))
        }),
        _ => return None,
    };
    Some(resp)
}
