use base64::Engine;
use serde_json::json;

use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_bool, get_required_str, to_json, with_session, Ctx, ANY_ROLE};
use crate::ipc::types::{AppState, Request};
use crate::services::observations as observation_service;
use crate::services::uploads::{format_size, remove_stored_file, resolve_stored_path};
use crate::store::media::{self, Media};
use crate::store::{observations, Role};

fn load(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<Media, HandlerErr> {
    let id = get_required_str(params, "mediaId")?;
    media::find_by_id(ctx.conn, &id)?.ok_or_else(|| HandlerErr::not_found("media not found"))
}

fn fetch(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let item = load(ctx, params)?;
    // Access follows the owning observation.
    observation_service::get_for(ctx.conn, &ctx.user, &item.observation_id)?;
    let path = resolve_stored_path(ctx.workspace, &item.stored_path)?;
    if !path.is_file() {
        log::warn!("media {} has no file at {}", item.id, path.display());
        return Err(HandlerErr::not_found("media file is missing"));
    }
    let mut out = json!({
        "media": to_json(&item)?,
        "path": path.to_string_lossy(),
        "size": format_size(item.size_bytes.max(0) as u64),
    });
    if get_bool(params, "inline", false) {
        let bytes = std::fs::read(&path).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
        out["contentBase64"] = base64::engine::general_purpose::STANDARD.encode(bytes).into();
    }
    Ok(out)
}

fn delete(ctx: &Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let item = load(ctx, params)?;
    if !ctx.is_admin() {
        let obs = observations::find_by_id(ctx.conn, &item.observation_id)?
            .ok_or_else(|| HandlerErr::not_found("observation not found"))?;
        if obs.teacher_id != ctx.user.id {
            return Err(HandlerErr::forbidden("only the owning teacher may delete this file"));
        }
    }
    if !media::delete(ctx.conn, &item.id)? {
        return Err(HandlerErr::not_found("media not found"));
    }
    remove_stored_file(ctx.workspace, &item.stored_path);
    log::info!("media {} deleted by {}", item.id, ctx.user.email);
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "media.fetch" => Some(with_session(state, req, ANY_ROLE, fetch)),
        "media.delete" => Some(with_session(state, req, &[Role::Admin, Role::Teacher], delete)),
        _ => None,
    }
}
