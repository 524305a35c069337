use crate::auth::{self, Role};
use crate::db;
use crate::ipc::handlers::auth::{insert_user, parse_new_user};
use crate::ipc::helpers::{
    check_len, get_optional_str, get_required_str, require_user_with_role, respond, Ctx,
    HandlerErr,
};
use crate::ipc::types::Request;
use crate::store::{self, UserRow};
use rusqlite::params;
use serde_json::json;

fn own_user(ctx: &Ctx) -> Result<UserRow, HandlerErr> {
    let caller = ctx.caller()?;
    store::load_user(ctx.conn, &caller.user_id)?.ok_or_else(|| HandlerErr::not_found("User not found"))
}

fn users_profile(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "user": own_user(ctx)?.to_json() }))
}

fn users_update_profile(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut user = own_user(ctx)?;
    if let Some(name) = get_optional_str(params, "name")? {
        check_len(&name, "Name", 2, Some(50))?;
        user.name = name;
    }
    if let Some(contact) = get_optional_str(params, "contactInfo")? {
        check_len(&contact, "Contact info", 10, None)?;
        user.contact_info = contact;
    }
    if let Some(picture) = get_optional_str(params, "profilePicture")? {
        if picture.is_empty() {
            return Err(HandlerErr::bad_params("profilePicture must not be empty"));
        }
        user.profile_picture = picture;
    }
    ctx.conn.execute(
        "UPDATE users SET name = ?, contact_info = ?, profile_picture = ?, updated_at = ? WHERE id = ?",
        params![
            user.name,
            user.contact_info,
            user.profile_picture,
            db::now_rfc3339(),
            user.id
        ],
    )?;
    let user = own_user(ctx)?;
    Ok(json!({ "user": user.to_json() }))
}

fn users_change_password(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let current = params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing currentPassword"))?;
    let next = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing newPassword"))?;
    check_len(next, "New password", 6, None)?;
    let user = own_user(ctx)?;
    if !auth::verify_password(current, &user.password_hash) {
        return Err(HandlerErr::bad_params("Current password is incorrect"));
    }
    let password_hash = auth::hash_password(next, ctx.config.bcrypt_cost)?;
    ctx.conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        params![password_hash, db::now_rfc3339(), user.id],
    )?;
    log::info!("event=password_change module=users status=ok user={}", user.id);
    Ok(json!({ "changed": true }))
}

fn teachers_create(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let new_user = parse_new_user(params)?;
    let teacher = insert_user(ctx, &new_user, Role::Teacher, Some(&caller.user_id))?;
    log::info!(
        "event=teacher_create module=users status=ok teacher={} by={}",
        teacher.id,
        caller.user_id
    );
    Ok(json!({ "teacher": teacher.to_json() }))
}

fn teachers_list(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let teachers = store::list_users_by_role(ctx.conn, Role::Teacher.as_str())?;
    let rows: Vec<serde_json::Value> = teachers.iter().map(UserRow::to_json).collect();
    Ok(json!({ "teachers": rows, "count": rows.len() }))
}

fn teachers_get(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let teacher = require_user_with_role(ctx.conn, &teacher_id, Role::Teacher, "Teacher")?;
    Ok(json!({ "teacher": teacher.to_json() }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.profile" => users_profile(ctx),
        "users.updateProfile" => users_update_profile(ctx, &req.params),
        "users.changePassword" => users_change_password(ctx, &req.params),
        "teachers.create" => teachers_create(ctx, &req.params),
        "teachers.list" => teachers_list(ctx),
        "teachers.get" => teachers_get(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
