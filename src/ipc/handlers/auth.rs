use crate::auth::{self, Role};
use crate::db;
use crate::ipc::helpers::{
    check_len, get_optional_str, get_required_str, new_id, normalize_email, respond, Ctx,
    HandlerErr,
};
use crate::ipc::types::Request;
use crate::store::{self, UserRow, DEFAULT_PROFILE_PICTURE};
use rusqlite::{params, Connection};
use serde_json::json;

pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    pub contact_info: String,
    pub profile_picture: String,
}

pub fn parse_new_user(params: &serde_json::Value) -> Result<NewUser, HandlerErr> {
    let name = get_required_str(params, "name")?;
    check_len(&name, "Name", 2, Some(50))?;
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    check_len(&password, "Password", 6, None)?;
    let contact_info = get_required_str(params, "contactInfo")?;
    check_len(&contact_info, "Contact info", 10, None)?;
    let profile_picture = get_optional_str(params, "profilePicture")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_PROFILE_PICTURE.to_string());
    Ok(NewUser {
        name,
        email,
        password,
        contact_info,
        profile_picture,
    })
}

/// Logs the raw token; delivering it by mail is left to the operator.
fn send_verification(conn: &Connection, user: &UserRow) -> Result<String, HandlerErr> {
    let issued = auth::issue_email_verification(conn, &user.id)?;
    log::info!(
        "event=verification_issued module=auth status=ok user={} email={} token={} expires={}",
        user.id,
        user.email,
        issued.token,
        issued.expires_at
    );
    Ok(issued.expires_at)
}

/// Creates the account and issues its first email verification token.
pub fn insert_user(
    ctx: &Ctx,
    user: &NewUser,
    role: Role,
    created_by: Option<&str>,
) -> Result<UserRow, HandlerErr> {
    let conn = ctx.conn;
    if store::email_taken(conn, &user.email)? {
        return Err(HandlerErr::conflict("User already exists with this email"));
    }
    let password_hash = auth::hash_password(&user.password, ctx.config.bcrypt_cost)?;
    let id = new_id();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, role, profile_picture, contact_info, is_email_verified, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        params![
            id,
            user.name,
            user.email,
            password_hash,
            role.as_str(),
            user.profile_picture,
            user.contact_info,
            created_by,
            now,
            now
        ],
    )?;
    let row = store::load_user(conn, &id)?.ok_or_else(|| HandlerErr::not_found("User not found"))?;
    send_verification(conn, &row)?;
    Ok(row)
}

fn auth_signup(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let new_user = parse_new_user(params)?;
    let role = match get_optional_str(params, "role")? {
        None => Role::Student,
        Some(r) => Role::parse(&r)
            .ok_or_else(|| HandlerErr::bad_params("Role must be student, teacher, or admin"))?,
    };
    let user = insert_user(ctx, &new_user, role, None)?;
    let session = auth::issue_session(ctx.conn, &user.id, ctx.config.session_ttl_hours)?;
    log::info!(
        "event=signup module=auth status=ok user={} role={}",
        user.id,
        user.role
    );
    Ok(json!({
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": user.to_json(),
    }))
}

fn auth_login(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let invalid = || HandlerErr::bad_params("Invalid email or password");
    let user = store::load_user_by_email(ctx.conn, &email)?.ok_or_else(invalid)?;
    if !auth::verify_password(password, &user.password_hash) {
        log::warn!("event=login module=auth status=rejected user={}", user.id);
        return Err(invalid());
    }
    let session = auth::issue_session(ctx.conn, &user.id, ctx.config.session_ttl_hours)?;
    log::info!("event=login module=auth status=ok user={}", user.id);
    Ok(json!({
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": user.to_json(),
    }))
}

fn auth_logout(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let revoked = match ctx.token {
        Some(t) => auth::revoke_session(ctx.conn, t)?,
        None => false,
    };
    log::info!("event=logout module=auth status=ok user={}", caller.user_id);
    Ok(json!({ "loggedOut": revoked }))
}

fn auth_verify_email(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let token = get_required_str(params, "token")?;
    let user_id = auth::confirm_email(ctx.conn, &email, &token)?;
    log::info!("event=verify_email module=auth status=ok user={}", user_id);
    let user = store::load_user(ctx.conn, &user_id)?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    Ok(json!({ "verified": true, "user": user.to_json() }))
}

fn auth_resend_verification(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let user = store::load_user_by_email(ctx.conn, &email)?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    if user.is_email_verified {
        return Err(HandlerErr::bad_params("Email is already verified"));
    }
    let expires_at = send_verification(ctx.conn, &user)?;
    Ok(json!({ "sent": true, "expiresAt": expires_at }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.signup" => auth_signup(ctx, &req.params),
        "auth.login" => auth_login(ctx, &req.params),
        "auth.logout" => auth_logout(ctx),
        "auth.verifyEmail" => auth_verify_email(ctx, &req.params),
        "auth.resendVerification" => auth_resend_verification(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
