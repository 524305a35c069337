use crate::db;
use crate::ipc::helpers::{
    check_len, check_range, get_optional_bool, get_optional_f64, get_optional_i64,
    get_optional_str, get_required_f64, get_required_i64, get_required_str, new_id, respond, Ctx,
    HandlerErr,
};
use crate::ipc::types::Request;
use crate::store::{self, CourseRow};
use rusqlite::params;
use serde_json::json;

fn check_name(name: &str) -> Result<(), HandlerErr> {
    check_len(name, "Course name", 2, Some(100))
}

fn check_description(description: &str) -> Result<(), HandlerErr> {
    check_len(description, "Description", 10, None)
}

fn check_duration(months: i64) -> Result<(), HandlerErr> {
    check_range(months, "Duration (months)", 1, Some(36))
}

fn check_fees(fees: f64) -> Result<(), HandlerErr> {
    check_range(fees, "Fees", 0.0, None)
}

pub fn require_course(ctx: &Ctx, course_id: &str) -> Result<CourseRow, HandlerErr> {
    store::load_course(ctx.conn, course_id)?.ok_or_else(|| HandlerErr::not_found("Course not found"))
}

fn courses_create(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let name = get_required_str(params, "name")?;
    check_name(&name)?;
    let description = get_required_str(params, "description")?;
    check_description(&description)?;
    let duration = get_required_i64(params, "duration")?;
    check_duration(duration)?;
    let fees = get_required_f64(params, "fees")?;
    check_fees(fees)?;

    let id = new_id();
    let now = db::now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO courses(id, name, description, duration, fees, is_active, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?, ?)",
        params![id, name, description, duration, fees, caller.user_id, now, now],
    )?;
    log::info!("event=course_create module=courses status=ok course={}", id);
    Ok(json!({ "course": require_course(ctx, &id)?.to_json() }))
}

fn courses_list(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let courses = store::list_courses(ctx.conn, true)?;
    let rows: Vec<serde_json::Value> = courses.iter().map(CourseRow::to_json).collect();
    Ok(json!({ "courses": rows, "count": rows.len() }))
}

fn courses_update(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let mut course = require_course(ctx, &course_id)?;
    if let Some(name) = get_optional_str(params, "name")? {
        check_name(&name)?;
        course.name = name;
    }
    if let Some(description) = get_optional_str(params, "description")? {
        check_description(&description)?;
        course.description = description;
    }
    if let Some(duration) = get_optional_i64(params, "duration")? {
        check_duration(duration)?;
        course.duration = duration;
    }
    if let Some(fees) = get_optional_f64(params, "fees")? {
        check_fees(fees)?;
        course.fees = fees;
    }
    if let Some(active) = get_optional_bool(params, "isActive")? {
        course.is_active = active;
    }
    ctx.conn.execute(
        "UPDATE courses SET name = ?, description = ?, duration = ?, fees = ?, is_active = ?, updated_at = ?
         WHERE id = ?",
        params![
            course.name,
            course.description,
            course.duration,
            course.fees,
            course.is_active as i64,
            db::now_rfc3339(),
            course.id
        ],
    )?;
    Ok(json!({ "course": require_course(ctx, &course_id)?.to_json() }))
}

fn courses_delete(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_course(ctx, &course_id)?;
    ctx.conn.execute(
        "UPDATE courses SET is_active = 0, updated_at = ? WHERE id = ?",
        params![db::now_rfc3339(), course_id],
    )?;
    log::info!("event=course_delete module=courses status=ok course={}", course_id);
    Ok(json!({ "courseId": course_id, "isActive": false }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.create" => courses_create(ctx, &req.params),
        "courses.list" => courses_list(ctx),
        "courses.update" => courses_update(ctx, &req.params),
        "courses.delete" => courses_delete(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
