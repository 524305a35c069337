use crate::auth::Role;
use crate::db;
use crate::ipc::handlers::courses::require_course;
use crate::ipc::helpers::{
    check_len, check_range, fmt_day, get_optional_bool, get_optional_i64, get_optional_str,
    get_required_str, new_id, parse_day_param, require_user_with_role, respond, today, Ctx,
    HandlerErr,
};
use crate::ipc::types::Request;
use crate::store::{self, BatchRow};
use chrono::NaiveDate;
use rusqlite::params;
use serde_json::json;

const DEFAULT_MAX_STUDENTS: i64 = 30;

pub fn require_batch(ctx: &Ctx, batch_id: &str) -> Result<BatchRow, HandlerErr> {
    store::load_batch(ctx.conn, batch_id)?.ok_or_else(|| HandlerErr::not_found("Batch not found"))
}

/// For writes that add to a batch; deleted batches stay readable only.
pub fn require_active_batch(ctx: &Ctx, batch_id: &str) -> Result<BatchRow, HandlerErr> {
    let batch = require_batch(ctx, batch_id)?;
    if !batch.is_active {
        return Err(HandlerErr::bad_params("Batch is not active"));
    }
    Ok(batch)
}

/// Teachers may only act on batches they teach; admins on any.
pub fn check_batch_staff(ctx: &Ctx, batch: &BatchRow) -> Result<(), HandlerErr> {
    let caller = ctx.caller()?;
    if caller.is(Role::Teacher) && batch.teacher_id != caller.user_id {
        return Err(HandlerErr::forbidden(
            "Access denied. You are not assigned to this batch",
        ));
    }
    Ok(())
}

fn check_teacher(ctx: &Ctx, teacher_id: &str) -> Result<(), HandlerErr> {
    match require_user_with_role(ctx.conn, teacher_id, Role::Teacher, "Teacher") {
        Ok(_) => Ok(()),
        Err(e) if e.code == "not_found" || e.code == "bad_params" => Err(HandlerErr::bad_params(
            "Teacher not found or invalid teacher ID",
        )),
        Err(e) => Err(e),
    }
}

fn check_schedule(start: NaiveDate, end: NaiveDate) -> Result<(), HandlerErr> {
    if end <= start {
        return Err(HandlerErr::bad_params("endDate must be after startDate"));
    }
    Ok(())
}

fn check_future_start(start: NaiveDate) -> Result<(), HandlerErr> {
    if start <= today() {
        return Err(HandlerErr::bad_params("startDate must be in the future"));
    }
    Ok(())
}

fn batch_json(ctx: &Ctx, batch: &BatchRow) -> Result<serde_json::Value, HandlerErr> {
    let roster = store::batch_roster(ctx.conn, &batch.id)?;
    Ok(batch.to_json(&roster))
}

fn batches_create(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let name = get_required_str(params, "name")?;
    check_len(&name, "Batch name", 2, Some(100))?;
    let course_id = get_required_str(params, "courseId")?;
    let start = parse_day_param(&get_required_str(params, "startDate")?, "startDate")?;
    let end = parse_day_param(&get_required_str(params, "endDate")?, "endDate")?;
    check_future_start(start)?;
    check_schedule(start, end)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let max_students = get_optional_i64(params, "maxStudents")?.unwrap_or(DEFAULT_MAX_STUDENTS);
    check_range(max_students, "maxStudents", 1, Some(100))?;

    require_course(ctx, &course_id)?;
    check_teacher(ctx, &teacher_id)?;

    let id = new_id();
    let now = db::now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO batches(id, name, course_id, start_date, end_date, teacher_id, max_students, is_active, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        params![
            id,
            name,
            course_id,
            fmt_day(start),
            fmt_day(end),
            teacher_id,
            max_students,
            caller.user_id,
            now,
            now
        ],
    )?;
    log::info!(
        "event=batch_create module=batches status=ok batch={} course={}",
        id,
        course_id
    );
    let batch = require_batch(ctx, &id)?;
    Ok(json!({ "batch": batch_json(ctx, &batch)? }))
}

fn batches_list_by_course(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let batches = store::list_batches_for_course(ctx.conn, &course_id, true)?;
    let mut rows = Vec::with_capacity(batches.len());
    for batch in &batches {
        let teacher = store::load_user(ctx.conn, &batch.teacher_id)?;
        rows.push(json!({
            "id": batch.id,
            "name": batch.name,
            "courseId": batch.course_id,
            "startDate": batch.start_date,
            "endDate": batch.end_date,
            "teacher": teacher.map(|t| t.summary_json()),
            "totalStudents": store::roster_size(ctx.conn, &batch.id)?,
            "maxStudents": batch.max_students,
            "isActive": batch.is_active,
            "createdAt": batch.created_at,
        }));
    }
    Ok(json!({ "batches": rows, "count": rows.len() }))
}

/// Adds a student to the roster; a second add is a no-op. Full batches
/// reject new members.
pub fn add_to_roster(ctx: &Ctx, batch: &BatchRow, student_id: &str) -> Result<bool, HandlerErr> {
    if store::is_in_roster(ctx.conn, &batch.id, student_id)? {
        return Ok(false);
    }
    let size = store::roster_size(ctx.conn, &batch.id)?;
    if size >= batch.max_students {
        return Err(HandlerErr::bad_params("Batch is full").with_details(json!({
            "batchId": batch.id,
            "maxStudents": batch.max_students,
        })));
    }
    ctx.conn.execute(
        "INSERT INTO batch_students(batch_id, student_id, added_at) VALUES(?, ?, ?)",
        params![batch.id, student_id, db::now_rfc3339()],
    )?;
    Ok(true)
}

fn batches_assign_student(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let student_id = get_required_str(params, "studentId")?;
    match require_user_with_role(ctx.conn, &student_id, Role::Student, "Student") {
        Ok(_) => {}
        Err(e) if e.code == "db_query_failed" => return Err(e),
        Err(_) => {
            return Err(HandlerErr::bad_params(
                "Student not found or invalid student ID",
            ))
        }
    }
    let batch = require_active_batch(ctx, &batch_id)?;
    let added = add_to_roster(ctx, &batch, &student_id)?;
    Ok(json!({
        "batch": {
            "id": batch.id,
            "name": batch.name,
            "totalStudents": store::roster_size(ctx.conn, &batch.id)?,
        },
        "added": added,
    }))
}

fn batches_update(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let mut batch = require_batch(ctx, &batch_id)?;
    check_batch_staff(ctx, &batch)?;

    if let Some(name) = get_optional_str(params, "name")? {
        check_len(&name, "Batch name", 2, Some(100))?;
        batch.name = name;
    }
    let new_start = match get_optional_str(params, "startDate")? {
        Some(raw) => {
            let d = parse_day_param(&raw, "startDate")?;
            check_future_start(d)?;
            Some(d)
        }
        None => None,
    };
    let new_end = match get_optional_str(params, "endDate")? {
        Some(raw) => Some(parse_day_param(&raw, "endDate")?),
        None => None,
    };
    if new_start.is_some() || new_end.is_some() {
        let start = match new_start {
            Some(d) => d,
            None => parse_day_param(&batch.start_date, "startDate")?,
        };
        let end = match new_end {
            Some(d) => d,
            None => parse_day_param(&batch.end_date, "endDate")?,
        };
        check_schedule(start, end)?;
        batch.start_date = fmt_day(start);
        batch.end_date = fmt_day(end);
    }
    if let Some(teacher_id) = get_optional_str(params, "teacherId")? {
        check_teacher(ctx, &teacher_id)?;
        batch.teacher_id = teacher_id;
    }
    if let Some(max) = get_optional_i64(params, "maxStudents")? {
        check_range(max, "maxStudents", 1, Some(100))?;
        let size = store::roster_size(ctx.conn, &batch.id)?;
        if max < size {
            return Err(HandlerErr::bad_params(format!(
                "maxStudents cannot be below the current roster size ({})",
                size
            )));
        }
        batch.max_students = max;
    }
    if let Some(active) = get_optional_bool(params, "isActive")? {
        batch.is_active = active;
    }

    ctx.conn.execute(
        "UPDATE batches SET name = ?, start_date = ?, end_date = ?, teacher_id = ?, max_students = ?, is_active = ?, updated_at = ?
         WHERE id = ?",
        params![
            batch.name,
            batch.start_date,
            batch.end_date,
            batch.teacher_id,
            batch.max_students,
            batch.is_active as i64,
            db::now_rfc3339(),
            batch.id
        ],
    )?;
    let batch = require_batch(ctx, &batch_id)?;
    Ok(json!({ "batch": batch_json(ctx, &batch)? }))
}

fn batches_delete(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    require_batch(ctx, &batch_id)?;
    ctx.conn.execute(
        "UPDATE batches SET is_active = 0, updated_at = ? WHERE id = ?",
        params![db::now_rfc3339(), batch_id],
    )?;
    log::info!("event=batch_delete module=batches status=ok batch={}", batch_id);
    Ok(json!({ "batchId": batch_id, "isActive": false }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "batches.create" => batches_create(ctx, &req.params),
        "batches.listByCourse" => batches_list_by_course(ctx, &req.params),
        "batches.assignStudent" => batches_assign_student(ctx, &req.params),
        "batches.update" => batches_update(ctx, &req.params),
        "batches.delete" => batches_delete(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
