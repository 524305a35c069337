use crate::auth::Role;
use crate::db;
use crate::ipc::handlers::batches::{add_to_roster, require_active_batch};
use crate::ipc::handlers::courses::require_course;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, new_id, require_user_with_role, respond, Ctx, HandlerErr,
};
use crate::ipc::types::Request;
use crate::store::{self, EnrollmentRow, ENROLLMENT_STATUSES};
use rusqlite::{params, OptionalExtension};
use serde_json::json;

pub fn require_enrollment(ctx: &Ctx, enrollment_id: &str) -> Result<EnrollmentRow, HandlerErr> {
    store::load_enrollment(ctx.conn, enrollment_id)?
        .ok_or_else(|| HandlerErr::not_found("Enrollment not found"))
}

/// Enrollment with course and batch names resolved.
fn enrollment_json(ctx: &Ctx, e: &EnrollmentRow) -> Result<serde_json::Value, HandlerErr> {
    let mut v = e.to_json();
    let course = store::load_course(ctx.conn, &e.course_id)?;
    v["course"] = match course {
        Some(c) => json!({ "id": c.id, "name": c.name, "duration": c.duration, "fees": c.fees }),
        None => serde_json::Value::Null,
    };
    v["batch"] = match e.batch_id.as_deref() {
        Some(bid) => match store::load_batch(ctx.conn, bid)? {
            Some(b) => json!({ "id": b.id, "name": b.name, "startDate": b.start_date, "endDate": b.end_date }),
            None => serde_json::Value::Null,
        },
        None => serde_json::Value::Null,
    };
    Ok(v)
}

fn enrollments_json(ctx: &Ctx, rows: &[EnrollmentRow]) -> Result<serde_json::Value, HandlerErr> {
    let items = rows
        .iter()
        .map(|e| enrollment_json(ctx, e))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "enrollments": items, "count": items.len() }))
}

fn enrollments_enroll(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let course_id = get_required_str(params, "courseId")?;
    let student_id = if caller.is(Role::Student) {
        if let Some(other) = get_optional_str(params, "studentId")? {
            if other != caller.user_id {
                return Err(HandlerErr::forbidden(
                    "Access denied. Students can only enroll themselves",
                ));
            }
        }
        caller.user_id.clone()
    } else {
        get_optional_str(params, "studentId")?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                HandlerErr::bad_params("studentId is required when enrolling as admin/teacher")
            })?
    };

    match require_user_with_role(ctx.conn, &student_id, Role::Student, "Student") {
        Ok(_) => {}
        Err(e) if e.code == "db_query_failed" => return Err(e),
        Err(_) => return Err(HandlerErr::bad_params("Student not found or invalid student")),
    }
    let course = require_course(ctx, &course_id)?;
    if !course.is_active {
        return Err(HandlerErr::bad_params("Course is not active"));
    }
    let existing: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND course_id = ?",
            [&student_id, &course_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr::conflict("Student is already enrolled in this course")
            .with_details(json!({ "enrollmentId": existing_id })));
    }

    let id = new_id();
    let now = db::now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO enrollments(id, student_id, course_id, batch_id, enrollment_date, status, created_at, updated_at)
         VALUES(?, ?, ?, NULL, ?, 'active', ?, ?)",
        params![id, student_id, course_id, now, now, now],
    )?;
    log::info!(
        "event=enroll module=enrollments status=ok enrollment={} student={} course={}",
        id,
        student_id,
        course_id
    );
    let enrollment = require_enrollment(ctx, &id)?;
    Ok(json!({ "enrollment": enrollment_json(ctx, &enrollment)? }))
}

fn enrollments_mine(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let rows = store::list_enrollments_for_student(ctx.conn, &caller.user_id)?;
    enrollments_json(ctx, &rows)
}

fn enrollments_by_student(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let student_id = get_optional_str(params, "studentId")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| caller.user_id.clone());
    ctx.check_student_scope(&student_id)?;
    let rows = store::list_enrollments_for_student(ctx.conn, &student_id)?;
    enrollments_json(ctx, &rows)
}

fn enrollments_by_course(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_course(ctx, &course_id)?;
    let rows = store::list_enrollments_for_course(ctx.conn, &course_id)?;
    let mut items = Vec::with_capacity(rows.len());
    for e in &rows {
        let mut v = enrollment_json(ctx, e)?;
        v["student"] = store::load_user(ctx.conn, &e.student_id)?
            .map(|u| u.summary_json())
            .unwrap_or(serde_json::Value::Null);
        items.push(v);
    }
    Ok(json!({ "enrollments": items, "count": items.len() }))
}

fn enrollments_assign_batch(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let batch_id = get_required_str(params, "batchId")?;
    let enrollment = require_enrollment(ctx, &enrollment_id)?;
    let batch = require_active_batch(ctx, &batch_id)?;
    if batch.course_id != enrollment.course_id {
        return Err(HandlerErr::bad_params(
            "Batch does not belong to the enrolled course",
        ));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    add_to_roster(ctx, &batch, &enrollment.student_id)?;
    tx.execute(
        "UPDATE enrollments SET batch_id = ?, status = 'active', updated_at = ? WHERE id = ?",
        params![batch.id, db::now_rfc3339(), enrollment.id],
    )?;
    tx.commit()?;

    let enrollment = require_enrollment(ctx, &enrollment_id)?;
    Ok(json!({ "enrollment": enrollment_json(ctx, &enrollment)? }))
}

fn enrollments_update_status(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let status = get_required_str(params, "status")?;
    if !ENROLLMENT_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of {}",
            ENROLLMENT_STATUSES.join(", ")
        )));
    }
    require_enrollment(ctx, &enrollment_id)?;
    ctx.conn.execute(
        "UPDATE enrollments SET status = ?, updated_at = ? WHERE id = ?",
        params![status, db::now_rfc3339(), enrollment_id],
    )?;
    let enrollment = require_enrollment(ctx, &enrollment_id)?;
    Ok(json!({ "enrollment": enrollment_json(ctx, &enrollment)? }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "enrollments.enroll" => enrollments_enroll(ctx, &req.params),
        "enrollments.mine" => enrollments_mine(ctx),
        "enrollments.byStudent" => enrollments_by_student(ctx, &req.params),
        "enrollments.byCourse" => enrollments_by_course(ctx, &req.params),
        "enrollments.assignBatch" => enrollments_assign_batch(ctx, &req.params),
        "enrollments.updateStatus" => enrollments_update_status(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
