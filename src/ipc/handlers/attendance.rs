use crate::auth::Role;
use crate::calc::{self, AttendanceRecord};
use crate::db;
use crate::ipc::handlers::batches::{check_batch_staff, require_active_batch, require_batch};
use crate::ipc::helpers::{
    fmt_day, get_optional_str, get_required_str, get_str_list, new_id, parse_day_param, respond,
    Ctx, HandlerErr,
};
use crate::ipc::types::Request;
use crate::sources::{AttendanceRecordSource, SqliteSource};
use crate::store;
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};

fn student_names(
    ctx: &Ctx,
    ids: impl IntoIterator<Item = String>,
) -> Result<HashMap<String, String>, HandlerErr> {
    let mut out = HashMap::new();
    for id in ids {
        if out.contains_key(&id) {
            continue;
        }
        if let Some(u) = store::load_user(ctx.conn, &id)? {
            out.insert(id, u.name);
        }
    }
    Ok(out)
}

fn named_list(ids: &BTreeSet<String>, names: &HashMap<String, String>) -> Vec<serde_json::Value> {
    ids.iter()
        .map(|id| {
            json!({
                "id": id,
                "name": names.get(id).map(String::as_str).unwrap_or("Unknown"),
            })
        })
        .collect()
}

fn attendance_mark(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let batch_id = get_required_str(params, "batchId")?;
    let date = parse_day_param(&get_required_str(params, "date")?, "date")?;
    let present: BTreeSet<String> = get_str_list(params, "presentStudents")?.into_iter().collect();
    let absent: BTreeSet<String> = get_str_list(params, "absentStudents")?.into_iter().collect();

    let both: Vec<&String> = present.intersection(&absent).collect();
    if !both.is_empty() {
        return Err(HandlerErr::bad_params(
            "A student cannot be both present and absent",
        )
        .with_details(json!({ "studentIds": both })));
    }

    let batch = require_active_batch(ctx, &batch_id)?;
    check_batch_staff(ctx, &batch)?;

    let mut unknown = Vec::new();
    for sid in present.iter().chain(absent.iter()) {
        let is_student = store::load_user(ctx.conn, sid)?
            .map(|u| u.role == Role::Student.as_str())
            .unwrap_or(false);
        if !is_student {
            unknown.push(sid.clone());
        }
    }
    if !unknown.is_empty() {
        return Err(HandlerErr::bad_params("Unknown student ids")
            .with_details(json!({ "studentIds": unknown })));
    }

    let day = fmt_day(date);
    let existing: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM attendance WHERE batch_id = ? AND date = ?",
            [&batch_id, &day],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::conflict("Attendance already marked for this date")
            .with_details(json!({ "batchId": batch_id, "date": day })));
    }

    let id = new_id();
    let now = db::now_rfc3339();
    let total = (present.len() + absent.len()) as i64;
    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO attendance(id, batch_id, date, total_students, recorded_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![id, batch_id, day, total, caller.user_id, now, now],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO attendance_marks(attendance_id, student_id, present) VALUES(?, ?, ?)",
        )?;
        for sid in &present {
            stmt.execute(params![id, sid, 1])?;
        }
        for sid in &absent {
            stmt.execute(params![id, sid, 0])?;
        }
    }
    tx.commit()?;
    log::info!(
        "event=attendance_mark module=attendance status=ok batch={} date={} present={} absent={}",
        batch_id,
        day,
        present.len(),
        absent.len()
    );

    Ok(json!({
        "attendance": {
            "id": id,
            "batchId": batch_id,
            "date": day,
            "presentCount": present.len(),
            "absentCount": absent.len(),
            "totalStudents": total,
            "recordedBy": caller.user_id,
        }
    }))
}

fn record_json(
    record: &AttendanceRecord,
    recorded_by: Option<&str>,
    names: &HashMap<String, String>,
) -> serde_json::Value {
    json!({
        "id": record.id,
        "date": fmt_day(record.date),
        "presentStudents": named_list(&record.present, names),
        "absentStudents": named_list(&record.absent, names),
        "totalStudents": record.total_students,
        "recordedBy": recorded_by,
    })
}

fn recorded_by(ctx: &Ctx, attendance_id: &str) -> Result<Option<String>, HandlerErr> {
    Ok(ctx
        .conn
        .query_row(
            "SELECT recorded_by FROM attendance WHERE id = ?",
            [attendance_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn attendance_by_batch(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let batch_id = get_required_str(params, "batchId")?;
    let batch = require_batch(ctx, &batch_id)?;
    if caller.is(Role::Student) && !store::is_in_roster(ctx.conn, &batch.id, &caller.user_id)? {
        return Err(HandlerErr::forbidden(
            "Access denied. You are not a member of this batch",
        ));
    }

    let records = SqliteSource::new(ctx.conn).fetch_by_batch(&batch.id)?;
    let names = student_names(
        ctx,
        records
            .iter()
            .flat_map(|r| r.present.iter().chain(r.absent.iter()).cloned()),
    )?;
    let mut rows = Vec::with_capacity(records.len());
    for record in &records {
        let by = recorded_by(ctx, &record.id)?;
        rows.push(record_json(record, by.as_deref(), &names));
    }
    Ok(json!({ "batchId": batch.id, "attendance": rows, "count": rows.len() }))
}

fn attendance_by_student(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ctx.check_student_scope(&student_id)?;
    let batch_id = get_optional_str(params, "batchId")?.filter(|s| !s.is_empty());

    let records =
        SqliteSource::new(ctx.conn).fetch_by_student(&student_id, batch_id.as_deref())?;
    let mut rows = Vec::with_capacity(records.len());
    for record in &records {
        rows.push(json!({
            "id": record.id,
            "date": fmt_day(record.date),
            "batchId": record.batch_id,
            "status": record.status_of(&student_id).unwrap_or("absent"),
            "recordedBy": recorded_by(ctx, &record.id)?,
        }));
    }
    let summary = calc::summarize(&records, &student_id);
    Ok(json!({ "studentId": student_id, "attendance": rows, "summary": summary }))
}

fn attendance_stats(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = require_batch(ctx, &batch_id)?;
    let roster = store::batch_roster(ctx.conn, &batch.id)?;
    let records = SqliteSource::new(ctx.conn).fetch_by_batch(&batch.id)?;
    let stats = calc::batch_attendance(&roster, &records);
    Ok(json!({ "batchId": batch.id, "statistics": stats }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.mark" => attendance_mark(ctx, &req.params),
        "attendance.byBatch" => attendance_by_batch(ctx, &req.params),
        "attendance.byStudent" => attendance_by_student(ctx, &req.params),
        "attendance.stats" => attendance_stats(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
