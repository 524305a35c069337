use crate::auth::Role;
use crate::calc::{self, Grade};
use crate::db;
use crate::ipc::handlers::batches::{check_batch_staff, require_active_batch, require_batch};
use crate::ipc::helpers::{
    check_len, check_range, get_optional_f64, get_optional_i64, get_optional_str,
    get_required_f64, get_required_i64, get_required_str, new_id, parse_instant_param,
    require_user_with_role, respond, Ctx, HandlerErr,
};
use crate::ipc::types::Request;
use crate::sources::{self, ExamResultSource, SqliteSource};
use crate::store::{self, ExamRow};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const RECENT_RESULTS: usize = 5;

pub fn require_exam(ctx: &Ctx, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    store::load_exam(ctx.conn, exam_id)?.ok_or_else(|| HandlerErr::not_found("Exam not found"))
}

fn future_exam_date(raw: &str) -> Result<String, HandlerErr> {
    let when = parse_instant_param(raw, "date")?;
    if when <= Utc::now() {
        return Err(HandlerErr::bad_params("Exam date must be in the future"));
    }
    Ok(when.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn exams_create(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let name = get_required_str(params, "name")?;
    check_len(&name, "Exam name", 2, Some(100))?;
    let batch_id = get_required_str(params, "batchId")?;
    let date = future_exam_date(&get_required_str(params, "date")?)?;
    let duration = get_required_i64(params, "duration")?;
    check_range(duration, "Duration", 1, None)?;
    let total_marks = get_required_f64(params, "totalMarks")?;
    check_range(total_marks, "Total marks", 1.0, None)?;
    let subject = get_optional_str(params, "subject")?.filter(|s| !s.is_empty());
    let description = get_optional_str(params, "description")?.filter(|s| !s.is_empty());

    let batch = require_active_batch(ctx, &batch_id)?;
    check_batch_staff(ctx, &batch)?;

    let id = new_id();
    let now = db::now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO exams(id, name, batch_id, date, duration, total_marks, subject, description, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            name,
            batch_id,
            date,
            duration,
            total_marks,
            subject,
            description,
            caller.user_id,
            now,
            now
        ],
    )?;
    log::info!(
        "event=exam_create module=exams status=ok exam={} batch={}",
        id,
        batch_id
    );
    Ok(json!({ "exam": require_exam(ctx, &id)?.to_json() }))
}

fn exams_update(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let mut exam = require_exam(ctx, &exam_id)?;
    let batch = require_batch(ctx, &exam.batch_id)?;
    check_batch_staff(ctx, &batch)?;

    if let Some(name) = get_optional_str(params, "name")? {
        check_len(&name, "Exam name", 2, Some(100))?;
        exam.name = name;
    }
    if let Some(raw) = get_optional_str(params, "date")? {
        exam.date = future_exam_date(&raw)?;
    }
    if let Some(duration) = get_optional_i64(params, "duration")? {
        check_range(duration, "Duration", 1, None)?;
        exam.duration = duration;
    }
    let regrade = match get_optional_f64(params, "totalMarks")? {
        Some(total) => {
            check_range(total, "Total marks", 1.0, None)?;
            let highest: Option<f64> = ctx.conn.query_row(
                "SELECT MAX(marks_obtained) FROM exam_results WHERE exam_id = ?",
                [&exam_id],
                |r| r.get(0),
            )?;
            if let Some(h) = highest.filter(|h| *h > total) {
                return Err(HandlerErr::bad_params(format!(
                    "Total marks cannot be below an existing result ({})",
                    h
                )));
            }
            let changed = total != exam.total_marks;
            exam.total_marks = total;
            changed
        }
        None => false,
    };
    if let Some(subject) = get_optional_str(params, "subject")? {
        exam.subject = Some(subject).filter(|s| !s.is_empty());
    }
    if let Some(description) = get_optional_str(params, "description")? {
        exam.description = Some(description).filter(|s| !s.is_empty());
    }

    let tx = ctx.conn.unchecked_transaction()?;
    let now = db::now_rfc3339();
    tx.execute(
        "UPDATE exams SET name = ?, date = ?, duration = ?, total_marks = ?, subject = ?, description = ?, updated_at = ?
         WHERE id = ?",
        params![
            exam.name,
            exam.date,
            exam.duration,
            exam.total_marks,
            exam.subject,
            exam.description,
            now,
            exam.id
        ],
    )?;
    if regrade {
        // Stored grades follow the exam total.
        let marks: Vec<(String, f64)> = {
            let mut stmt = tx.prepare("SELECT id, marks_obtained FROM exam_results WHERE exam_id = ?")?;
            let rows = stmt.query_map([&exam.id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for (rid, m) in marks {
            let grade = calc::grade_for_marks(m, exam.total_marks)?;
            tx.execute(
                "UPDATE exam_results SET grade = ?, updated_at = ? WHERE id = ?",
                params![grade.as_str(), now, rid],
            )?;
        }
    }
    tx.commit()?;
    Ok(json!({ "exam": require_exam(ctx, &exam_id)?.to_json() }))
}

struct MarkEntry {
    student_id: String,
    marks_obtained: f64,
    remarks: Option<String>,
}

/// Inserts or replaces one student's result. The first submission time
/// is kept on update.
fn upsert_result(
    ctx: &Ctx,
    exam: &ExamRow,
    entry: &MarkEntry,
    submitted_by: &str,
) -> Result<(String, Grade), HandlerErr> {
    if entry.marks_obtained < 0.0 {
        return Err(HandlerErr::bad_params("Marks obtained cannot be negative"));
    }
    if entry.marks_obtained > exam.total_marks {
        return Err(HandlerErr::bad_params(format!(
            "Marks obtained ({}) cannot exceed total marks ({})",
            entry.marks_obtained, exam.total_marks
        )));
    }
    match require_user_with_role(ctx.conn, &entry.student_id, Role::Student, "Student") {
        Ok(_) => {}
        Err(e) if e.code == "db_query_failed" => return Err(e),
        Err(_) => return Err(HandlerErr::bad_params("Student not found or invalid student ID")),
    }
    let grade = calc::grade_for_marks(entry.marks_obtained, exam.total_marks)?;
    let now = db::now_rfc3339();
    ctx.conn.execute(
        "INSERT INTO exam_results(id, exam_id, student_id, marks_obtained, grade, remarks, submitted_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, student_id) DO UPDATE SET
           marks_obtained = excluded.marks_obtained,
           grade = excluded.grade,
           remarks = excluded.remarks,
           submitted_by = excluded.submitted_by,
           updated_at = excluded.updated_at",
        params![
            new_id(),
            exam.id,
            entry.student_id,
            entry.marks_obtained,
            grade.as_str(),
            entry.remarks,
            submitted_by,
            now,
            now
        ],
    )?;
    let id: String = ctx.conn.query_row(
        "SELECT id FROM exam_results WHERE exam_id = ? AND student_id = ?",
        [&exam.id, &entry.student_id],
        |r| r.get(0),
    )?;
    Ok((id, grade))
}

fn mark_entry(params: &serde_json::Value) -> Result<MarkEntry, HandlerErr> {
    Ok(MarkEntry {
        student_id: get_required_str(params, "studentId")?,
        marks_obtained: get_required_f64(params, "marksObtained")?,
        remarks: get_optional_str(params, "remarks")?.filter(|s| !s.is_empty()),
    })
}

fn exams_assign_marks(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let exam = require_exam(ctx, &get_required_str(params, "examId")?)?;
    let batch = require_batch(ctx, &exam.batch_id)?;
    check_batch_staff(ctx, &batch)?;
    let entry = mark_entry(params)?;
    let (id, grade) = upsert_result(ctx, &exam, &entry, &caller.user_id)?;
    log::info!(
        "event=assign_marks module=exams status=ok exam={} student={}",
        exam.id,
        entry.student_id
    );
    Ok(json!({
        "result": {
            "id": id,
            "examId": exam.id,
            "studentId": entry.student_id,
            "marksObtained": entry.marks_obtained,
            "grade": grade,
            "remarks": entry.remarks,
        }
    }))
}

fn results_assign_multiple(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let exam = require_exam(ctx, &get_required_str(params, "examId")?)?;
    let Some(items) = params.get("results").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("results must be an array"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("results must contain at least 1 item"));
    }
    let batch = require_batch(ctx, &exam.batch_id)?;
    check_batch_staff(ctx, &batch)?;

    let mut saved = Vec::new();
    let mut errors = Vec::new();
    for item in items {
        let student_ref = item.get("studentId").and_then(|v| v.as_str()).unwrap_or("");
        let outcome = mark_entry(item)
            .and_then(|entry| upsert_result(ctx, &exam, &entry, &caller.user_id).map(|r| (entry, r)));
        match outcome {
            Ok((entry, (id, grade))) => saved.push(json!({
                "id": id,
                "studentId": entry.student_id,
                "marksObtained": entry.marks_obtained,
                "grade": grade,
            })),
            Err(e) if e.code == "db_query_failed" => return Err(e),
            Err(e) => errors.push(json!({ "studentId": student_ref, "error": e.message })),
        }
    }
    log::info!(
        "event=assign_marks_bulk module=exams status=ok exam={} saved={} failed={}",
        exam.id,
        saved.len(),
        errors.len()
    );
    Ok(json!({
        "results": saved,
        "errors": errors,
        "summary": {
            "totalProcessed": items.len(),
            "successful": saved.len(),
            "failed": errors.len(),
        }
    }))
}

fn exams_student_results(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ctx.check_student_scope(&student_id)?;
    let src = SqliteSource::new(ctx.conn);
    let pairs = ExamResultSource::fetch_by_student(&src, &student_id)?;
    let mut rows = Vec::with_capacity(pairs.len());
    for (result, exam) in &pairs {
        let percentage = calc::result_percentage(result.marks_obtained, exam.total_marks)?;
        rows.push(json!({
            "id": result.id,
            "exam": {
                "id": exam.id,
                "name": exam.name,
                "batchId": exam.batch_id,
                "date": calc::format_date(&exam.date),
                "totalMarks": exam.total_marks,
            },
            "marksObtained": result.marks_obtained,
            "percentage": percentage,
            "grade": result.grade.unwrap_or_else(|| calc::grade_of(percentage)),
            "remarks": result.remarks,
            "submittedAt": calc::format_date(&result.submitted_at),
        }));
    }
    Ok(json!({ "studentId": student_id, "results": rows, "count": rows.len() }))
}

fn exams_results(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_row = require_exam(ctx, &get_required_str(params, "examId")?)?;
    let exam = sources::exam_to_engine(&exam_row)?;
    let results = SqliteSource::new(ctx.conn).fetch_by_exam(&exam.id)?;
    let statistics = calc::stats_of(&results, exam.total_marks)?;

    let mut names: HashMap<String, serde_json::Value> = HashMap::new();
    for r in &results {
        if let Some(u) = store::load_user(ctx.conn, &r.student_id)? {
            names.insert(r.student_id.clone(), u.summary_json());
        }
    }
    let mut rows = Vec::with_capacity(results.len());
    for (rank, r) in calc::rank_results(&results).into_iter().enumerate() {
        let percentage = calc::result_percentage(r.marks_obtained, exam.total_marks)?;
        rows.push(json!({
            "id": r.id,
            "rank": rank + 1,
            "student": names.get(&r.student_id).cloned().unwrap_or_else(|| json!({ "id": r.student_id })),
            "marksObtained": r.marks_obtained,
            "percentage": percentage,
            "grade": r.grade.unwrap_or_else(|| calc::grade_of(percentage)),
            "remarks": r.remarks,
            "submittedAt": calc::format_date(&r.submitted_at),
        }));
    }
    Ok(json!({
        "exam": exam_row.to_json(),
        "results": rows,
        "statistics": statistics,
    }))
}

fn results_student_performance(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ctx.check_student_scope(&student_id)?;
    let src = SqliteSource::new(ctx.conn);
    let pairs = ExamResultSource::fetch_by_student(&src, &student_id)?;
    let entries = calc::exam_entries(&pairs)?;
    let overall = calc::overall_performance(&entries);
    let recent: Vec<_> = entries.iter().take(RECENT_RESULTS).collect();
    Ok(json!({
        "studentId": student_id,
        "performance": overall,
        "recentResults": recent,
    }))
}

fn load_result_detail(
    ctx: &Ctx,
    result_id: &str,
) -> Result<Option<(String, serde_json::Value)>, HandlerErr> {
    let row = ctx
        .conn
        .query_row(
            "SELECT er.id, er.exam_id, er.student_id, er.marks_obtained, er.grade, er.remarks, er.created_at
             FROM exam_results er WHERE er.id = ?",
            [result_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, exam_id, student_id, marks, grade, remarks, created_at)) = row else {
        return Ok(None);
    };
    let exam = require_exam(ctx, &exam_id)?;
    let percentage = calc::result_percentage(marks, exam.total_marks)?;
    let student = store::load_user(ctx.conn, &student_id)?.map(|u| u.summary_json());
    let grade = grade
        .as_deref()
        .and_then(Grade::parse)
        .unwrap_or_else(|| calc::grade_of(percentage));
    Ok(Some((
        student_id.clone(),
        json!({
            "id": id,
            "exam": exam.to_json(),
            "student": student.unwrap_or_else(|| json!({ "id": student_id })),
            "marksObtained": marks,
            "totalMarks": exam.total_marks,
            "percentage": percentage,
            "grade": grade,
            "remarks": remarks,
            "submittedAt": created_at,
        }),
    )))
}

fn results_get(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let (student_id, detail) = load_result_detail(ctx, &result_id)?
        .ok_or_else(|| HandlerErr::not_found("Exam result not found"))?;
    ctx.check_student_scope(&student_id)?;
    Ok(json!({ "result": detail }))
}

fn results_delete(ctx: &Ctx, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let exam_id: Option<String> = ctx
        .conn
        .query_row(
            "SELECT exam_id FROM exam_results WHERE id = ?",
            [&result_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(exam_id) = exam_id else {
        return Err(HandlerErr::not_found("Exam result not found"));
    };
    let exam = require_exam(ctx, &exam_id)?;
    let batch = require_batch(ctx, &exam.batch_id)?;
    check_batch_staff(ctx, &batch)?;
    ctx.conn
        .execute("DELETE FROM exam_results WHERE id = ?", [&result_id])?;
    log::info!(
        "event=result_delete module=exams status=ok result={}",
        result_id
    );
    Ok(json!({ "resultId": result_id, "deleted": true }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "exams.create" => exams_create(ctx, &req.params),
        "exams.update" => exams_update(ctx, &req.params),
        "exams.assignMarks" => exams_assign_marks(ctx, &req.params),
        "exams.studentResults" => exams_student_results(ctx, &req.params),
        "exams.results" => exams_results(ctx, &req.params),
        "results.assignMultiple" => results_assign_multiple(ctx, &req.params),
        "results.studentPerformance" => results_student_performance(ctx, &req.params),
        "results.get" => results_get(ctx, &req.params),
        "results.delete" => results_delete(ctx, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
