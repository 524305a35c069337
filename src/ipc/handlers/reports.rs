use crate::auth::Role;
use crate::calc::{BatchHeader, NamedRef, StudentProfile, TeacherRef};
use crate::ipc::handlers::batches::require_batch;
use crate::ipc::handlers::courses::require_course;
use crate::ipc::helpers::{get_required_str, require_user_with_role, respond, Ctx, HandlerErr};
use crate::ipc::types::Request;
use crate::sources::{self, SqliteSource};
use crate::store::{self, CourseRow};
use serde_json::json;

pub fn student_performance_report(
    ctx: &Ctx,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student = require_user_with_role(ctx.conn, student_id, Role::Student, "Student")?;
    let profile = StudentProfile {
        id: student.id,
        name: student.name,
        email: student.email,
        contact_info: student.contact_info,
    };
    let src = SqliteSource::new(ctx.conn);
    let report = sources::student_report(&src, &src, profile)?;
    Ok(json!({ "report": report }))
}

fn reports_student_performance(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    ctx.check_student_scope(&student_id)?;
    student_performance_report(ctx, &student_id)
}

fn reports_my_performance(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    student_performance_report(ctx, &caller.user_id)
}

fn reports_batch_performance(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch = require_batch(ctx, &get_required_str(params, "batchId")?)?;
    let course = require_course(ctx, &batch.course_id)?;
    let teacher = store::load_user(ctx.conn, &batch.teacher_id)?;
    let header = BatchHeader {
        id: batch.id.clone(),
        name: batch.name.clone(),
        course: NamedRef {
            id: course.id,
            name: course.name,
        },
        teacher: match teacher {
            Some(t) => TeacherRef {
                id: t.id,
                name: t.name,
                email: t.email,
            },
            None => TeacherRef {
                id: batch.teacher_id.clone(),
                name: "Unknown".to_string(),
                email: String::new(),
            },
        },
    };
    let roster = store::batch_roster(ctx.conn, &batch.id)?;
    let src = SqliteSource::new(ctx.conn);
    let exams = src.exams_for_batch(&batch.id)?;
    let report = sources::batch_report(&src, &src, header, &roster, &exams)?;
    Ok(json!({ "report": report }))
}

fn course_json(course: &CourseRow) -> serde_json::Value {
    json!({
        "id": course.id,
        "name": course.name,
        "description": course.description,
        "duration": course.duration,
        "fees": course.fees,
        "isActive": course.is_active,
    })
}

fn reports_course_enrollment(
    ctx: &Ctx,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = require_course(ctx, &get_required_str(params, "courseId")?)?;
    let counts = store::enrollment_status_counts(ctx.conn, &course.id)?;
    let batches = store::list_batches_for_course(ctx.conn, &course.id, false)?;
    let mut batch_rows = Vec::with_capacity(batches.len());
    for b in &batches {
        let teacher = store::load_user(ctx.conn, &b.teacher_id)?;
        batch_rows.push(json!({
            "batchId": b.id,
            "batchName": b.name,
            "studentCount": store::roster_size(ctx.conn, &b.id)?,
            "teacherName": teacher.map(|t| t.name).unwrap_or_else(|| "Unknown".to_string()),
        }));
    }
    Ok(json!({
        "report": {
            "course": course_json(&course),
            "enrollmentStats": {
                "total": counts.total,
                "active": counts.active,
                "completed": counts.completed,
                "pending": counts.pending,
                "cancelled": counts.cancelled,
            },
            "batches": batch_rows,
            "revenue": {
                "potential": counts.total as f64 * course.fees,
                "collected": counts.active as f64 * course.fees,
            },
        }
    }))
}

fn reports_all_courses_enrollment(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let courses = store::list_courses(ctx.conn, false)?;
    let mut rows = Vec::with_capacity(courses.len());
    for course in &courses {
        let counts = store::enrollment_status_counts(ctx.conn, &course.id)?;
        let total_batches = store::list_batches_for_course(ctx.conn, &course.id, false)?.len();
        rows.push((counts.total, course.name.clone(), {
            let mut v = course_json(course);
            v["totalEnrollments"] = json!(counts.total);
            v["activeEnrollments"] = json!(counts.active);
            v["totalBatches"] = json!(total_batches);
            v
        }));
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let courses: Vec<serde_json::Value> = rows.into_iter().map(|(_, _, v)| v).collect();
    Ok(json!({ "courses": courses, "count": courses.len() }))
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.studentPerformance" => reports_student_performance(ctx, &req.params),
        "reports.myPerformance" => reports_my_performance(ctx),
        "reports.batchPerformance" => reports_batch_performance(ctx, &req.params),
        "reports.courseEnrollment" => reports_course_enrollment(ctx, &req.params),
        "reports.allCoursesEnrollment" => reports_all_courses_enrollment(ctx),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
