use crate::auth::{self, Role};
use crate::calc;
use crate::ipc::helpers::{fmt_day, respond, today, Ctx, HandlerErr};
use crate::ipc::types::Request;
use crate::sources::{AttendanceRecordSource, ExamResultSource, SqliteSource};
use crate::store::{self, UserRow, DEFAULT_PROFILE_PICTURE};
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;

const RECENT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCompletion {
    pub basic_info: bool,
    pub contact_info: bool,
    pub profile_picture: bool,
    pub overall_percentage: i64,
}

/// Basic info always counts; contact info when non-empty; the picture when
/// it is not the default avatar.
pub fn profile_completion(contact_info: &str, profile_picture: &str) -> ProfileCompletion {
    let contact = !contact_info.trim().is_empty();
    let picture = !profile_picture.trim().is_empty() && profile_picture != DEFAULT_PROFILE_PICTURE;
    let done = 1 + contact as i64 + picture as i64;
    ProfileCompletion {
        basic_info: true,
        contact_info: contact,
        profile_picture: picture,
        overall_percentage: (done as f64 / 3.0 * 100.0).round() as i64,
    }
}

fn basic_info(user: &UserRow) -> serde_json::Value {
    json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "profilePicture": user.profile_picture,
        "contactInfo": user.contact_info,
        "memberSince": user.created_at,
    })
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

fn now_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, params, |r| r.get(0))?)
}

/// Upcoming exams across `batch_ids`, soonest first.
fn upcoming_exams(ctx: &Ctx, batch_ids: &[String]) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let now = now_millis();
    let mut rows = Vec::new();
    let mut stmt = ctx.conn.prepare(
        "SELECT e.id, e.name, e.date, e.total_marks, b.id, b.name
         FROM exams e JOIN batches b ON b.id = e.batch_id
         WHERE e.batch_id = ? AND e.date > ?
         ORDER BY e.date, e.id",
    )?;
    for bid in batch_ids {
        let found = stmt
            .query_map([bid, &now], |r| {
                Ok((
                    r.get::<_, String>(2)?,
                    json!({
                        "id": r.get::<_, String>(0)?,
                        "examName": r.get::<_, String>(1)?,
                        "date": r.get::<_, String>(2)?,
                        "totalMarks": r.get::<_, f64>(3)?,
                        "batchId": r.get::<_, String>(4)?,
                        "batchName": r.get::<_, String>(5)?,
                    }),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.extend(found);
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(rows.into_iter().take(RECENT).map(|(_, v)| v).collect())
}

fn student_dashboard(ctx: &Ctx, user: &UserRow) -> Result<serde_json::Value, HandlerErr> {
    let enrollments = store::list_enrollments_for_student(ctx.conn, &user.id)?;
    let mut recent_enrollments = Vec::new();
    for e in enrollments.iter().take(RECENT) {
        let course = store::load_course(ctx.conn, &e.course_id)?;
        let batch = match e.batch_id.as_deref() {
            Some(bid) => store::load_batch(ctx.conn, bid)?,
            None => None,
        };
        recent_enrollments.push(json!({
            "id": e.id,
            "courseName": course.map(|c| c.name),
            "batchName": batch.map(|b| b.name),
            "enrollmentDate": e.enrollment_date,
            "status": e.status,
        }));
    }

    let batch_ids = store::batch_ids_for_student(ctx.conn, &user.id)?;
    let upcoming = upcoming_exams(ctx, &batch_ids)?;

    let src = SqliteSource::new(ctx.conn);
    let records = AttendanceRecordSource::fetch_by_student(&src, &user.id, None)?;
    let summary = calc::summarize(&records, &user.id);
    let recent_attendance: Vec<serde_json::Value> = records
        .iter()
        .take(RECENT)
        .map(|r| {
            json!({
                "date": fmt_day(r.date),
                "batchId": r.batch_id,
                "status": r.status_of(&user.id).unwrap_or("absent"),
            })
        })
        .collect();
    let month = current_month();
    let month_records: Vec<calc::AttendanceRecord> = records
        .iter()
        .filter(|r| r.date.format("%Y-%m").to_string() == month)
        .cloned()
        .collect();
    let month_summary = calc::summarize(&month_records, &user.id);

    let pairs = ExamResultSource::fetch_by_student(&src, &user.id)?;
    let entries = calc::exam_entries(&pairs)?;
    let recent_results: Vec<_> = entries.iter().take(RECENT).collect();

    let mut exams_this_month = 0;
    for bid in &batch_ids {
        exams_this_month += count(
            ctx.conn,
            "SELECT COUNT(*) FROM exams WHERE batch_id = ? AND substr(date, 1, 7) = ?",
            [bid, &month],
        )?;
    }

    Ok(json!({
        "student": basic_info(user),
        "recentEnrollments": recent_enrollments,
        "upcomingExams": upcoming,
        "attendanceSummary": {
            "totalClasses": summary.total_classes,
            "presentClasses": summary.present_classes,
            "absentClasses": summary.absent_classes,
            "percentage": summary.percentage,
            "recentAttendance": recent_attendance,
        },
        "recentResults": recent_results,
        "quickStats": {
            "totalCourses": enrollments.len(),
            "activeCourses": enrollments.iter().filter(|e| e.status == "active").count(),
            "examsThisMonth": exams_this_month,
            "attendanceThisMonth": month_summary.percentage,
        },
        "profileCompletion": profile_completion(&user.contact_info, &user.profile_picture),
    }))
}

fn teacher_dashboard(ctx: &Ctx, user: &UserRow) -> Result<serde_json::Value, HandlerErr> {
    let batches = store::list_active_batches_for_teacher(ctx.conn, &user.id)?;
    let day = fmt_day(today());

    let mut assigned = Vec::with_capacity(batches.len());
    let mut todays_classes = Vec::new();
    let mut pending_tasks = Vec::new();
    let mut students: BTreeSet<String> = BTreeSet::new();
    let mut marked_today = 0;
    for b in &batches {
        let course = store::load_course(ctx.conn, &b.course_id)?;
        let course_name = course.map(|c| c.name);
        let roster = store::batch_roster(ctx.conn, &b.id)?;
        students.extend(roster.iter().map(|s| s.id.clone()));
        assigned.push(json!({
            "id": b.id,
            "name": b.name,
            "courseName": course_name,
            "studentCount": roster.len(),
            "maxStudents": b.max_students,
            "startDate": b.start_date,
            "endDate": b.end_date,
        }));

        if b.start_date <= day && day <= b.end_date {
            let marked = ctx
                .conn
                .query_row(
                    "SELECT 1 FROM attendance WHERE batch_id = ? AND date = ?",
                    [&b.id, &day],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?
                .is_some();
            if marked {
                marked_today += 1;
            } else {
                pending_tasks.push(json!({
                    "type": "attendance",
                    "batchId": b.id,
                    "batchName": b.name,
                    "date": day,
                    "description": format!("Mark attendance for {}", b.name),
                }));
            }
            todays_classes.push(json!({
                "batchId": b.id,
                "batchName": b.name,
                "courseName": course_name,
                "date": day,
                "studentCount": roster.len(),
                "attendanceMarked": marked,
            }));
        }
    }

    let batch_ids: Vec<String> = batches.iter().map(|b| b.id.clone()).collect();
    let upcoming = upcoming_exams(ctx, &batch_ids)?;

    Ok(json!({
        "teacher": basic_info(user),
        "assignedBatches": assigned,
        "todaysClasses": todays_classes,
        "upcomingExams": upcoming,
        "pendingTasks": pending_tasks,
        "quickStats": {
            "totalBatches": batches.len(),
            "totalStudents": students.len(),
            "classesToday": todays_classes.len(),
            "attendanceMarkedToday": marked_today,
            "upcomingExams": upcoming.len(),
        },
        "profileCompletion": profile_completion(&user.contact_info, &user.profile_picture),
    }))
}

const QUICK_ACTIONS: [(&str, &str, &str); 5] = [
    ("Create course", "courses.create", "Add a new course to the catalogue"),
    ("Create teacher", "teachers.create", "Register a teacher account"),
    ("Create batch", "batches.create", "Schedule a batch for a course"),
    ("Enrollment report", "reports.allCoursesEnrollment", "Enrollments across all courses"),
    ("Teachers", "teachers.list", "List teacher accounts"),
];

fn admin_dashboard(ctx: &Ctx, user: &UserRow) -> Result<serde_json::Value, HandlerErr> {
    let conn = ctx.conn;
    let month = current_month();
    let revenue_this_month: f64 = conn.query_row(
        "SELECT COALESCE(SUM(c.fees), 0)
         FROM enrollments e JOIN courses c ON c.id = e.course_id
         WHERE substr(e.enrollment_date, 1, 7) = ? AND e.status != 'cancelled'",
        [&month],
        |r| r.get(0),
    )?;

    let overview = json!({
        "totalStudents": count(conn, "SELECT COUNT(*) FROM users WHERE role = 'student'", [])?,
        "totalTeachers": count(conn, "SELECT COUNT(*) FROM users WHERE role = 'teacher'", [])?,
        "totalCourses": count(conn, "SELECT COUNT(*) FROM courses WHERE is_active = 1", [])?,
        "totalBatches": count(conn, "SELECT COUNT(*) FROM batches WHERE is_active = 1", [])?,
        "activeEnrollments": count(conn, "SELECT COUNT(*) FROM enrollments WHERE status = 'active'", [])?,
        "revenueThisMonth": revenue_this_month,
        "pendingApprovals": count(conn, "SELECT COUNT(*) FROM users WHERE is_email_verified = 0", [])?,
    });

    let popular_courses = {
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.fees, COUNT(e.id) AS n
             FROM courses c LEFT JOIN enrollments e ON e.course_id = c.id
             WHERE c.is_active = 1
             GROUP BY c.id
             ORDER BY n DESC, c.name, c.id
             LIMIT 5",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(json!({
                "courseId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "fees": r.get::<_, f64>(2)?,
                "enrollments": r.get::<_, i64>(3)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let since = (Utc::now() - Duration::days(7)).to_rfc3339_opts(SecondsFormat::Micros, true);
    let recent_users = {
        let mut stmt = conn.prepare(
            "SELECT id, name, email, role, created_at FROM users
             WHERE created_at >= ?
             ORDER BY created_at DESC, id
             LIMIT 5",
        )?;
        let rows = stmt.query_map([&since], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "joinedDate": r.get::<_, String>(4)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let database_status = match conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)) {
        Ok(_) => "connected",
        Err(e) => {
            log::error!("event=health_check module=dashboard status=error error={}", e);
            "error"
        }
    };
    let quick_actions: Vec<serde_json::Value> = QUICK_ACTIONS
        .iter()
        .map(|(action, method, description)| {
            json!({ "action": action, "method": method, "description": description })
        })
        .collect();

    Ok(json!({
        "admin": basic_info(user),
        "overview": overview,
        "popularCourses": popular_courses,
        "recentUsers": recent_users,
        "systemHealth": {
            "serverStatus": "running",
            "databaseStatus": database_status,
            "activeSessions": auth::count_active_sessions(conn)?,
            "lastChecked": now_millis(),
        },
        "quickActions": quick_actions,
        "profileCompletion": profile_completion(&user.contact_info, &user.profile_picture),
    }))
}

fn dashboard_for(ctx: &Ctx, role: Role) -> Result<serde_json::Value, HandlerErr> {
    let caller = ctx.caller()?;
    let user = store::load_user(ctx.conn, &caller.user_id)?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    let dashboard = match role {
        Role::Student => student_dashboard(ctx, &user)?,
        Role::Teacher => teacher_dashboard(ctx, &user)?,
        Role::Admin => admin_dashboard(ctx, &user)?,
    };
    Ok(json!({ "role": role.as_str(), "dashboard": dashboard }))
}

fn dashboard_get(ctx: &Ctx) -> Result<serde_json::Value, HandlerErr> {
    let role = ctx.caller()?.role;
    dashboard_for(ctx, role)
}

pub fn try_handle(ctx: &Ctx, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "dashboard.student" => dashboard_for(ctx, Role::Student),
        "dashboard.teacher" => dashboard_for(ctx, Role::Teacher),
        "dashboard.admin" => dashboard_for(ctx, Role::Admin),
        "dashboard.get" => dashboard_get(ctx),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_completion_thirds() {
        let p = profile_completion("", DEFAULT_PROFILE_PICTURE);
        assert_eq!(p.overall_percentage, 33);
        assert!(p.basic_info);
        assert!(!p.contact_info);

        let p = profile_completion("0123456789", DEFAULT_PROFILE_PICTURE);
        assert_eq!(p.overall_percentage, 67);
        assert!(!p.profile_picture);

        let p = profile_completion("0123456789", "me.png");
        assert_eq!(p.overall_percentage, 100);
        let v = serde_json::to_value(&p).expect("json");
        assert_eq!(v["overallPercentage"], 100);
        assert_eq!(v["profilePicture"], true);
    }
}
