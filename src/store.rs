//! Row loaders shared by the IPC handlers and the report sources. Every
//! function takes the connection explicitly and returns plain
//! `rusqlite::Result`s; callers decide how a missing row is reported.

use crate::calc::NamedRef;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

pub const DEFAULT_PROFILE_PICTURE: &str = "default-avatar.png";

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub profile_picture: String,
    pub contact_info: String,
    pub is_email_verified: bool,
    pub created_at: String,
    pub updated_at: String,
}

const USER_COLUMNS: &str = "id, name, email, password_hash, role, profile_picture, contact_info, is_email_verified, created_at, updated_at";

fn user_from_row(r: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        name: r.get(1)?,
        email: r.get(2)?,
        password_hash: r.get(3)?,
        role: r.get(4)?,
        profile_picture: r.get(5)?,
        contact_info: r.get(6)?,
        is_email_verified: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

impl UserRow {
    /// Public view; never includes the password hash.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "email": self.email,
            "role": self.role,
            "profilePicture": self.profile_picture,
            "contactInfo": self.contact_info,
            "isEmailVerified": self.is_email_verified,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }

    pub fn summary_json(&self) -> serde_json::Value {
        json!({ "id": self.id, "name": self.name, "email": self.email })
    }
}

pub fn load_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<UserRow>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [user_id],
        user_from_row,
    )
    .optional()
}

pub fn load_user_by_email(conn: &Connection, email: &str) -> rusqlite::Result<Option<UserRow>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
        [email],
        user_from_row,
    )
    .optional()
}

pub fn list_users_by_role(conn: &Connection, role: &str) -> rusqlite::Result<Vec<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE role = ? ORDER BY created_at DESC, id",
        USER_COLUMNS
    ))?;
    let rows = stmt.query_map([role], user_from_row)?;
    rows.collect()
}

pub fn email_taken(conn: &Connection, email: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM users WHERE email = ?", [email], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

#[derive(Debug, Clone)]
pub struct CourseRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub duration: i64,
    pub fees: f64,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

const COURSE_COLUMNS: &str =
    "id, name, description, duration, fees, is_active, created_by, created_at, updated_at";

fn course_from_row(r: &Row<'_>) -> rusqlite::Result<CourseRow> {
    Ok(CourseRow {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        duration: r.get(3)?,
        fees: r.get(4)?,
        is_active: r.get::<_, i64>(5)? != 0,
        created_by: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

impl CourseRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "duration": self.duration,
            "fees": self.fees,
            "isActive": self.is_active,
            "createdBy": self.created_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn load_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<CourseRow>> {
    conn.query_row(
        &format!("SELECT {} FROM courses WHERE id = ?", COURSE_COLUMNS),
        [course_id],
        course_from_row,
    )
    .optional()
}

pub fn list_courses(conn: &Connection, active_only: bool) -> rusqlite::Result<Vec<CourseRow>> {
    let sql = if active_only {
        format!(
            "SELECT {} FROM courses WHERE is_active = 1 ORDER BY created_at DESC, id",
            COURSE_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM courses ORDER BY created_at DESC, id",
            COURSE_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], course_from_row)?;
    rows.collect()
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub name: String,
    pub course_id: String,
    pub start_date: String,
    pub end_date: String,
    pub teacher_id: String,
    pub max_students: i64,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

const BATCH_COLUMNS: &str = "id, name, course_id, start_date, end_date, teacher_id, max_students, is_active, created_by, created_at, updated_at";

fn batch_from_row(r: &Row<'_>) -> rusqlite::Result<BatchRow> {
    Ok(BatchRow {
        id: r.get(0)?,
        name: r.get(1)?,
        course_id: r.get(2)?,
        start_date: r.get(3)?,
        end_date: r.get(4)?,
        teacher_id: r.get(5)?,
        max_students: r.get(6)?,
        is_active: r.get::<_, i64>(7)? != 0,
        created_by: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

impl BatchRow {
    pub fn to_json(&self, students: &[NamedRef]) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "courseId": self.course_id,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "teacherId": self.teacher_id,
            "maxStudents": self.max_students,
            "isActive": self.is_active,
            "students": students,
            "studentCount": students.len(),
            "createdBy": self.created_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn load_batch(conn: &Connection, batch_id: &str) -> rusqlite::Result<Option<BatchRow>> {
    conn.query_row(
        &format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS),
        [batch_id],
        batch_from_row,
    )
    .optional()
}

pub fn list_batches_for_course(
    conn: &Connection,
    course_id: &str,
    active_only: bool,
) -> rusqlite::Result<Vec<BatchRow>> {
    let filter = if active_only { " AND is_active = 1" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM batches WHERE course_id = ?{} ORDER BY start_date, name, id",
        BATCH_COLUMNS, filter
    ))?;
    let rows = stmt.query_map([course_id], batch_from_row)?;
    rows.collect()
}

pub fn list_active_batches_for_teacher(
    conn: &Connection,
    teacher_id: &str,
) -> rusqlite::Result<Vec<BatchRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM batches WHERE teacher_id = ? AND is_active = 1 ORDER BY start_date, name, id",
        BATCH_COLUMNS
    ))?;
    let rows = stmt.query_map([teacher_id], batch_from_row)?;
    rows.collect()
}

/// Roster in name order.
pub fn batch_roster(conn: &Connection, batch_id: &str) -> rusqlite::Result<Vec<NamedRef>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name
         FROM batch_students bs
         JOIN users u ON u.id = bs.student_id
         WHERE bs.batch_id = ?
         ORDER BY u.name, u.id",
    )?;
    let rows = stmt.query_map([batch_id], |r| {
        Ok(NamedRef {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })?;
    rows.collect()
}

pub fn batch_ids_for_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT batch_id FROM batch_students WHERE student_id = ? ORDER BY batch_id",
    )?;
    let rows = stmt.query_map([student_id], |r| r.get::<_, String>(0))?;
    rows.collect()
}

pub fn is_in_roster(conn: &Connection, batch_id: &str, student_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM batch_students WHERE batch_id = ? AND student_id = ?",
        [batch_id, student_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

pub fn roster_size(conn: &Connection, batch_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM batch_students WHERE batch_id = ?",
        [batch_id],
        |r| r.get(0),
    )
}

#[derive(Debug, Clone)]
pub struct ExamRow {
    pub id: String,
    pub name: String,
    pub batch_id: String,
    pub date: String,
    pub duration: i64,
    pub total_marks: f64,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

pub const EXAM_COLUMNS: &str = "id, name, batch_id, date, duration, total_marks, subject, description, created_by, created_at, updated_at";

pub fn exam_from_row(r: &Row<'_>) -> rusqlite::Result<ExamRow> {
    Ok(ExamRow {
        id: r.get(0)?,
        name: r.get(1)?,
        batch_id: r.get(2)?,
        date: r.get(3)?,
        duration: r.get(4)?,
        total_marks: r.get(5)?,
        subject: r.get(6)?,
        description: r.get(7)?,
        created_by: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

impl ExamRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "batchId": self.batch_id,
            "date": self.date,
            "duration": self.duration,
            "totalMarks": self.total_marks,
            "subject": self.subject,
            "description": self.description,
            "createdBy": self.created_by,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn load_exam(conn: &Connection, exam_id: &str) -> rusqlite::Result<Option<ExamRow>> {
    conn.query_row(
        &format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLUMNS),
        [exam_id],
        exam_from_row,
    )
    .optional()
}

#[derive(Debug, Clone)]
pub struct EnrollmentRow {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub batch_id: Option<String>,
    pub enrollment_date: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub const ENROLLMENT_STATUSES: [&str; 4] = ["pending", "active", "completed", "cancelled"];

const ENROLLMENT_COLUMNS: &str =
    "id, student_id, course_id, batch_id, enrollment_date, status, created_at, updated_at";

fn enrollment_from_row(r: &Row<'_>) -> rusqlite::Result<EnrollmentRow> {
    Ok(EnrollmentRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        batch_id: r.get(3)?,
        enrollment_date: r.get(4)?,
        status: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

impl EnrollmentRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "courseId": self.course_id,
            "batchId": self.batch_id,
            "enrollmentDate": self.enrollment_date,
            "status": self.status,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub fn load_enrollment(
    conn: &Connection,
    enrollment_id: &str,
) -> rusqlite::Result<Option<EnrollmentRow>> {
    conn.query_row(
        &format!("SELECT {} FROM enrollments WHERE id = ?", ENROLLMENT_COLUMNS),
        [enrollment_id],
        enrollment_from_row,
    )
    .optional()
}

pub fn list_enrollments_for_student(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Vec<EnrollmentRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM enrollments WHERE student_id = ? ORDER BY enrollment_date DESC, id",
        ENROLLMENT_COLUMNS
    ))?;
    let rows = stmt.query_map([student_id], enrollment_from_row)?;
    rows.collect()
}

pub fn list_enrollments_for_course(
    conn: &Connection,
    course_id: &str,
) -> rusqlite::Result<Vec<EnrollmentRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM enrollments WHERE course_id = ? ORDER BY enrollment_date DESC, id",
        ENROLLMENT_COLUMNS
    ))?;
    let rows = stmt.query_map([course_id], enrollment_from_row)?;
    rows.collect()
}

/// Enrollment counts for a course keyed by status.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatusCounts {
    pub total: i64,
    pub active: i64,
    pub completed: i64,
    pub pending: i64,
    pub cancelled: i64,
}

pub fn enrollment_status_counts(
    conn: &Connection,
    course_id: &str,
) -> rusqlite::Result<StatusCounts> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM enrollments WHERE course_id = ? GROUP BY status",
    )?;
    let rows = stmt.query_map([course_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let (status, n) = row?;
        counts.total += n;
        match status.as_str() {
            "active" => counts.active += n,
            "completed" => counts.completed += n,
            "pending" => counts.pending += n,
            "cancelled" => counts.cancelled += n,
            _ => {}
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        let now = db::now_rfc3339();
        for (id, name, role) in [
            ("a1", "Admin", "admin"),
            ("t1", "Tess", "teacher"),
            ("s1", "Zed", "student"),
            ("s2", "Amy", "student"),
        ] {
            conn.execute(
                "INSERT INTO users(id, name, email, password_hash, role, profile_picture, contact_info, created_at, updated_at)
                 VALUES(?, ?, ?, 'x', ?, ?, '0123456789', ?, ?)",
                rusqlite::params![id, name, format!("{}@example.com", id), role, DEFAULT_PROFILE_PICTURE, now, now],
            )
            .expect("user");
        }
        conn.execute(
            "INSERT INTO courses(id, name, description, duration, fees, created_by, created_at, updated_at)
             VALUES('c1', 'Rust', 'Systems programming', 3, 100.0, 'a1', ?, ?)",
            [&now, &now],
        )
        .expect("course");
        conn.execute(
            "INSERT INTO batches(id, name, course_id, start_date, end_date, teacher_id, created_by, created_at, updated_at)
             VALUES('b1', 'Morning', 'c1', '2099-01-01', '2099-06-01', 't1', 'a1', ?, ?)",
            [&now, &now],
        )
        .expect("batch");
        for sid in ["s1", "s2"] {
            conn.execute(
                "INSERT INTO batch_students(batch_id, student_id, added_at) VALUES('b1', ?, ?)",
                [sid, &now],
            )
            .expect("roster");
        }
        conn
    }

    #[test]
    fn roster_is_name_ordered() {
        let conn = seeded();
        let roster = batch_roster(&conn, "b1").expect("roster");
        let names: Vec<&str> = roster.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Amy", "Zed"]);
        assert_eq!(roster_size(&conn, "b1").expect("size"), 2);
        assert!(is_in_roster(&conn, "b1", "s1").expect("member"));
        assert!(!is_in_roster(&conn, "b1", "t1").expect("member"));
    }

    #[test]
    fn user_json_hides_password_hash() {
        let conn = seeded();
        let user = load_user(&conn, "s1").expect("load").expect("present");
        let v = user.to_json();
        assert!(v.get("passwordHash").is_none());
        assert_eq!(v["role"], "student");
        assert!(email_taken(&conn, "s1@example.com").expect("taken"));
        assert!(load_user(&conn, "missing").expect("load").is_none());
    }

    #[test]
    fn status_counts_group_by_status() {
        let conn = seeded();
        let now = db::now_rfc3339();
        for (id, sid, status) in [("e1", "s1", "active"), ("e2", "s2", "pending")] {
            conn.execute(
                "INSERT INTO enrollments(id, student_id, course_id, enrollment_date, status, created_at, updated_at)
                 VALUES(?, ?, 'c1', ?, ?, ?, ?)",
                rusqlite::params![id, sid, now, status, now, now],
            )
            .expect("enroll");
        }
        let c = enrollment_status_counts(&conn, "c1").expect("counts");
        assert_eq!(c.total, 2);
        assert_eq!(c.active, 1);
        assert_eq!(c.pending, 1);
        assert_eq!(c.completed, 0);
    }
}
