use crate::calc::{
    self, AttendanceRecord, BatchHeader, BatchPerformanceReport, CalcError, Exam, ExamResult,
    Grade, NamedRef, PerformanceReport, StudentProfile,
};
use crate::store::{self, ExamRow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Row};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Calc(#[from] CalcError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

pub trait AttendanceRecordSource {
    fn fetch_by_batch(&self, batch_id: &str) -> Result<Vec<AttendanceRecord>, SourceError>;

    /// Records that mention the student in either list, optionally limited
    /// to one batch.
    fn fetch_by_student(
        &self,
        student_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<AttendanceRecord>, SourceError>;
}

pub trait ExamResultSource {
    fn fetch_by_student(&self, student_id: &str) -> Result<Vec<(ExamResult, Exam)>, SourceError>;
    fn fetch_by_exam(&self, exam_id: &str) -> Result<Vec<ExamResult>, SourceError>;
}

pub fn parse_day(raw: &str) -> Result<NaiveDate, SourceError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| SourceError::Corrupt(format!("bad date {:?}", raw)))
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SourceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| SourceError::Corrupt(format!("bad timestamp {:?}", raw)))
}

pub fn exam_to_engine(row: &ExamRow) -> Result<Exam, SourceError> {
    Ok(Exam {
        id: row.id.clone(),
        batch_id: row.batch_id.clone(),
        name: row.name.clone(),
        total_marks: row.total_marks,
        date: parse_timestamp(&row.date)?,
        duration_minutes: row.duration,
    })
}

struct RawResult {
    id: String,
    exam_id: String,
    student_id: String,
    marks_obtained: f64,
    grade: Option<String>,
    remarks: Option<String>,
    created_at: String,
}

fn raw_result(r: &Row<'_>) -> rusqlite::Result<RawResult> {
    Ok(RawResult {
        id: r.get(0)?,
        exam_id: r.get(1)?,
        student_id: r.get(2)?,
        marks_obtained: r.get(3)?,
        grade: r.get(4)?,
        remarks: r.get(5)?,
        created_at: r.get(6)?,
    })
}

impl RawResult {
    fn into_engine(self) -> Result<ExamResult, SourceError> {
        Ok(ExamResult {
            submitted_at: parse_timestamp(&self.created_at)?,
            grade: self.grade.as_deref().and_then(Grade::parse),
            id: self.id,
            exam_id: self.exam_id,
            student_id: self.student_id,
            marks_obtained: self.marks_obtained,
            remarks: self.remarks,
        })
    }
}

/// Report data read straight from the workspace database.
pub struct SqliteSource<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSource<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn load_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<AttendanceRecord>, SourceError> {
        let mut stmt = self.conn.prepare(sql)?;
        let heads = stmt
            .query_map(params, |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut marks_stmt = self.conn.prepare(
            "SELECT student_id, present FROM attendance_marks WHERE attendance_id = ? ORDER BY student_id",
        )?;
        let mut out = Vec::with_capacity(heads.len());
        for (id, batch_id, date, total_students) in heads {
            let mut present = BTreeSet::new();
            let mut absent = BTreeSet::new();
            let marks = marks_stmt
                .query_map([&id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (sid, flag) in marks {
                if flag != 0 {
                    present.insert(sid);
                } else {
                    absent.insert(sid);
                }
            }
            out.push(AttendanceRecord {
                date: parse_day(&date)?,
                id,
                batch_id,
                present,
                absent,
                total_students,
            });
        }
        Ok(out)
    }

    pub fn exams_for_batch(&self, batch_id: &str) -> Result<Vec<Exam>, SourceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM exams WHERE batch_id = ? ORDER BY date, id",
            store::EXAM_COLUMNS
        ))?;
        let rows = stmt
            .query_map([batch_id], store::exam_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter().map(exam_to_engine).collect()
    }
}

const RESULT_COLUMNS: &str =
    "er.id, er.exam_id, er.student_id, er.marks_obtained, er.grade, er.remarks, er.created_at";

impl AttendanceRecordSource for SqliteSource<'_> {
    fn fetch_by_batch(&self, batch_id: &str) -> Result<Vec<AttendanceRecord>, SourceError> {
        self.load_records(
            "SELECT id, batch_id, date, total_students FROM attendance
             WHERE batch_id = ?
             ORDER BY date DESC, id",
            &[&batch_id],
        )
    }

    fn fetch_by_student(
        &self,
        student_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<AttendanceRecord>, SourceError> {
        match batch_id {
            Some(b) => self.load_records(
                "SELECT a.id, a.batch_id, a.date, a.total_students FROM attendance a
                 WHERE a.batch_id = ?
                   AND EXISTS (SELECT 1 FROM attendance_marks m WHERE m.attendance_id = a.id AND m.student_id = ?)
                 ORDER BY a.date DESC, a.id",
                &[&b, &student_id],
            ),
            None => self.load_records(
                "SELECT a.id, a.batch_id, a.date, a.total_students FROM attendance a
                 WHERE EXISTS (SELECT 1 FROM attendance_marks m WHERE m.attendance_id = a.id AND m.student_id = ?)
                 ORDER BY a.date DESC, a.id",
                &[&student_id],
            ),
        }
    }
}

impl ExamResultSource for SqliteSource<'_> {
    fn fetch_by_student(&self, student_id: &str) -> Result<Vec<(ExamResult, Exam)>, SourceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {}, e.id, e.name, e.batch_id, e.date, e.duration, e.total_marks,
                    e.subject, e.description, e.created_by, e.created_at, e.updated_at
             FROM exam_results er
             JOIN exams e ON e.id = er.exam_id
             WHERE er.student_id = ?
             ORDER BY e.date DESC, e.id",
            RESULT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([student_id], |r| {
                let result = raw_result(r)?;
                let exam = ExamRow {
                    id: r.get(7)?,
                    name: r.get(8)?,
                    batch_id: r.get(9)?,
                    date: r.get(10)?,
                    duration: r.get(11)?,
                    total_marks: r.get(12)?,
                    subject: r.get(13)?,
                    description: r.get(14)?,
                    created_by: r.get(15)?,
                    created_at: r.get(16)?,
                    updated_at: r.get(17)?,
                };
                Ok((result, exam))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(result, exam)| Ok((result.into_engine()?, exam_to_engine(&exam)?)))
            .collect()
    }

    fn fetch_by_exam(&self, exam_id: &str) -> Result<Vec<ExamResult>, SourceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM exam_results er WHERE er.exam_id = ? ORDER BY er.created_at, er.student_id",
            RESULT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([exam_id], raw_result)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawResult::into_engine).collect()
    }
}

pub fn student_report(
    attendance: &dyn AttendanceRecordSource,
    results: &dyn ExamResultSource,
    student: StudentProfile,
) -> Result<PerformanceReport, ReportError> {
    let records = attendance.fetch_by_student(&student.id, None)?;
    let exam_results = results.fetch_by_student(&student.id)?;
    Ok(calc::compose_student_report(student, &records, &exam_results)?)
}

/// All reads happen before aggregation starts.
pub fn batch_report(
    attendance: &dyn AttendanceRecordSource,
    results: &dyn ExamResultSource,
    batch: BatchHeader,
    roster: &[NamedRef],
    exams: &[Exam],
) -> Result<BatchPerformanceReport, ReportError> {
    let records = attendance.fetch_by_batch(&batch.id)?;
    let mut by_exam: HashMap<String, Vec<ExamResult>> = HashMap::new();
    for exam in exams {
        by_exam.insert(exam.id.clone(), results.fetch_by_exam(&exam.id)?);
    }
    Ok(calc::compose_batch_report(
        batch, roster, &records, exams, &by_exam,
    )?)
}
