use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Two-decimal rounding used for every exposed percentage and average:
/// `round(100*x) / 100`, half away from zero.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grade {
    APlus,
    A,
    BPlus,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub const ALL: [Grade; 7] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::C,
        Grade::D,
        Grade::F,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Grade> {
        Grade::ALL.into_iter().find(|g| g.as_str() == s.trim())
    }
}

impl Serialize for Grade {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Threshold ladder, lower bound inclusive. Anything below 40 (including
/// negatives and NaN) is an F.
pub fn grade_of(percentage: f64) -> Grade {
    if percentage >= 90.0 {
        Grade::APlus
    } else if percentage >= 80.0 {
        Grade::A
    } else if percentage >= 70.0 {
        Grade::BPlus
    } else if percentage >= 60.0 {
        Grade::B
    } else if percentage >= 50.0 {
        Grade::C
    } else if percentage >= 40.0 {
        Grade::D
    } else {
        Grade::F
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("invalid exam configuration: total marks must be positive (got {total_marks})")]
    InvalidExamConfiguration {
        exam_id: Option<String>,
        total_marks: f64,
    },
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        match self {
            CalcError::InvalidExamConfiguration { .. } => "invalid_exam_configuration",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            CalcError::InvalidExamConfiguration {
                exam_id,
                total_marks,
            } => serde_json::json!({ "examId": exam_id, "totalMarks": total_marks }),
        }
    }
}

fn check_total_marks(total_marks: f64, exam_id: Option<&str>) -> Result<(), CalcError> {
    if total_marks.is_finite() && total_marks > 0.0 {
        return Ok(());
    }
    Err(CalcError::InvalidExamConfiguration {
        exam_id: exam_id.map(|s| s.to_string()),
        total_marks,
    })
}

// ---------------------------------------------------------------------------
// Attendance

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub id: String,
    pub batch_id: String,
    pub date: NaiveDate,
    pub present: BTreeSet<String>,
    pub absent: BTreeSet<String>,
    pub total_students: i64,
}

impl AttendanceRecord {
    pub fn is_present(&self, student_id: &str) -> bool {
        self.present.contains(student_id)
    }

    pub fn status_of(&self, student_id: &str) -> Option<&'static str> {
        if self.present.contains(student_id) {
            Some("present")
        } else if self.absent.contains(student_id) {
            Some("absent")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total_classes: usize,
    pub present_classes: usize,
    pub absent_classes: usize,
    pub percentage: f64,
}

pub fn attendance_percentage(present: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_2_decimals(present as f64 / total as f64 * 100.0)
}

/// Every record counts as one class; the student is present on the days
/// whose present set lists them.
pub fn summarize(records: &[AttendanceRecord], student_id: &str) -> AttendanceSummary {
    let total = records.len();
    let present = records.iter().filter(|r| r.is_present(student_id)).count();
    AttendanceSummary {
        total_classes: total,
        present_classes: present,
        absent_classes: total - present,
        percentage: attendance_percentage(present, total),
    }
}

pub fn summarize_batch(
    records: &[AttendanceRecord],
    roster: &BTreeSet<String>,
) -> BTreeMap<String, AttendanceSummary> {
    roster
        .iter()
        .map(|sid| (sid.clone(), summarize(records, sid)))
        .collect()
}

/// Sum of present counts over `total_classes * roster size`.
pub fn batch_average_attendance(
    summaries: &BTreeMap<String, AttendanceSummary>,
    total_classes: usize,
) -> f64 {
    let slots = total_classes * summaries.len();
    if slots == 0 {
        return 0.0;
    }
    let present: usize = summaries.values().map(|s| s.present_classes).sum();
    round_2_decimals(present as f64 / slots as f64 * 100.0)
}

// ---------------------------------------------------------------------------
// Exams

#[derive(Debug, Clone, PartialEq)]
pub struct Exam {
    pub id: String,
    pub batch_id: String,
    pub name: String,
    pub total_marks: f64,
    pub date: DateTime<Utc>,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamResult {
    pub id: String,
    pub exam_id: String,
    pub student_id: String,
    pub marks_obtained: f64,
    pub grade: Option<Grade>,
    pub remarks: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStatistics {
    pub total_students: usize,
    pub average_marks: f64,
    pub highest_marks: f64,
    pub lowest_marks: f64,
    pub total_marks: f64,
}

pub fn stats_of(results: &[ExamResult], total_marks: f64) -> Result<ExamStatistics, CalcError> {
    check_total_marks(total_marks, results.first().map(|r| r.exam_id.as_str()))?;
    if results.is_empty() {
        return Ok(ExamStatistics {
            total_students: 0,
            average_marks: 0.0,
            highest_marks: 0.0,
            lowest_marks: 0.0,
            total_marks,
        });
    }
    let n = results.len();
    let sum: f64 = results.iter().map(|r| r.marks_obtained).sum();
    let highest = results
        .iter()
        .map(|r| r.marks_obtained)
        .fold(f64::NEG_INFINITY, f64::max);
    let lowest = results
        .iter()
        .map(|r| r.marks_obtained)
        .fold(f64::INFINITY, f64::min);
    Ok(ExamStatistics {
        total_students: n,
        average_marks: round_2_decimals(sum / n as f64),
        highest_marks: highest,
        lowest_marks: lowest,
        total_marks,
    })
}

pub fn result_percentage(marks_obtained: f64, total_marks: f64) -> Result<f64, CalcError> {
    check_total_marks(total_marks, None)?;
    Ok(round_2_decimals(marks_obtained / total_marks * 100.0))
}

/// Grade for a mark against an exam total, using the rounded percentage.
pub fn grade_for_marks(marks_obtained: f64, total_marks: f64) -> Result<Grade, CalcError> {
    Ok(grade_of(result_percentage(marks_obtained, total_marks)?))
}

fn compare_ranked(a: &ExamResult, b: &ExamResult) -> Ordering {
    b.marks_obtained
        .partial_cmp(&a.marks_obtained)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.student_id.cmp(&b.student_id))
}

/// Highest marks first; ties go to the earlier submission, then the lower
/// student id.
pub fn rank_results(results: &[ExamResult]) -> Vec<&ExamResult> {
    let mut ranked: Vec<&ExamResult> = results.iter().collect();
    ranked.sort_by(|a, b| compare_ranked(a, b));
    ranked
}

// ---------------------------------------------------------------------------
// Reports

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub contact_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamEntry {
    pub exam_id: String,
    pub exam_name: String,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub percentage: f64,
    pub grade: Grade,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallPerformance {
    pub total_exams: usize,
    pub average_marks: f64,
    pub average_percentage: f64,
    pub total_marks_obtained: f64,
    pub grades: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub student: StudentProfile,
    pub attendance: AttendanceSummary,
    pub exams: Vec<ExamEntry>,
    pub overall_performance: OverallPerformance,
}

pub fn format_date(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Exam entries ordered newest exam first (ties by exam id).
pub fn exam_entries(results: &[(ExamResult, Exam)]) -> Result<Vec<ExamEntry>, CalcError> {
    let mut ordered: Vec<&(ExamResult, Exam)> = results.iter().collect();
    ordered.sort_by(|(_, a), (_, b)| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    ordered
        .into_iter()
        .map(|(result, exam)| {
            check_total_marks(exam.total_marks, Some(&exam.id))?;
            let percentage = result_percentage(result.marks_obtained, exam.total_marks)?;
            Ok(ExamEntry {
                exam_id: exam.id.clone(),
                exam_name: exam.name.clone(),
                marks_obtained: result.marks_obtained,
                total_marks: exam.total_marks,
                percentage,
                grade: grade_of(percentage),
                date: format_date(&exam.date),
            })
        })
        .collect()
}

/// `average_marks` is the plain mean of marks; `average_percentage` is the
/// weighted ratio sum(marks) / sum(total marks).
pub fn overall_performance(entries: &[ExamEntry]) -> OverallPerformance {
    let n = entries.len();
    let obtained: f64 = entries.iter().map(|e| e.marks_obtained).sum();
    let possible: f64 = entries.iter().map(|e| e.total_marks).sum();
    let mut grades: BTreeMap<String, usize> = BTreeMap::new();
    for e in entries {
        *grades.entry(e.grade.as_str().to_string()).or_insert(0) += 1;
    }
    OverallPerformance {
        total_exams: n,
        average_marks: if n > 0 {
            round_2_decimals(obtained / n as f64)
        } else {
            0.0
        },
        average_percentage: if possible > 0.0 {
            round_2_decimals(obtained / possible * 100.0)
        } else {
            0.0
        },
        total_marks_obtained: obtained,
        grades,
    }
}

pub fn compose_student_report(
    student: StudentProfile,
    attendance_records: &[AttendanceRecord],
    results: &[(ExamResult, Exam)],
) -> Result<PerformanceReport, CalcError> {
    let attendance = summarize(attendance_records, &student.id);
    let exams = exam_entries(results)?;
    let overall_performance = overall_performance(&exams);
    Ok(PerformanceReport {
        student,
        attendance,
        exams,
        overall_performance,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRef {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHeader {
    pub id: String,
    pub name: String,
    pub course: NamedRef,
    pub teacher: TeacherRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub student_name: String,
    pub present_classes: usize,
    pub total_classes: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAttendance {
    pub total_classes: usize,
    pub average_attendance: f64,
    pub student_stats: Vec<StudentAttendance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSummary {
    pub exam_id: String,
    pub exam_name: String,
    pub date: String,
    #[serde(flatten)]
    pub statistics: ExamStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopPerformer {
    pub student_id: String,
    pub student_name: String,
    pub average_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_students: usize,
    pub average_performance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_performer: Option<TopPerformer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPerformanceReport {
    pub batch: BatchHeader,
    pub attendance: BatchAttendance,
    pub exams: Vec<ExamSummary>,
    pub overall_stats: OverallStats,
}

/// Batch attendance in roster order.
pub fn batch_attendance(roster: &[NamedRef], records: &[AttendanceRecord]) -> BatchAttendance {
    let ids: BTreeSet<String> = roster.iter().map(|s| s.id.clone()).collect();
    let summaries = summarize_batch(records, &ids);
    let student_stats = roster
        .iter()
        .filter_map(|s| {
            summaries.get(&s.id).map(|sum| StudentAttendance {
                student_id: s.id.clone(),
                student_name: s.name.clone(),
                present_classes: sum.present_classes,
                total_classes: sum.total_classes,
                percentage: sum.percentage,
            })
        })
        .collect();
    BatchAttendance {
        total_classes: records.len(),
        average_attendance: batch_average_attendance(&summaries, records.len()),
        student_stats,
    }
}

#[derive(Debug, Default)]
struct StudentTotals {
    obtained: f64,
    possible: f64,
    first_submitted: Option<DateTime<Utc>>,
}

pub fn compose_batch_report(
    batch: BatchHeader,
    roster: &[NamedRef],
    attendance_records: &[AttendanceRecord],
    exams: &[Exam],
    results_by_exam: &HashMap<String, Vec<ExamResult>>,
) -> Result<BatchPerformanceReport, CalcError> {
    let attendance = batch_attendance(roster, attendance_records);

    let mut exam_summaries = Vec::with_capacity(exams.len());
    let mut totals: BTreeMap<String, StudentTotals> = BTreeMap::new();
    for exam in exams {
        check_total_marks(exam.total_marks, Some(&exam.id))?;
        let results = results_by_exam
            .get(&exam.id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        exam_summaries.push(ExamSummary {
            exam_id: exam.id.clone(),
            exam_name: exam.name.clone(),
            date: format_date(&exam.date),
            statistics: stats_of(results, exam.total_marks)?,
        });
        for r in results {
            let t = totals.entry(r.student_id.clone()).or_default();
            t.obtained += r.marks_obtained;
            t.possible += exam.total_marks;
            t.first_submitted = Some(match t.first_submitted {
                Some(prev) if prev <= r.submitted_at => prev,
                _ => r.submitted_at,
            });
        }
    }

    let names: HashMap<&str, &str> = roster
        .iter()
        .map(|s| (s.id.as_str(), s.name.as_str()))
        .collect();
    let per_student: Vec<(String, f64, Option<DateTime<Utc>>)> = totals
        .into_iter()
        .filter(|(_, t)| t.possible > 0.0)
        .map(|(sid, t)| {
            (
                sid,
                round_2_decimals(t.obtained / t.possible * 100.0),
                t.first_submitted,
            )
        })
        .collect();

    let average_performance = if per_student.is_empty() {
        0.0
    } else {
        round_2_decimals(
            per_student.iter().map(|(_, pct, _)| *pct).sum::<f64>() / per_student.len() as f64,
        )
    };

    let top_performer = if roster.is_empty() || exams.is_empty() {
        None
    } else {
        per_student
            .iter()
            .min_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.2.cmp(&b.2))
                    .then_with(|| a.0.cmp(&b.0))
            })
            .map(|(sid, pct, _)| TopPerformer {
                student_id: sid.clone(),
                student_name: names.get(sid.as_str()).unwrap_or(&"Unknown").to_string(),
                average_percentage: *pct,
            })
    };

    Ok(BatchPerformanceReport {
        batch,
        attendance,
        exams: exam_summaries,
        overall_stats: OverallStats {
            total_students: roster.len(),
            average_performance,
            top_performer,
        },
    })
}
