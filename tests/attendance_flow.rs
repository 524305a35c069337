mod support;

use serde_json::json;
use support::{assert_close, create_teacher, mark_two_days, seed_institute, Sidecar};

#[test]
fn marking_rules_and_summaries() {
    let mut s = Sidecar::start("instituted-attendance-mark");
    let inst = seed_institute(&mut s);
    let (a, b) = (inst.students[0].id.clone(), inst.students[1].id.clone());

    let overlap = s.call(
        "attendance.mark",
        json!({
            "batchId": inst.batch_id,
            "date": "2025-03-01",
            "presentStudents": [a, b],
            "absentStudents": [b],
        }),
        Some(&inst.teacher.token),
    );
    assert_eq!(overlap["error"]["code"], "bad_params");
    assert_eq!(overlap["error"]["details"]["studentIds"][0], b.as_str());

    assert_eq!(
        s.err_code(
            "attendance.mark",
            json!({
                "batchId": inst.batch_id,
                "date": "2025-03-01",
                "presentStudents": [a, inst.teacher.id],
                "absentStudents": [],
            }),
            Some(&inst.teacher.token)
        ),
        "bad_params"
    );

    mark_two_days(&mut s, &inst);

    assert_eq!(
        s.err_code(
            "attendance.mark",
            json!({
                "batchId": inst.batch_id,
                "date": "2025-03-02",
                "presentStudents": [a, b],
                "absentStudents": [],
            }),
            Some(&inst.teacher.token)
        ),
        "conflict"
    );

    let mine = s.ok(
        "attendance.byStudent",
        json!({ "studentId": b }),
        Some(&inst.students[1].token),
    );
    assert_eq!(mine["summary"]["totalClasses"], 2);
    assert_eq!(mine["summary"]["presentClasses"], 1);
    assert_eq!(mine["summary"]["absentClasses"], 1);
    assert_close(&mine["summary"]["percentage"], 50.0);
    assert_eq!(mine["attendance"][0]["date"], "2025-03-02");
    assert_eq!(mine["attendance"][0]["status"], "absent");
    assert_eq!(mine["attendance"][1]["status"], "present");

    assert_eq!(
        s.err_code(
            "attendance.byStudent",
            json!({ "studentId": a }),
            Some(&inst.students[1].token)
        ),
        "forbidden"
    );

    let stats = s.ok(
        "attendance.stats",
        json!({ "batchId": inst.batch_id }),
        Some(&inst.teacher.token),
    );
    let statistics = &stats["statistics"];
    assert_eq!(statistics["totalClasses"], 2);
    assert_close(&statistics["averageAttendance"], 75.0);
    let per_student = statistics["studentStats"].as_array().expect("studentStats");
    assert_eq!(per_student.len(), 2);
    assert_eq!(per_student[0]["studentName"], "Amy Student");
    assert_close(&per_student[0]["percentage"], 100.0);
    assert_close(&per_student[1]["percentage"], 50.0);
}

#[test]
fn batch_listing_and_access() {
    let mut s = Sidecar::start("instituted-attendance-access");
    let inst = seed_institute(&mut s);
    mark_two_days(&mut s, &inst);

    let listed = s.ok(
        "attendance.byBatch",
        json!({ "batchId": inst.batch_id }),
        Some(&inst.students[0].token),
    );
    assert_eq!(listed["count"], 2);
    let rows = listed["attendance"].as_array().expect("attendance rows");
    assert_eq!(rows[0]["date"], "2025-03-02");
    assert_eq!(rows[1]["date"], "2025-03-01");
    assert_eq!(rows[0]["absentStudents"][0]["name"], "Ben Student");
    assert_eq!(rows[0]["recordedBy"], inst.teacher.id.as_str());

    let other = create_teacher(&mut s, &inst.admin.token, "Otto Other", "otto@institute.test");
    assert_eq!(
        s.err_code(
            "attendance.mark",
            json!({
                "batchId": inst.batch_id,
                "date": "2025-03-03",
                "presentStudents": [inst.students[0].id],
                "absentStudents": [],
            }),
            Some(&other.token)
        ),
        "forbidden"
    );
    assert_eq!(
        s.err_code(
            "attendance.mark",
            json!({
                "batchId": inst.batch_id,
                "date": "2025-03-03",
                "presentStudents": [],
                "absentStudents": [],
            }),
            Some(&inst.students[0].token)
        ),
        "forbidden"
    );

    // Admins mark for any batch.
    s.ok(
        "attendance.mark",
        json!({
            "batchId": inst.batch_id,
            "date": "2025-03-03",
            "presentStudents": [inst.students[1].id],
            "absentStudents": [inst.students[0].id],
        }),
        Some(&inst.admin.token),
    );

    let outsider = s.signup("Cleo Outsider", "cleo@institute.test", "student").1;
    assert_eq!(
        s.err_code(
            "attendance.byBatch",
            json!({ "batchId": inst.batch_id }),
            Some(&outsider)
        ),
        "forbidden"
    );
    assert_eq!(
        s.err_code(
            "attendance.stats",
            json!({ "batchId": "missing" }),
            Some(&inst.admin.token)
        ),
        "not_found"
    );
}
