mod support;

use serde_json::json;
use support::{assert_close, create_exam, mark_two_days, seed_institute, Sidecar};

#[test]
fn dashboards_per_role() {
    let mut s = Sidecar::start("instituted-dashboard");
    let inst = seed_institute(&mut s);
    mark_two_days(&mut s, &inst);
    create_exam(&mut s, &inst, "Midterm", "2099-03-01T09:00:00Z", 100.0);

    let student = s.ok("dashboard.get", json!({}), Some(&inst.students[0].token));
    assert_eq!(student["role"], "student");
    let d = &student["dashboard"];
    assert_eq!(d["student"]["name"], "Amy Student");
    assert_eq!(d["profileCompletion"]["overallPercentage"], 67);
    assert_eq!(d["quickStats"]["totalCourses"], 1);
    assert_eq!(d["quickStats"]["activeCourses"], 1);
    assert_eq!(d["upcomingExams"][0]["examName"], "Midterm");
    assert_eq!(d["attendanceSummary"]["totalClasses"], 2);
    assert_close(&d["attendanceSummary"]["percentage"], 100.0);
    assert_eq!(d["recentEnrollments"][0]["batchName"], "Morning Cohort");

    let teacher = s.ok("dashboard.teacher", json!({}), Some(&inst.teacher.token));
    let d = &teacher["dashboard"];
    assert_eq!(d["quickStats"]["totalBatches"], 1);
    assert_eq!(d["quickStats"]["totalStudents"], 2);
    assert_eq!(d["quickStats"]["upcomingExams"], 1);
    assert_eq!(d["assignedBatches"][0]["studentCount"], 2);
    // The seeded batch starts in the future, so nothing is scheduled today.
    assert_eq!(d["quickStats"]["classesToday"], 0);

    let admin = s.ok("dashboard.admin", json!({}), Some(&inst.admin.token));
    let overview = &admin["dashboard"]["overview"];
    assert_eq!(overview["totalStudents"], 2);
    assert_eq!(overview["totalTeachers"], 1);
    assert_eq!(overview["totalCourses"], 1);
    assert_eq!(overview["totalBatches"], 1);
    assert_eq!(overview["activeEnrollments"], 2);
    assert_eq!(overview["pendingApprovals"], 4);
    assert_close(&overview["revenueThisMonth"], 500.0);
    assert_eq!(admin["dashboard"]["popularCourses"][0]["enrollments"], 2);
    assert_eq!(admin["dashboard"]["systemHealth"]["databaseStatus"], "connected");
    assert!(admin["dashboard"]["systemHealth"]["activeSessions"].as_i64().unwrap_or(0) >= 4);

    assert_eq!(
        s.err_code("dashboard.admin", json!({}), Some(&inst.students[0].token)),
        "forbidden"
    );
    assert_eq!(
        s.err_code("dashboard.student", json!({}), Some(&inst.teacher.token)),
        "forbidden"
    );
}

#[test]
fn catalogue_and_enrollment_lifecycle() {
    let mut s = Sidecar::start("instituted-catalogue");
    let inst = seed_institute(&mut s);

    let listed = s.ok("courses.list", json!({}), None);
    assert_eq!(listed["count"], 1);
    let batches = s.ok(
        "batches.listByCourse",
        json!({ "courseId": inst.course_id }),
        None,
    );
    assert_eq!(batches["batches"][0]["totalStudents"], 2);
    assert_eq!(batches["batches"][0]["teacher"]["name"], "Tess Teacher");

    let late = s.signup("Cleo Late", "cleo@institute.test", "student");
    let enrolled = s.ok(
        "enrollments.enroll",
        json!({ "courseId": inst.course_id }),
        Some(&late.1),
    );
    assert_eq!(enrolled["enrollment"]["status"], "active");
    assert_eq!(
        s.err_code(
            "enrollments.enroll",
            json!({ "courseId": inst.course_id }),
            Some(&late.1)
        ),
        "conflict"
    );
    let eid = enrolled["enrollment"]["id"].as_str().expect("enrollment id").to_string();
    let full = s.call(
        "enrollments.assignBatch",
        json!({ "enrollmentId": eid, "batchId": inst.batch_id }),
        Some(&inst.admin.token),
    );
    assert_eq!(full["error"]["code"], "bad_params");
    assert_eq!(full["error"]["message"], "Batch is full");

    assert_eq!(
        s.err_code(
            "batches.update",
            json!({ "batchId": inst.batch_id, "maxStudents": 1 }),
            Some(&inst.teacher.token)
        ),
        "bad_params"
    );
    s.ok(
        "batches.update",
        json!({ "batchId": inst.batch_id, "maxStudents": 3 }),
        Some(&inst.teacher.token),
    );
    s.ok(
        "enrollments.assignBatch",
        json!({ "enrollmentId": eid, "batchId": inst.batch_id }),
        Some(&inst.admin.token),
    );

    let mine = s.ok("enrollments.mine", json!({}), Some(&late.1));
    assert_eq!(mine["count"], 1);
    assert_eq!(mine["enrollments"][0]["batch"]["name"], "Morning Cohort");

    let by_course = s.ok(
        "enrollments.byCourse",
        json!({ "courseId": inst.course_id }),
        Some(&inst.teacher.token),
    );
    assert_eq!(by_course["count"], 3);

    s.ok(
        "courses.delete",
        json!({ "courseId": inst.course_id }),
        Some(&inst.admin.token),
    );
    let listed = s.ok("courses.list", json!({}), None);
    assert_eq!(listed["count"], 0);
    let other = s.signup("Dan Later", "dan@institute.test", "student");
    assert_eq!(
        s.err_code(
            "enrollments.enroll",
            json!({ "courseId": inst.course_id }),
            Some(&other.1)
        ),
        "bad_params"
    );
}

#[test]
fn deleted_batch_rejects_writes() {
    let mut s = Sidecar::start("instituted-batch-inactive");
    let inst = seed_institute(&mut s);
    let late = s.signup("Cleo Late", "cleo@institute.test", "student");
    let enrolled = s.ok(
        "enrollments.enroll",
        json!({ "courseId": inst.course_id }),
        Some(&late.1),
    );
    let eid = enrolled["enrollment"]["id"].as_str().expect("enrollment id").to_string();
    s.ok(
        "batches.update",
        json!({ "batchId": inst.batch_id, "maxStudents": 5 }),
        Some(&inst.admin.token),
    );
    s.ok(
        "batches.delete",
        json!({ "batchId": inst.batch_id }),
        Some(&inst.admin.token),
    );

    let marked = s.call(
        "attendance.mark",
        json!({
            "batchId": inst.batch_id,
            "date": "2025-03-01",
            "presentStudents": [inst.students[0].id],
            "absentStudents": [],
        }),
        Some(&inst.teacher.token),
    );
    assert_eq!(marked["error"]["code"], "bad_params");
    assert_eq!(marked["error"]["message"], "Batch is not active");
    assert_eq!(
        s.err_code(
            "exams.create",
            json!({
                "name": "Late Quiz",
                "batchId": inst.batch_id,
                "date": "2099-03-01T09:00:00Z",
                "duration": 30,
                "totalMarks": 10,
            }),
            Some(&inst.teacher.token)
        ),
        "bad_params"
    );
    assert_eq!(
        s.err_code(
            "batches.assignStudent",
            json!({ "batchId": inst.batch_id, "studentId": late.0 }),
            Some(&inst.admin.token)
        ),
        "bad_params"
    );
    assert_eq!(
        s.err_code(
            "enrollments.assignBatch",
            json!({ "enrollmentId": eid, "batchId": inst.batch_id }),
            Some(&inst.admin.token)
        ),
        "bad_params"
    );

    // Existing records stay readable.
    let stats = s.ok(
        "attendance.stats",
        json!({ "batchId": inst.batch_id }),
        Some(&inst.teacher.token),
    );
    assert_eq!(stats["statistics"]["totalClasses"], 0);
}
