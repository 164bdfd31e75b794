mod test_support;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use test_support::{save_scores, seed_school, Sidecar, SESSION};

fn row_for<'a>(rows: &'a Value, student_id: &str) -> &'a Value {
    rows.as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"] == student_id)
        .expect("student row")
}

#[test]
fn sowa_ids_are_sequential_across_branches() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let ids: Vec<&str> = school.students.iter().map(|(_, s)| s.as_str()).collect();
    assert_eq!(ids, vec!["SOWA/0001", "SOWA/0002"]);

    let annex = sc.ok(Some(&admin), "branches.create", json!({ "name": "Annex" }));
    let class = sc.ok(
        Some(&admin),
        "classes.create",
        json!({ "branchId": annex["id"], "name": "Primary 4", "level": 4 }),
    );
    let third = sc.ok(
        Some(&admin),
        "students.create",
        json!({ "classId": class["id"], "firstName": "Chi", "lastName": "Nwa" }),
    );
    assert_eq!(third["sowaId"], "SOWA/0003");
    assert_eq!(third["username"], "SOWA/0003");
}

#[test]
fn student_validation_and_duplicate_email() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[]);

    assert_eq!(
        sc.fail(
            Some(&admin),
            "students.create",
            json!({ "classId": school.class_id, "firstName": "Ada" })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.fail(
            Some(&admin),
            "students.create",
            json!({ "classId": school.class_id, "firstName": "Ada", "lastName": "Obi", "email": "nope" })
        ),
        "bad_params"
    );
    let first = sc.ok(
        Some(&admin),
        "students.create",
        json!({ "classId": school.class_id, "firstName": "Ada", "lastName": "Obi", "email": "ada@example.com" }),
    );
    assert_eq!(first["username"], "ada@example.com");
    assert_eq!(
        sc.fail(
            Some(&admin),
            "students.create",
            json!({ "classId": school.class_id, "firstName": "Ada", "lastName": "Two", "email": "ADA@example.com" })
        ),
        "conflict"
    );
}

#[test]
fn score_save_reports_row_errors_and_keeps_the_rest() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let (ada, _) = school.students[0].clone();
    let (bayo, _) = school.students[1].clone();

    let saved = save_scores(
        &mut sc,
        &admin,
        &school.class_id,
        &school.maths_id,
        1,
        json!([
            { "studentId": ada, "ca1": 15, "ca2": 18, "exam": 52 },
            { "studentId": bayo, "ca1": 25 },
            { "studentId": "missing", "exam": 10 },
        ]),
    );
    assert_eq!(saved["saved"], 1);
    let errors = saved["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[0]["code"], "bad_params");
    assert_eq!(errors[1]["code"], "not_found");

    let got = sc.ok(
        Some(&admin),
        "scores.get",
        json!({ "classId": school.class_id, "subjectId": school.maths_id, "term": 1, "session": SESSION }),
    );
    let row = row_for(&got["rows"], &ada);
    assert_eq!(row["total"].as_f64(), Some(85.0));
    assert_eq!(row["grade"], "A");
    assert_eq!(row["position"], 1);
    assert!(row_for(&got["rows"], &bayo)["total"].is_null());

    // Clearing every part removes the score.
    let cleared = save_scores(
        &mut sc,
        &admin,
        &school.class_id,
        &school.maths_id,
        1,
        json!([{ "studentId": ada, "ca1": null, "ca2": null, "exam": null }]),
    );
    assert_eq!(cleared["saved"], 1);
    let got = sc.ok(
        Some(&admin),
        "scores.get",
        json!({ "classId": school.class_id, "subjectId": school.maths_id, "term": 1, "session": SESSION }),
    );
    assert!(row_for(&got["rows"], &ada)["total"].is_null());
}

#[test]
fn score_save_rejects_bad_term_and_session() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    for (term, session) in [(4, SESSION), (1, "2024/2026"), (1, "2024-2025")] {
        let code = sc.fail(
            Some(&admin),
            "scores.save",
            json!({
                "classId": school.class_id,
                "subjectId": school.maths_id,
                "term": term,
                "session": session,
                "entries": [],
            }),
        );
        assert_eq!(code, "bad_params", "term {term} session {session}");
    }
}

#[test]
fn csv_upload_updates_filled_cells_and_keeps_blank_ones() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let (ada, ada_sowa) = school.students[0].clone();
    let (bayo, bayo_sowa) = school.students[1].clone();
    save_scores(
        &mut sc,
        &admin,
        &school.class_id,
        &school.maths_id,
        1,
        json!([{ "studentId": ada, "ca1": 10, "ca2": 10, "exam": 40 }]),
    );

    let csv = format!(
        "SOWA ID,Name,CA1,CA2,Exam\n{ada_sowa},Obi Ada,,12,\n{bayo_sowa},Ade Bayo,14,16,50\nSOWA/9999,Nobody,1,1,1\n"
    );
    let result = sc.ok(
        Some(&admin),
        "scores.upload",
        json!({
            "classId": school.class_id,
            "term": 1,
            "session": SESSION,
            "fileName": "Mathematics.csv",
            "fileBase64": STANDARD.encode(csv),
        }),
    );
    assert_eq!(result["rowsWritten"], 2);
    let sheet = &result["sheets"][0];
    assert_eq!(sheet["status"], "matched");
    assert_eq!(sheet["subjectName"], "Mathematics");
    assert_eq!(sheet["rowsUpdated"], 2);
    assert_eq!(sheet["rowsFailed"], 1);
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["row"], 4);

    let got = sc.ok(
        Some(&admin),
        "scores.get",
        json!({ "classId": school.class_id, "subjectId": school.maths_id, "term": 1, "session": SESSION }),
    );
    let ada_row = row_for(&got["rows"], &ada);
    assert_eq!(ada_row["ca1"].as_f64(), Some(10.0));
    assert_eq!(ada_row["ca2"].as_f64(), Some(12.0));
    assert_eq!(ada_row["exam"].as_f64(), Some(40.0));
    assert_eq!(row_for(&got["rows"], &bayo)["total"].as_f64(), Some(80.0));
}

#[test]
fn upload_of_an_unknown_subject_is_reported_not_written() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let result = sc.ok(
        Some(&admin),
        "scores.upload",
        json!({
            "classId": school.class_id,
            "term": 1,
            "session": SESSION,
            "fileName": "Chemistry.csv",
            "fileBase64": STANDARD.encode("SOWA ID,CA1\nSOWA/0001,5\n"),
        }),
    );
    assert_eq!(result["rowsWritten"], 0);
    assert_eq!(result["sheets"][0]["status"], "unmatched");
}

#[test]
fn template_has_one_file_per_subject_with_current_values() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (ada, ada_sowa) = school.students[0].clone();
    save_scores(
        &mut sc,
        &admin,
        &school.class_id,
        &school.english_id,
        2,
        json!([{ "studentId": ada, "exam": 33 }]),
    );

    let template = sc.ok(
        Some(&admin),
        "scores.template",
        json!({ "classId": school.class_id, "term": 2, "session": SESSION }),
    );
    let files = template["files"].as_array().expect("files");
    assert_eq!(files.len(), 2);
    let english = files
        .iter()
        .find(|f| f["sheet"] == "English")
        .expect("english file");
    assert_eq!(english["fileName"], "English.csv");
    let csv = english["csv"].as_str().expect("csv");
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("SOWA ID,Name,CA1,CA2,Exam"));
    let row = lines.next().expect("student row");
    assert!(row.starts_with(&ada_sowa));
    assert!(row.ends_with(",33"));
}

#[test]
fn bulk_student_upload_creates_valid_rows() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[]);
    let csv = "First Name,Last Name,Gender\nAda,Obi,F\n,Missing,M\nBayo,Ade,\n";
    let result = sc.ok(
        Some(&admin),
        "students.bulkUpload",
        json!({
            "classId": school.class_id,
            "fileName": "students.csv",
            "fileBase64": STANDARD.encode(csv),
        }),
    );
    assert_eq!(result["createdCount"], 2);
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["row"], 3);

    let listed = sc.ok(Some(&admin), "students.list", json!({ "classId": school.class_id }));
    assert_eq!(listed["students"].as_array().map(Vec::len), Some(2));

    assert_eq!(
        sc.fail(
            Some(&admin),
            "students.bulkUpload",
            json!({
                "classId": school.class_id,
                "fileName": "students.csv",
                "fileBase64": STANDARD.encode("Pupil,Class\nObi Ada,JSS 1A\n"),
            })
        ),
        "bad_params"
    );
}

#[test]
fn deleting_a_student_removes_every_dependent_record() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let (ada, ada_sowa) = school.students[0].clone();
    let (bayo, _) = school.students[1].clone();

    save_scores(
        &mut sc,
        &admin,
        &school.class_id,
        &school.maths_id,
        1,
        json!([
            { "studentId": ada, "ca1": 10, "ca2": 10, "exam": 40 },
            { "studentId": bayo, "ca1": 5, "ca2": 5, "exam": 30 },
        ]),
    );
    sc.ok(
        Some(&admin),
        "attendance.mark",
        json!({
            "classId": school.class_id,
            "date": "2024-10-07",
            "term": 1,
            "session": SESSION,
            "entries": [{ "studentId": ada, "status": "present" }, { "studentId": bayo, "status": "late" }],
        }),
    );
    sc.ok(
        Some(&admin),
        "reports.remarks.set",
        json!({ "studentId": ada, "term": 1, "session": SESSION, "teacherComment": "Good" }),
    );
    let fee = sc.ok(
        Some(&admin),
        "fees.create",
        json!({ "branchId": school.branch_id, "name": "Tuition", "amount": 500, "term": 1, "session": SESSION }),
    );
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": fee["id"], "amount": 200 }),
    );
    sc.ok(
        Some(&admin),
        "notifications.create",
        json!({ "title": "See the bursar", "message": "Fees", "audience": "student", "targetId": ada }),
    );

    sc.ok(Some(&admin), "students.delete", json!({ "studentId": ada }));

    assert_eq!(sc.fail(Some(&admin), "students.get", json!({ "studentId": ada })), "not_found");
    assert_eq!(
        sc.fail(None, "auth.login", json!({ "identifier": ada_sowa, "password": "changeme" })),
        "unauthorized"
    );
    let scores = sc.ok(
        Some(&admin),
        "scores.get",
        json!({ "classId": school.class_id, "subjectId": school.maths_id, "term": 1, "session": SESSION }),
    );
    let rows = scores["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["studentId"], bayo.as_str());
    let day = sc.ok(
        Some(&admin),
        "attendance.get",
        json!({ "classId": school.class_id, "date": "2024-10-07" }),
    );
    assert_eq!(day["rows"].as_array().map(Vec::len), Some(1));
    let payments = sc.ok(Some(&admin), "payments.list", json!({}));
    assert_eq!(payments["payments"].as_array().map(Vec::len), Some(0));
    let notes = sc.ok(Some(&admin), "notifications.list", json!({}));
    assert_eq!(notes["notifications"].as_array().map(Vec::len), Some(0));

    // Nothing else was touched.
    sc.ok(Some(&admin), "students.get", json!({ "studentId": bayo }));
    sc.ok(Some(&admin), "fees.delete", json!({ "feeId": fee["id"] }));
}

#[test]
fn classes_with_students_or_paid_fees_are_kept() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (ada, _) = school.students[0].clone();

    let refused = sc.request(Some(&admin), "classes.delete", json!({ "classId": school.class_id }));
    assert_eq!(refused["error"]["code"], "conflict");
    assert_eq!(refused["error"]["details"]["students"], 1);

    let fee = sc.ok(
        Some(&admin),
        "fees.create",
        json!({
            "branchId": school.branch_id,
            "classId": school.class_id,
            "name": "Books",
            "amount": 300,
            "term": 1,
            "session": SESSION,
        }),
    );
    let payment = sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": fee["id"], "amount": 300 }),
    );
    let other = sc.ok(
        Some(&admin),
        "classes.create",
        json!({ "branchId": school.branch_id, "name": "JSS 1B", "level": 1 }),
    );
    sc.ok(
        Some(&admin),
        "students.transfer",
        json!({ "studentId": ada, "classId": other["id"] }),
    );

    let refused = sc.request(Some(&admin), "classes.delete", json!({ "classId": school.class_id }));
    assert_eq!(refused["error"]["code"], "conflict");
    assert_eq!(refused["error"]["details"]["payments"], 1);

    sc.ok(Some(&admin), "payments.delete", json!({ "paymentId": payment["id"] }));
    sc.ok(Some(&admin), "classes.delete", json!({ "classId": school.class_id }));
    let classes = sc.ok(Some(&admin), "classes.list", json!({}));
    let names: Vec<&str> = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["JSS 1B"]);
    assert_eq!(sc.fail(Some(&admin), "fees.delete", json!({ "feeId": fee["id"] })), "not_found");
}
