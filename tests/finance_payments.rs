mod test_support;

use serde_json::{json, Value};
use test_support::{seed_school, Sidecar, School, SESSION};

fn create_fee(sc: &mut Sidecar, token: &str, school: &School, class_scoped: bool, name: &str, amount: f64) -> String {
    let mut params = json!({
        "branchId": school.branch_id,
        "name": name,
        "amount": amount,
        "term": 1,
        "session": SESSION,
    });
    if class_scoped {
        params["classId"] = json!(school.class_id);
    }
    let fee = sc.ok(Some(token), "fees.create", params);
    fee["id"].as_str().expect("fee id").to_string()
}

fn balance_row<'a>(balances: &'a Value, student_id: &str) -> &'a Value {
    balances["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"] == student_id)
        .expect("balance row")
}

#[test]
fn payments_reduce_the_balance_and_overpayment_is_refused() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let (ada, _) = school.students[0].clone();
    let tuition = create_fee(&mut sc, &admin, &school, true, "Tuition", 50000.0);
    let levy = create_fee(&mut sc, &admin, &school, false, "PTA Levy", 2500.0);

    let first = sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": tuition, "amount": 30000, "method": "Transfer" }),
    );
    assert_eq!(first["method"], "transfer");
    assert_eq!(first["balance"].as_f64(), Some(20000.0));

    let over = sc.request(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": tuition, "amount": 20000.01 }),
    );
    assert_eq!(over["error"]["code"], "conflict");
    assert_eq!(over["error"]["details"]["outstanding"].as_f64(), Some(20000.0));

    assert_eq!(
        sc.fail(
            Some(&admin),
            "payments.record",
            json!({ "studentId": ada, "feeId": levy, "amount": 0 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.fail(
            Some(&admin),
            "payments.record",
            json!({ "studentId": ada, "feeId": levy, "amount": 100, "method": "barter" })
        ),
        "bad_params"
    );
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": levy, "amount": 2500, "paidAt": "2024-10-01" }),
    );

    let balances = sc.ok(
        Some(&admin),
        "finance.balances",
        json!({ "classId": school.class_id, "term": 1, "session": SESSION }),
    );
    let row = balance_row(&balances, &ada);
    assert_eq!(row["expected"].as_f64(), Some(52500.0));
    assert_eq!(row["paid"].as_f64(), Some(32500.0));
    assert_eq!(row["balance"].as_f64(), Some(20000.0));
    assert_eq!(balances["totalExpected"].as_f64(), Some(105000.0));
    assert_eq!(balances["totalPaid"].as_f64(), Some(32500.0));

    let summary = sc.ok(
        Some(&admin),
        "finance.summary",
        json!({ "branchId": school.branch_id, "term": 1, "session": SESSION }),
    );
    assert_eq!(summary["expected"].as_f64(), Some(105000.0));
    assert_eq!(summary["collected"].as_f64(), Some(32500.0));
    assert_eq!(summary["outstanding"].as_f64(), Some(72500.0));
}

#[test]
fn statement_lists_fees_and_payments_for_one_student() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (ada, _) = school.students[0].clone();
    let tuition = create_fee(&mut sc, &admin, &school, true, "Tuition", 1000.0);
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": tuition, "amount": 400, "reference": "TRX-1" }),
    );

    let statement = sc.ok(Some(&admin), "finance.statement", json!({ "studentId": ada }));
    assert_eq!(statement["sowaId"], "SOWA/0001");
    assert_eq!(statement["fees"].as_array().map(Vec::len), Some(1));
    assert_eq!(statement["fees"][0]["balance"].as_f64(), Some(600.0));
    assert_eq!(statement["payments"][0]["reference"], "TRX-1");
    assert_eq!(statement["balance"].as_f64(), Some(600.0));

    let listed = sc.ok(Some(&admin), "payments.list", json!({ "studentId": ada }));
    assert_eq!(listed["payments"][0]["recordedBy"], "admin");
}

#[test]
fn fees_with_payments_cannot_be_deleted() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (ada, _) = school.students[0].clone();
    let fee = create_fee(&mut sc, &admin, &school, true, "Books", 300.0);
    let payment = sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": fee, "amount": 300 }),
    );
    assert_eq!(payment["balance"].as_f64(), Some(0.0));

    let refused = sc.request(Some(&admin), "fees.delete", json!({ "feeId": fee }));
    assert_eq!(refused["error"]["code"], "conflict");
    assert_eq!(refused["error"]["details"]["payments"], 1);

    sc.ok(Some(&admin), "payments.delete", json!({ "paymentId": payment["id"] }));
    sc.ok(Some(&admin), "fees.delete", json!({ "feeId": fee }));
    let fees = sc.ok(Some(&admin), "fees.list", json!({}));
    assert_eq!(fees["fees"].as_array().map(Vec::len), Some(0));
}

#[test]
fn class_fees_must_match_the_branch() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[]);
    let annex = sc.ok(Some(&admin), "branches.create", json!({ "name": "Annex" }));
    let code = sc.fail(
        Some(&admin),
        "fees.create",
        json!({
            "branchId": annex["id"],
            "classId": school.class_id,
            "name": "Tuition",
            "amount": 100,
            "term": 1,
            "session": SESSION,
        }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn fee_amount_cannot_drop_below_what_was_paid() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi"), ("Bayo", "Ade")]);
    let (ada, _) = school.students[0].clone();
    let (bayo, _) = school.students[1].clone();
    let fee = create_fee(&mut sc, &admin, &school, true, "Tuition", 1000.0);
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": fee, "amount": 600 }),
    );
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": ada, "feeId": fee, "amount": 200 }),
    );
    sc.ok(
        Some(&admin),
        "payments.record",
        json!({ "studentId": bayo, "feeId": fee, "amount": 300 }),
    );

    let refused = sc.request(Some(&admin), "fees.update", json!({ "feeId": fee, "amount": 200 }));
    assert_eq!(refused["error"]["code"], "conflict");
    assert_eq!(refused["error"]["details"]["paid"].as_f64(), Some(800.0));

    let statement = sc.ok(Some(&admin), "finance.statement", json!({ "studentId": ada }));
    assert_eq!(statement["fees"][0]["amount"].as_f64(), Some(1000.0));

    // Lowering to exactly the largest amount paid is allowed.
    let updated = sc.ok(Some(&admin), "fees.update", json!({ "feeId": fee, "amount": 800 }));
    assert_eq!(updated["amount"].as_f64(), Some(800.0));
    let statement = sc.ok(Some(&admin), "finance.statement", json!({ "studentId": ada }));
    assert_eq!(statement["balance"].as_f64(), Some(0.0));
}
