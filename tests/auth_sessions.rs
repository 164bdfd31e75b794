mod test_support;

use serde_json::json;
use test_support::{seed_school, Sidecar, ADMIN_PASSWORD};

#[test]
fn protected_methods_require_a_token() {
    let mut sc = Sidecar::spawn();
    assert_eq!(sc.fail(None, "branches.list", json!({})), "unauthorized");
    assert_eq!(sc.fail(Some("not-a-token"), "branches.list", json!({})), "unauthorized");

    // Public methods need no token.
    let info = sc.ok(None, "site.info", json!({}));
    assert!(info["school"].is_object());
    assert_eq!(info["currentTerm"], 1);
}

#[test]
fn login_rejects_wrong_password_and_unknown_user() {
    let mut sc = Sidecar::spawn();
    assert_eq!(
        sc.fail(None, "auth.login", json!({ "identifier": "admin", "password": "wrong-one" })),
        "unauthorized"
    );
    assert_eq!(
        sc.fail(None, "auth.login", json!({ "identifier": "ghost", "password": ADMIN_PASSWORD })),
        "unauthorized"
    );
    assert_eq!(sc.fail(None, "auth.login", json!({ "identifier": "admin" })), "bad_params");
}

#[test]
fn logout_revokes_the_token() {
    let mut sc = Sidecar::spawn();
    let token = sc.admin();
    let me = sc.ok(Some(&token), "auth.me", json!({}));
    assert_eq!(me["role"], "admin");

    sc.ok(Some(&token), "auth.logout", json!({}));
    assert_eq!(sc.fail(Some(&token), "auth.me", json!({})), "unauthorized");

    // A fresh sign-in still works.
    let again = sc.admin();
    sc.ok(Some(&again), "auth.me", json!({}));
}

#[test]
fn students_sign_in_with_sowa_id_in_any_case() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (student_id, sowa_id) = school.students[0].clone();
    assert_eq!(sowa_id, "SOWA/0001");

    let token = sc.login("sowa/0001", "changeme");
    let me = sc.ok(Some(&token), "auth.me", json!({}));
    assert_eq!(me["role"], "student");
    assert_eq!(me["studentId"], student_id.as_str());

    // Students cannot reach staff methods.
    assert_eq!(sc.fail(Some(&token), "students.list", json!({})), "forbidden");
}

#[test]
fn inactive_students_cannot_sign_in_and_lose_their_session() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (student_id, sowa_id) = school.students[0].clone();

    let token = sc.login(&sowa_id, "changeme");
    sc.ok(
        Some(&admin),
        "students.setActive",
        json!({ "studentId": student_id, "active": false }),
    );

    assert_eq!(
        sc.fail(None, "auth.login", json!({ "identifier": sowa_id, "password": "changeme" })),
        "unauthorized"
    );
    assert_eq!(sc.fail(Some(&token), "portal.profile", json!({})), "unauthorized");
}

#[test]
fn change_password_checks_the_current_one() {
    let mut sc = Sidecar::spawn();
    let token = sc.admin();
    assert_eq!(
        sc.fail(
            Some(&token),
            "auth.changePassword",
            json!({ "currentPassword": "nope-nope", "newPassword": "fresh-pass" })
        ),
        "unauthorized"
    );
    assert_eq!(
        sc.fail(
            Some(&token),
            "auth.changePassword",
            json!({ "currentPassword": ADMIN_PASSWORD, "newPassword": "abc" })
        ),
        "bad_params"
    );
    sc.ok(
        Some(&token),
        "auth.changePassword",
        json!({ "currentPassword": ADMIN_PASSWORD, "newPassword": "fresh-pass" }),
    );
    sc.login("admin", "fresh-pass");
}

#[test]
fn sub_admins_are_pinned_to_their_branch() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let home = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let other_branch = sc.ok(Some(&admin), "branches.create", json!({ "name": "Annex" }));
    let other_id = other_branch["id"].as_str().expect("branch id").to_string();
    let other_class = sc.ok(
        Some(&admin),
        "classes.create",
        json!({ "branchId": other_id, "name": "JSS 2B", "level": 2 }),
    );
    let other_class_id = other_class["id"].as_str().expect("class id").to_string();

    sc.ok(
        Some(&admin),
        "users.create",
        json!({
            "username": "deputy",
            "password": "deputy-pass",
            "role": "sub_admin",
            "branchId": home.branch_id,
        }),
    );
    let deputy = sc.login("deputy", "deputy-pass");

    let classes = sc.ok(Some(&deputy), "classes.list", json!({}));
    let listed: Vec<&str> = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(listed, vec![home.class_id.as_str()]);

    assert_eq!(
        sc.fail(Some(&deputy), "classes.list", json!({ "branchId": other_id })),
        "forbidden"
    );
    assert_eq!(
        sc.fail(
            Some(&deputy),
            "students.create",
            json!({ "classId": other_class_id, "firstName": "Bo", "lastName": "Eze" })
        ),
        "forbidden"
    );
    // Staff accounts are admin-only.
    assert_eq!(sc.fail(Some(&deputy), "users.list", json!({})), "forbidden");
}

#[test]
fn admins_cannot_remove_or_demote_themselves() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[]);
    let me = sc.ok(Some(&admin), "auth.me", json!({}));
    let admin_id = me["id"].as_str().expect("user id").to_string();

    assert_eq!(
        sc.fail(
            Some(&admin),
            "users.update",
            json!({ "userId": admin_id, "role": "sub_admin", "branchId": school.branch_id })
        ),
        "conflict"
    );
    assert_eq!(sc.fail(Some(&admin), "users.delete", json!({ "userId": admin_id })), "conflict");

    let second = sc.ok(
        Some(&admin),
        "users.create",
        json!({ "username": "principal", "password": "principal-pass", "role": "admin" }),
    );
    let second_id = second["id"].as_str().expect("user id").to_string();
    let principal = sc.login("principal", "principal-pass");

    // With two admins, one may demote the other; the role change applies at once.
    sc.ok(
        Some(&principal),
        "users.update",
        json!({ "userId": admin_id, "role": "sub_admin", "branchId": school.branch_id }),
    );
    assert_eq!(sc.fail(Some(&admin), "users.list", json!({})), "forbidden");

    // The only admin left cannot delete their own account.
    assert_eq!(sc.fail(Some(&principal), "users.delete", json!({ "userId": second_id })), "conflict");
    let users = sc.ok(Some(&principal), "users.list", json!({}));
    let admins = users["users"]
        .as_array()
        .expect("users")
        .iter()
        .filter(|u| u["role"] == "admin")
        .count();
    assert_eq!(admins, 1);

    sc.ok(Some(&principal), "users.delete", json!({ "userId": admin_id }));
    assert_eq!(sc.fail(Some(&admin), "auth.me", json!({})), "unauthorized");
}

#[test]
fn cross_branch_transfer_needs_an_admin() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let home = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let (ada, _) = home.students[0].clone();
    let annex = sc.ok(Some(&admin), "branches.create", json!({ "name": "Annex" }));
    let annex_id = annex["id"].as_str().expect("branch id").to_string();
    let annex_class = sc.ok(
        Some(&admin),
        "classes.create",
        json!({ "branchId": annex_id, "name": "JSS 1C", "level": 1 }),
    );
    let annex_class_id = annex_class["id"].as_str().expect("class id").to_string();
    sc.ok(
        Some(&admin),
        "users.create",
        json!({
            "username": "deputy",
            "password": "deputy-pass",
            "role": "sub_admin",
            "branchId": home.branch_id,
        }),
    );
    let deputy = sc.login("deputy", "deputy-pass");

    assert_eq!(
        sc.fail(
            Some(&deputy),
            "students.transfer",
            json!({ "studentId": ada, "classId": annex_class_id })
        ),
        "forbidden"
    );
    let still = sc.ok(Some(&admin), "students.get", json!({ "studentId": ada }));
    assert_eq!(still["classId"], home.class_id.as_str());

    let moved = sc.ok(
        Some(&admin),
        "students.transfer",
        json!({ "studentId": ada, "classId": annex_class_id }),
    );
    assert_eq!(moved["classId"], annex_class_id.as_str());
    assert_eq!(moved["branchId"], annex_id.as_str());

    // The student has left the deputy's branch.
    assert_eq!(sc.fail(Some(&deputy), "students.get", json!({ "studentId": ada })), "forbidden");
}
