mod test_support;

use serde_json::json;
use std::io::Read;
use test_support::{out_path, seed_school, Sidecar};

#[test]
fn export_then_import_restores_the_snapshot() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[("Ada", "Obi")]);
    let work = tempfile::tempdir().expect("work dir");
    let bundle = out_path(work.path(), "school-backup.zip");

    let exported = sc.ok(
        Some(&admin),
        "backup.export",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], "schoold-bundle-v1");
    assert_eq!(exported["entryCount"], 2);
    assert!(bundle.is_file());

    let file = std::fs::File::open(&bundle).expect("open bundle");
    let mut zip = zip::ZipArchive::new(file).expect("zip archive");
    let mut manifest = String::new();
    zip.by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], "schoold-bundle-v1");
    assert!(zip.by_name("db/school.sqlite3").is_ok());

    // Changes made after the export disappear on import.
    sc.ok(
        Some(&admin),
        "students.create",
        json!({ "classId": school.class_id, "firstName": "Late", "lastName": "Comer" }),
    );
    let imported = sc.ok(
        Some(&admin),
        "backup.import",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(imported["bundleFormatDetected"], "schoold-bundle-v1");

    // Sessions survive because tokens are not stored in the database.
    let listed = sc.ok(Some(&admin), "students.list", json!({}));
    let students = listed["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["sowaId"], "SOWA/0001");
}

#[test]
fn import_rejects_missing_and_foreign_files() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let work = tempfile::tempdir().expect("work dir");

    let missing = out_path(work.path(), "nope.zip");
    assert_eq!(
        sc.fail(Some(&admin), "backup.import", json!({ "inPath": missing.to_string_lossy() })),
        "not_found"
    );

    let junk = out_path(work.path(), "junk.bin");
    std::fs::write(&junk, b"definitely not a database").expect("write junk");
    assert_eq!(
        sc.fail(Some(&admin), "backup.import", json!({ "inPath": junk.to_string_lossy() })),
        "io_failed"
    );

    // The live database is untouched after a failed import.
    sc.ok(Some(&admin), "branches.create", json!({ "name": "Still Works" }));
}

#[test]
fn backups_are_admin_only() {
    let mut sc = Sidecar::spawn();
    let admin = sc.admin();
    let school = seed_school(&mut sc, &admin, &[]);
    sc.ok(
        Some(&admin),
        "users.create",
        json!({
            "username": "deputy",
            "password": "deputy-pass",
            "role": "sub_admin",
            "branchId": school.branch_id,
        }),
    );
    let deputy = sc.login("deputy", "deputy-pass");
    assert_eq!(
        sc.fail(Some(&deputy), "backup.export", json!({ "outPath": "/tmp/x.zip" })),
        "forbidden"
    );
}
