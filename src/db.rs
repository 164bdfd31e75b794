use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::auth;

pub const DB_FILE: &str = "school.sqlite3";

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn open_db(data_dir: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(data_dir)?;
    let conn = Connection::open(db_path(data_dir))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Schema for a fresh in-memory database, used by tests and by `backup.import`
/// while the real file is being swapped.
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            address TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            UNIQUE(branch_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_branch ON classes(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            sowa_id TEXT NOT NULL UNIQUE,
            sowa_seq INTEGER NOT NULL,
            branch_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            gender TEXT,
            date_of_birth TEXT,
            guardian_name TEXT,
            guardian_phone TEXT,
            address TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    // Columns added after the first release; older databases get them here.
    ensure_column(conn, "students", "email", "TEXT")?;
    ensure_column(conn, "students", "updated_at", "TEXT")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_branch ON students(branch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            branch_id TEXT,
            student_id TEXT UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            session TEXT NOT NULL,
            ca1 REAL,
            ca2 REAL,
            exam REAL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, subject_id, term, session)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_class_term ON scores(class_id, term, session)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id, session)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_publications(
            class_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            session TEXT NOT NULL,
            published INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(class_id, term, session),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_remarks(
            student_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            session TEXT NOT NULL,
            teacher_comment TEXT,
            principal_comment TEXT,
            PRIMARY KEY(student_id, term, session),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            class_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            session TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_term ON attendance_records(class_id, term, session)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            class_id TEXT,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            term INTEGER NOT NULL,
            session TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_column(conn, "fees", "due_date", "TEXT")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fees_branch_term ON fees(branch_id, term, session)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            fee_id TEXT NOT NULL,
            amount REAL NOT NULL,
            method TEXT NOT NULL,
            reference TEXT,
            paid_at TEXT NOT NULL,
            recorded_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(fee_id) REFERENCES fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_fee ON payments(fee_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS news(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            audience TEXT NOT NULL,
            target_id TEXT,
            branch_id TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_reads(
            notification_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            read_at TEXT NOT NULL,
            PRIMARY KEY(notification_id, student_id),
            FOREIGN KEY(notification_id) REFERENCES notifications(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contact_messages(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            subject TEXT,
            message TEXT NOT NULL,
            handled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // A corrupt value behaves like an unset one; callers fall back to defaults.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Creates the first admin account when the users table holds no admin.
/// Returns true when an account was created.
pub fn ensure_bootstrap_admin(
    conn: &Connection,
    username: &str,
    password: &str,
) -> anyhow::Result<bool> {
    let admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?;
    if admins > 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, branch_id, student_id, created_at)
         VALUES(?, ?, ?, 'admin', NULL, NULL, ?)",
        (
            Uuid::new_v4().to_string(),
            username.trim(),
            auth::hash_password(password),
            now_ts(),
        ),
    )?;
    Ok(true)
}

pub fn next_sowa_seq(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sowa_seq), 0) + 1 FROM students",
        [],
        |r| r.get(0),
    )
}

pub fn format_sowa_id(prefix: &str, seq: i64) -> String {
    format!("{}/{:04}", prefix.trim().trim_end_matches('/'), seq)
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sowa_ids_are_zero_padded() {
        assert_eq!(format_sowa_id("SOWA", 1), "SOWA/0001");
        assert_eq!(format_sowa_id("SOWA/", 42), "SOWA/0042");
        assert_eq!(format_sowa_id("SOWA", 12345), "SOWA/12345");
    }

    #[test]
    fn bootstrap_admin_is_created_once() {
        let conn = open_in_memory().expect("db");
        assert!(ensure_bootstrap_admin(&conn, "admin", "secret-pass").expect("first"));
        assert!(!ensure_bootstrap_admin(&conn, "admin", "secret-pass").expect("second"));
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 1);
    }

    #[test]
    fn reopening_a_database_keeps_the_schema_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        drop(open_db(dir.path()).expect("first open"));
        let conn = open_db(dir.path()).expect("second open");
        assert!(table_has_column(&conn, "students", "email").expect("pragma"));
        assert!(table_has_column(&conn, "fees", "due_date").expect("pragma"));
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let conn = open_in_memory().expect("db");
        assert!(settings_get_json(&conn, "school").expect("get").is_none());
        settings_set_json(&conn, "school", &serde_json::json!({ "name": "A" })).expect("set");
        settings_set_json(&conn, "school", &serde_json::json!({ "name": "B" })).expect("set");
        let v = settings_get_json(&conn, "school").expect("get").expect("value");
        assert_eq!(v["name"], "B");
    }
}
