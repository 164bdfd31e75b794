//! Zip bundles holding a manifest and a consistent copy of the database.

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/school.sqlite3";
pub const BUNDLE_FORMAT: &str = "schoold-bundle-v1";
pub const PLAIN_SQLITE_FORMAT: &str = "sqlite3";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn table_count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap_or(0)
}

/// Snapshots the live database with `VACUUM INTO` and writes the bundle.
pub fn export_bundle(conn: &Connection, data_dir: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let snapshot = data_dir.join(format!("{}.export", db::DB_FILE));
    if snapshot.exists() {
        std::fs::remove_file(&snapshot)
            .with_context(|| format!("failed to remove stale snapshot {}", snapshot.display()))?;
    }
    conn.execute("VACUUM INTO ?", [snapshot.to_string_lossy().as_ref()])
        .context("failed to snapshot database")?;

    let result = write_bundle(conn, &snapshot, out_path);
    let _ = std::fs::remove_file(&snapshot);
    result
}

fn write_bundle(conn: &Connection, snapshot: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": db::now_ts(),
        "counts": {
            "branches": table_count(conn, "branches"),
            "classes": table_count(conn, "classes"),
            "students": table_count(conn, "students"),
            "scores": table_count(conn, "scores"),
            "payments": table_count(conn, "payments"),
        },
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(snapshot)
        .with_context(|| format!("failed to open snapshot {}", snapshot.display()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let out = zip.finish().context("failed to finalize zip bundle")?;
    let bytes = out.metadata().map(|m| m.len()).unwrap_or(0);
    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 2,
        bytes,
    })
}

/// Replaces the database file in `data_dir`. The caller must have closed
/// its connection to that file first.
pub fn import_bundle(in_path: &Path, data_dir: &Path) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let dst = db::db_path(data_dir);
    let tmp_dst = data_dir.join(format!("{}.importing", db::DB_FILE));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let detected = match sniff(in_path)? {
        Sniffed::Zip => {
            extract_bundle(in_path, &tmp_dst)?;
            BUNDLE_FORMAT
        }
        Sniffed::Sqlite => {
            std::fs::copy(in_path, &tmp_dst).with_context(|| {
                format!("failed to copy sqlite backup from {}", in_path.display())
            })?;
            PLAIN_SQLITE_FORMAT
        }
        Sniffed::Other => {
            return Err(anyhow!(
                "{} is neither a backup bundle nor a sqlite database",
                in_path.display()
            ))
        }
    };

    if let Err(e) = check_school_database(&tmp_dst) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(e);
    }

    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&tmp_dst, &dst)
        .with_context(|| format!("failed to move imported database to {}", dst.display()))?;

    Ok(ImportSummary {
        bundle_format_detected: detected.to_string(),
    })
}

fn extract_bundle(in_path: &Path, tmp_dst: &Path) -> anyhow::Result<()> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut db_out = File::create(tmp_dst)
        .with_context(|| format!("failed to create temp database {}", tmp_dst.display()))?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle missing {DB_ENTRY}"))?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out.flush().context("failed to flush extracted database")?;
    Ok(())
}

/// The imported file must at least carry the core tables.
fn check_school_database(path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open imported database {}", path.display()))?;
    for table in ["branches", "classes", "students", "users"] {
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                [table],
                |r| r.get(0),
            )
            .context("imported file is not a readable sqlite database")?;
        if found == 0 {
            return Err(anyhow!("imported database has no {table} table"));
        }
    }
    Ok(())
}

enum Sniffed {
    Zip,
    Sqlite,
    Other,
}

fn sniff(path: &Path) -> anyhow::Result<Sniffed> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 16];
    let mut read = 0;
    while read < sig.len() {
        let n = f.read(&mut sig[read..]).context("failed to read file signature")?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read >= 4 && sig[..4] == ZIP_MAGIC {
        return Ok(Sniffed::Zip);
    }
    if read == 16 && &sig == SQLITE_MAGIC {
        return Ok(Sniffed::Sqlite);
    }
    Ok(Sniffed::Other)
}
