use crate::db::{now_ts, DB_FILE_NAME};
use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/schoold.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "schoold-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub exported_at: Option<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Writes `manifest.json` plus the raw database file. The caller must not hold
/// an open write transaction on the workspace.
pub fn export_workspace_bundle(workspace_path: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!("workspace database not found: {}", db_path.display()));
    }
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.display()))?;
    let digest = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": now_ts(),
        "dbSha256": digest,
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
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        db_sha256: digest,
        db_bytes: db_bytes.len(),
    })
}

/// Verifies the bundle checksum, then swaps the workspace database in place.
/// Nothing in the workspace changes when verification fails.
pub fn import_workspace_bundle(in_path: &Path, workspace_path: &Path) -> anyhow::Result<ImportSummary> {
    if !is_zip_file(in_path)? {
        return Err(anyhow!("not a workspace bundle: {}", in_path.display()));
    }
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
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json missing dbSha256"))?
        .to_ascii_lowercase();

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/schoold.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != expected {
        return Err(anyhow!(
            "database checksum mismatch: manifest {}, bundle {}",
            expected,
            actual
        ));
    }

    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    {
        let mut db_out = File::create(&tmp_dst)
            .with_context(|| format!("failed to create temp database {}", tmp_dst.display()))?;
        db_out
            .write_all(&db_bytes)
            .context("failed to write extracted database")?;
        db_out
            .flush()
            .context("failed to flush extracted database")?;
    }
    std::fs::rename(&tmp_dst, &dst)
        .with_context(|| format!("failed to move extracted database to {}", dst.display()))?;

    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        db_sha256: actual,
        exported_at: manifest
            .get("exportedAt")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn bundle_roundtrip_preserves_bytes() {
        let src = temp_dir("schoold-backup-src");
        let dst = temp_dir("schoold-backup-dst");
        std::fs::write(src.join(DB_FILE_NAME), b"not really sqlite").expect("seed db");
        let bundle = src.join("out").join("ws.zip");

        let exported = export_workspace_bundle(&src, &bundle).expect("export");
        assert_eq!(exported.bundle_format, BUNDLE_FORMAT_V1);
        assert_eq!(exported.db_sha256.len(), 64);

        let imported = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(imported.db_sha256, exported.db_sha256);
        assert!(imported.exported_at.is_some());
        assert_eq!(
            std::fs::read(dst.join(DB_FILE_NAME)).expect("read"),
            b"not really sqlite"
        );

        let _ = std::fs::remove_dir_all(src);
        let _ = std::fs::remove_dir_all(dst);
    }

    #[test]
    fn tampered_bundle_is_rejected_without_touching_workspace() {
        let dir = temp_dir("schoold-backup-tamper");
        let bundle = dir.join("bad.zip");
        {
            let mut zip = ZipWriter::new(File::create(&bundle).expect("create"));
            let opts = FileOptions::default();
            zip.start_file(MANIFEST_ENTRY, opts).expect("manifest");
            zip.write_all(
                json!({ "format": BUNDLE_FORMAT_V1, "dbSha256": "00" })
                    .to_string()
                    .as_bytes(),
            )
            .expect("write manifest");
            zip.start_file(DB_ENTRY, opts).expect("db");
            zip.write_all(b"payload").expect("write db");
            zip.finish().expect("finish");
        }
        let ws = dir.join("ws");
        std::fs::create_dir_all(&ws).expect("ws");
        std::fs::write(ws.join(DB_FILE_NAME), b"original").expect("seed");

        let e = import_workspace_bundle(&bundle, &ws).expect_err("checksum must fail");
        assert!(e.to_string().contains("checksum"));
        assert_eq!(std::fs::read(ws.join(DB_FILE_NAME)).expect("read"), b"original");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn plain_files_are_not_bundles() {
        let dir = temp_dir("schoold-backup-plain");
        let f = dir.join("x.txt");
        std::fs::write(&f, b"hello").expect("write");
        assert!(import_workspace_bundle(&f, &dir).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
