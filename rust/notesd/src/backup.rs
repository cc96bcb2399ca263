use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::{now_ts, DB_FILE};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/teachingnotes.sqlite3";
const UPLOADS_DIR: &str = "uploads";
pub const BUNDLE_FORMAT: &str = "teachingnotes-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub exported_at: Option<String>,
}

/// Forwards writes and hashes everything that passes through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn export_workspace_bundle(
    conn: &Connection,
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    // VACUUM INTO gives a consistent copy even with a live WAL.
    let snapshot = std::env::temp_dir().join(format!("notesd-snapshot-{}.sqlite3", uuid::Uuid::new_v4()));
    conn.execute("VACUUM INTO ?", [snapshot.to_string_lossy().as_ref()])
        .context("failed to snapshot database")?;
    let result = write_bundle(&snapshot, workspace_path, out_path);
    if let Err(e) = std::fs::remove_file(&snapshot) {
        log::warn!("could not remove snapshot {}: {}", snapshot.display(), e);
    }
    result
}

fn write_bundle(
    snapshot: &Path,
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = vec![(DB_ENTRY.to_string(), snapshot.to_path_buf())];
    let uploads = workspace_path.join(UPLOADS_DIR);
    if uploads.is_dir() {
        collect_files(&uploads, UPLOADS_DIR, &mut entries)?;
    }

    let mut checksums = BTreeMap::new();
    let mut total_bytes = 0u64;
    for (name, path) in &entries {
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        let mut src = File::open(path)
            .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
        let mut hashing = HashingWriter::new(&mut zip);
        std::io::copy(&mut src, &mut hashing)
            .with_context(|| format!("failed to write entry {}", name))?;
        let (_, digest, written) = hashing.finish();
        total_bytes += written;
        checksums.insert(name.clone(), digest);
    }

    // Written last so it can carry every entry's digest.
    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": now_ts(),
        "entries": checksums,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.finish().context("failed to finalize zip bundle")?;
    log::info!(
        "exported {} entries ({} bytes) to {}",
        entries.len(),
        total_bytes,
        out_path.display()
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: entries.len() + 1,
        total_bytes,
    })
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, PathBuf)>) -> anyhow::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.to_string_lossy()))?
        .collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());
    for ent in children {
        let path = ent.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let entry_name = format!("{}/{}", prefix, name);
        if path.is_dir() {
            collect_files(&path, &entry_name, out)?;
        } else if path.is_file() {
            out.push((entry_name, path));
        }
    }
    Ok(())
}

struct OpenedBundle {
    archive: ZipArchive<File>,
    entries: serde_json::Map<String, serde_json::Value>,
    exported_at: Option<String>,
}

fn open_bundle(in_path: &Path) -> anyhow::Result<OpenedBundle> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
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
    let Some(entries) = manifest.get("entries").and_then(|v| v.as_object()).cloned() else {
        return Err(anyhow!("manifest.json has no entries"));
    };
    if !entries.contains_key(DB_ENTRY) {
        return Err(anyhow!("bundle missing {}", DB_ENTRY));
    }
    Ok(OpenedBundle {
        archive,
        entries,
        exported_at: manifest
            .get("exportedAt")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn entry_digest<'a>(name: &str, digest: &'a serde_json::Value) -> anyhow::Result<&'a str> {
    if name != DB_ENTRY && !name.starts_with("uploads/") {
        return Err(anyhow!("unexpected bundle entry: {}", name));
    }
    digest
        .as_str()
        .ok_or_else(|| anyhow!("manifest checksum for {} is not a string", name))
}

/// Reads every entry of a bundle and checks it against the manifest without
/// writing anything. Lets the caller refuse a bad bundle while the current
/// workspace is still open.
pub fn verify_workspace_bundle(in_path: &Path) -> anyhow::Result<usize> {
    let OpenedBundle {
        mut archive,
        entries,
        ..
    } = open_bundle(in_path)?;
    for (name, digest) in &entries {
        let digest = entry_digest(name, digest)?;
        let mut entry = archive
            .by_name(name)
            .with_context(|| format!("bundle missing {}", name))?;
        if entry.enclosed_name().is_none() {
            return Err(anyhow!("unsafe entry path: {}", name));
        }
        let mut hashing = HashingWriter::new(std::io::sink());
        std::io::copy(&mut entry, &mut hashing)
            .with_context(|| format!("failed to read {}", name))?;
        let (_, actual, _) = hashing.finish();
        if actual != digest {
            return Err(anyhow!("checksum mismatch for {}", name));
        }
    }
    Ok(entries.len())
}

/// Restores a bundle into `workspace_path`. Every entry is extracted to a
/// staging directory and checked against the manifest before the current
/// database or uploads are touched. The caller must have closed its
/// connection to the workspace.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let OpenedBundle {
        mut archive,
        entries,
        exported_at,
    } = open_bundle(in_path)?;
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;

    let staging = workspace_path.join(format!(".importing-{}", uuid::Uuid::new_v4()));
    let staged = stage_entries(&mut archive, &entries, &staging);
    if let Err(e) = staged {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let swapped = swap_in(&staging, workspace_path);
    let _ = std::fs::remove_dir_all(&staging);
    swapped?;

    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: entries.len(),
        exported_at,
    })
}

fn stage_entries(
    archive: &mut ZipArchive<File>,
    expected: &serde_json::Map<String, serde_json::Value>,
    staging: &Path,
) -> anyhow::Result<()> {
    for (name, digest) in expected {
        let digest = entry_digest(name, digest)?;
        let mut entry = archive
            .by_name(name)
            .with_context(|| format!("bundle missing {}", name))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(anyhow!("unsafe entry path: {}", name));
        };
        let dst = staging.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.to_string_lossy()))?;
        }
        let out = File::create(&dst)
            .with_context(|| format!("failed to create {}", dst.to_string_lossy()))?;
        let mut hashing = HashingWriter::new(out);
        std::io::copy(&mut entry, &mut hashing)
            .with_context(|| format!("failed to extract {}", name))?;
        let (mut out, actual, _) = hashing.finish();
        out.flush()?;
        if actual != digest {
            return Err(anyhow!("checksum mismatch for {}", name));
        }
    }
    Ok(())
}

fn swap_in(staging: &Path, workspace_path: &Path) -> anyhow::Result<()> {
    let dst = workspace_path.join(DB_FILE);
    for suffix in ["", "-wal", "-shm"] {
        let p = PathBuf::from(format!("{}{}", dst.to_string_lossy(), suffix));
        if p.exists() {
            std::fs::remove_file(&p)
                .with_context(|| format!("failed to remove {}", p.to_string_lossy()))?;
        }
    }
    std::fs::rename(staging.join(DB_ENTRY), &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    let uploads = workspace_path.join(UPLOADS_DIR);
    if uploads.exists() {
        std::fs::remove_dir_all(&uploads)
            .with_context(|| format!("failed to clear {}", uploads.to_string_lossy()))?;
    }
    let staged_uploads = staging.join(UPLOADS_DIR);
    if staged_uploads.is_dir() {
        std::fs::rename(&staged_uploads, &uploads)
            .with_context(|| format!("failed to move uploads into {}", uploads.to_string_lossy()))?;
    }
    Ok(())
}
