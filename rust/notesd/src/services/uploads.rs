//! Observation attachments on disk.
//!
//! Files live under `<workspace>/uploads/multimedia/<YYYY>/<MM>/` with a
//! random name; the database keeps the path relative to the workspace so a
//! workspace can be moved or restored elsewhere.

use chrono::Datelike;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

use crate::error::{ServiceError, ServiceResult};
use crate::store::media::{self, Media, NewMedia};
use crate::store::MediaKind;

pub const UPLOAD_ROOT: &str = "uploads/multimedia";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "webm"];

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl UploadPolicy {
    pub fn check_batch(&self, count: usize) -> ServiceResult<()> {
        if count == 0 {
            return Err(ServiceError::invalid("no files to upload"));
        }
        if count > self.max_files {
            return Err(ServiceError::invalid(format!(
                "at most {} files per upload",
                self.max_files
            )));
        }
        Ok(())
    }

    pub fn check_size(&self, size: u64) -> ServiceResult<()> {
        if size > self.max_bytes {
            return Err(ServiceError::PayloadTooLarge {
                max_mb: self.max_bytes / (1024 * 1024),
            });
        }
        if size == 0 {
            return Err(ServiceError::invalid("file is empty"));
        }
        Ok(())
    }
}

/// Lower-cased extension and the media kind it maps to.
pub fn classify(file_name: &str) -> ServiceResult<(String, MediaKind)> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Ok((ext, MediaKind::Image))
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Ok((ext, MediaKind::Video))
    } else {
        Err(ServiceError::UnsupportedMedia(file_name.to_string()))
    }
}

/// Keeps the last path component and replaces anything outside
/// `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Writes the file and records it. If the row cannot be inserted the file
/// is removed again.
pub fn save_upload(
    conn: &Connection,
    workspace: &Path,
    policy: &UploadPolicy,
    observation_id: &str,
    uploaded_by: &str,
    original_name: &str,
    content: &[u8],
) -> ServiceResult<Media> {
    let (ext, kind) = classify(original_name)?;
    policy.check_size(content.len() as u64)?;

    let now = chrono::Utc::now();
    let rel_dir = format!("{}/{:04}/{:02}", UPLOAD_ROOT, now.year(), now.month());
    let rel_path = format!("{}/{}.{}", rel_dir, uuid::Uuid::new_v4(), ext);
    let abs_dir = workspace.join(&rel_dir);
    std::fs::create_dir_all(&abs_dir)?;
    let abs_path = workspace.join(&rel_path);
    std::fs::write(&abs_path, content)?;

    let mut hasher = Sha256::new();
    hasher.update(content);
    let sha256 = format!("{:x}", hasher.finalize());
    let file_name = sanitize_filename(original_name);

    let inserted = media::insert(
        conn,
        &NewMedia {
            observation_id,
            file_name: &file_name,
            kind,
            stored_path: &rel_path,
            size_bytes: content.len() as i64,
            sha256: &sha256,
            uploaded_by: Some(uploaded_by),
        },
    );
    match inserted {
        Ok(m) => {
            log::info!(
                "stored {} ({}) for observation {}",
                m.stored_path,
                format_size(content.len() as u64),
                observation_id
            );
            Ok(m)
        }
        Err(e) => {
            remove_stored_file(workspace, &rel_path);
            Err(e)
        }
    }
}

/// Absolute path of a stored file; refuses paths that would leave the
/// workspace.
pub fn resolve_stored_path(workspace: &Path, rel_path: &str) -> ServiceResult<PathBuf> {
    let rel = Path::new(rel_path);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ServiceError::invalid(format!(
            "stored path outside workspace: {}",
            rel_path
        )));
    }
    Ok(workspace.join(rel))
}

/// Best-effort; a missing file is not an error.
pub fn remove_stored_file(workspace: &Path, rel_path: &str) {
    let Ok(abs) = resolve_stored_path(workspace, rel_path) else {
        log::warn!("refusing to remove {}", rel_path);
        return;
    };
    match std::fs::remove_file(&abs) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("could not remove {}: {}", abs.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn temp_workspace(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\fotos\\día de campo.JPG"), "d_a_de_campo.JPG");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("///"), "file");
    }

    #[test]
    fn extensions_decide_kind() {
        assert_eq!(classify("a.PNG").expect("png").1, MediaKind::Image);
        assert_eq!(classify("clip.webm").expect("webm").1, MediaKind::Video);
        assert!(matches!(
            classify("notes.pdf"),
            Err(ServiceError::UnsupportedMedia(_))
        ));
        assert!(classify("noext").is_err());
    }

    #[test]
    fn failed_insert_removes_written_file() {
        let ws = temp_workspace("notesd-upload");
        let conn = open_in_memory().expect("open");
        let policy = UploadPolicy {
            max_bytes: 1024,
            max_files: 2,
        };
        // No such observation: the foreign key rejects the row.
        let e = save_upload(&conn, &ws, &policy, "missing", "u1", "a.png", b"png-bytes")
            .unwrap_err();
        assert!(matches!(e, ServiceError::Db(_)));

        let leftovers = walk_files(&ws.join(UPLOAD_ROOT));
        assert!(leftovers.is_empty(), "{leftovers:?}");
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[test]
    fn oversize_is_rejected_before_writing() {
        let ws = temp_workspace("notesd-upload");
        let conn = open_in_memory().expect("open");
        let policy = UploadPolicy {
            max_bytes: 4,
            max_files: 1,
        };
        let e = save_upload(&conn, &ws, &policy, "o1", "u1", "a.png", b"too large")
            .unwrap_err();
        assert!(matches!(e, ServiceError::PayloadTooLarge { .. }));
        assert!(!ws.join(UPLOAD_ROOT).exists());
        let _ = std::fs::remove_dir_all(&ws);
    }

    #[test]
    fn stored_paths_cannot_escape() {
        let ws = Path::new("/tmp/ws");
        assert!(resolve_stored_path(ws, "uploads/multimedia/2024/01/a.png").is_ok());
        assert!(resolve_stored_path(ws, "../outside.png").is_err());
        assert!(resolve_stored_path(ws, "/etc/passwd").is_err());
    }

    fn walk_files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return out;
        };
        for ent in entries.flatten() {
            let p = ent.path();
            if p.is_dir() {
                out.extend(walk_files(&p));
            } else {
                out.push(p);
            }
        }
        out
    }
}
