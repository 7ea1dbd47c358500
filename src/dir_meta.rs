//! Per-directory descriptive metadata (`meta.json`).
//!
//! Every directory in the knowledge tree carries a `meta.json` with a
//! title, summary, tags, keywords, and a free-form directory type.
//! Auto-filing collaborators write these records (directly or via
//! [`merge_meta`]); the engine only ensures they exist, reads them, and
//! caches them in the store for structural recall. Indexing and
//! retrieval never depend on which strategy produced the contents.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::util::now_iso;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirMeta {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub dir_type: String,
    #[serde(default)]
    pub updated_at: String,
}

fn default_schema_version() -> u32 {
    1
}

impl DirMeta {
    fn new_for(dir_name: &str) -> Self {
        Self {
            schema_version: 1,
            title: dir_name.to_string(),
            summary: String::new(),
            tags: Vec::new(),
            keywords: Vec::new(),
            dir_type: String::new(),
            updated_at: now_iso(),
        }
    }
}

/// Create a default `meta.json` in the directory if absent; returns the
/// metadata file path either way.
pub fn ensure_dir_meta(dir: &Path, meta_filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let meta_path = dir.join(meta_filename);
    if meta_path.exists() {
        return Ok(meta_path);
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    write_json_atomic(&meta_path, &DirMeta::new_for(&name))?;
    Ok(meta_path)
}

/// Read a directory's metadata, creating the default record first when
/// missing. Unparseable files fall back to the default (the file is
/// user-editable).
pub fn read_dir_meta(dir: &Path, meta_filename: &str) -> Result<DirMeta> {
    let meta_path = ensure_dir_meta(dir, meta_filename)?;
    let content = std::fs::read_to_string(&meta_path)?;
    Ok(serde_json::from_str(&content).unwrap_or_else(|_| {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        DirMeta::new_for(&name)
    }))
}

/// Fill-only merge used by metadata-producing collaborators: scalar
/// fields are taken from the patch only when empty in the existing
/// record, list fields are unioned.
pub fn merge_meta(existing: &DirMeta, patch: &DirMeta) -> DirMeta {
    let mut out = existing.clone();
    if out.title.is_empty() && !patch.title.is_empty() {
        out.title = patch.title.clone();
    }
    if out.summary.is_empty() && !patch.summary.is_empty() {
        out.summary = patch.summary.clone();
    }
    if out.dir_type.is_empty() && !patch.dir_type.is_empty() {
        out.dir_type = patch.dir_type.clone();
    }
    for tag in &patch.tags {
        if !out.tags.iter().any(|t| t == tag) {
            out.tags.push(tag.clone());
        }
    }
    for keyword in &patch.keywords {
        if !out.keywords.iter().any(|k| k == keyword) {
            out.keywords.push(keyword.clone());
        }
    }
    out.updated_at = now_iso();
    out
}

/// Persist a directory's metadata record (tmp file + rename).
pub fn write_dir_meta(dir: &Path, meta_filename: &str, meta: &DirMeta) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_json_atomic(&dir.join(meta_filename), meta)
}

fn write_json_atomic(path: &Path, meta: &DirMeta) -> Result<()> {
    let json = serde_json::to_string_pretty(meta).unwrap_or_else(|_| "{}".to_string());
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, format!("{json}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_default() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("notes");
        let meta_path = ensure_dir_meta(&dir, "meta.json").unwrap();
        assert!(meta_path.exists());
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.title, "notes");
        assert_eq!(meta.schema_version, 1);
    }

    #[test]
    fn test_ensure_keeps_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("notes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("meta.json"),
            r#"{"title":"Custom","tags":["a"]}"#,
        )
        .unwrap();
        ensure_dir_meta(&dir, "meta.json").unwrap();
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.title, "Custom");
        assert_eq!(meta.tags, vec!["a"]);
    }

    #[test]
    fn test_unparseable_meta_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("notes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("meta.json"), "not json").unwrap();
        let meta = read_dir_meta(&dir, "meta.json").unwrap();
        assert_eq!(meta.title, "notes");
    }

    #[test]
    fn test_merge_fills_only_empty_fields() {
        let mut existing = DirMeta::new_for("notes");
        existing.summary = "kept".to_string();
        existing.tags = vec!["x".to_string()];

        let mut patch = DirMeta::new_for("ignored-title");
        patch.summary = "discarded".to_string();
        patch.dir_type = "project".to_string();
        patch.tags = vec!["x".to_string(), "y".to_string()];

        let merged = merge_meta(&existing, &patch);
        assert_eq!(merged.title, "notes");
        assert_eq!(merged.summary, "kept");
        assert_eq!(merged.dir_type, "project");
        assert_eq!(merged.tags, vec!["x", "y"]);
    }
}
