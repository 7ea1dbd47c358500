//! KB root scaffolding for `kb init`.

use serde::Serialize;
use std::path::Path;

use crate::config::{self, Config};
use crate::dir_meta;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct InitSummary {
    pub root: String,
    pub created: Vec<String>,
}

/// Create the KB root layout: document tree, index directory, default
/// `kb.toml`, and a root `meta.json`. Existing config is kept unless
/// `force` is set.
pub fn init_kb(root: &Path, force: bool) -> Result<InitSummary> {
    let mut created = Vec::new();
    std::fs::create_dir_all(root)?;

    let defaults = Config::default();
    let paths = config::resolve_paths(root, &defaults);

    if !paths.kb_dir.exists() {
        std::fs::create_dir_all(&paths.kb_dir)?;
        created.push(defaults.paths.kb.clone());
    }
    if !paths.index_dir.exists() {
        std::fs::create_dir_all(&paths.index_dir)?;
        created.push(defaults.paths.index.clone());
    }
    if !paths.config_path.exists() || force {
        std::fs::write(&paths.config_path, config::default_config_toml())?;
        created.push(config::CONFIG_FILENAME.to_string());
    }

    let meta_path = paths.kb_dir.join(config::META_FILENAME);
    if !meta_path.exists() {
        dir_meta::ensure_dir_meta(&paths.kb_dir, config::META_FILENAME)?;
        created.push(format!("{}/{}", defaults.paths.kb, config::META_FILENAME));
    }

    Ok(InitSummary {
        root: root.display().to_string(),
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_scaffolds_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let out = init_kb(tmp.path(), false).unwrap();
        assert!(out.created.contains(&"kb".to_string()));
        assert!(tmp.path().join("kb.toml").exists());
        assert!(tmp.path().join("kb/meta.json").exists());

        let again = init_kb(tmp.path(), false).unwrap();
        assert!(again.created.is_empty());
    }

    #[test]
    fn test_force_rewrites_config() {
        let tmp = tempfile::tempdir().unwrap();
        init_kb(tmp.path(), false).unwrap();
        std::fs::write(tmp.path().join("kb.toml"), "[chunking]\nmax_chars = 9\n").unwrap();
        init_kb(tmp.path(), true).unwrap();
        let content = std::fs::read_to_string(tmp.path().join("kb.toml")).unwrap();
        assert!(content.contains("max_chars = 1200"));
    }
}
