use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{KbError, Result};

pub const CONFIG_FILENAME: &str = "kb.toml";
pub const META_FILENAME: &str = "meta.json";
pub const INDEX_DB_FILENAME: &str = "index.sqlite";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_kb_dir")]
    pub kb: String,
    #[serde(default = "default_index_dir")]
    pub index: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            kb: default_kb_dir(),
            index: default_index_dir(),
        }
    }
}

fn default_kb_dir() -> String {
    "kb".to_string()
}
fn default_index_dir() -> String {
    "kb_index".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1200
}
fn default_overlap_chars() -> usize {
    150
}
fn default_min_chars() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the semantic score in hybrid fusion; the lexical side
    /// gets `1 - hybrid_alpha`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    /// Per-modality candidate pool floor; the effective pool is
    /// `max(candidate_k, top_k * 5)`.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    /// Directory-metadata bias added to fused scores; 0 disables
    /// structural recall.
    #[serde(default = "default_structural_boost")]
    pub structural_boost: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            structural_boost: default_structural_boost(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    50
}
fn default_structural_boost() -> f64 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct CapabilityConfig {
    /// OpenAI-compatible endpoint base URL; empty means disabled.
    #[serde(default)]
    pub base_url: String,
    /// Environment variable holding the API key, never the key itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub model_embed: String,
    #[serde(default)]
    pub model_chat: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Extra headers merged into every request (gateway auth etc.).
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: default_api_key_env(),
            model_embed: String::new(),
            model_chat: String::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            extra_headers: BTreeMap::new(),
        }
    }
}

fn default_api_key_env() -> String {
    "MDKB_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}

impl CapabilityConfig {
    pub fn embed_enabled(&self) -> bool {
        !self.base_url.is_empty() && !self.model_embed.is_empty()
    }

    pub fn chat_enabled(&self) -> bool {
        !self.base_url.is_empty() && !self.model_chat.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

/// Resolved locations inside a KB root.
#[derive(Debug, Clone)]
pub struct KbPaths {
    pub root: PathBuf,
    pub kb_dir: PathBuf,
    pub index_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

pub fn resolve_paths(root: &Path, config: &Config) -> KbPaths {
    KbPaths {
        root: root.to_path_buf(),
        kb_dir: root.join(&config.paths.kb),
        index_dir: root.join(&config.paths.index),
        db_path: root.join(&config.paths.index).join(INDEX_DB_FILENAME),
        config_path: root.join(CONFIG_FILENAME),
    }
}

/// Load `kb.toml` from the KB root, falling back to defaults when the
/// file is absent.
pub fn load_config(root: &Path) -> Result<Config> {
    let config_path = root.join(CONFIG_FILENAME);
    let config = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|e| {
            KbError::InvalidInput(format!("failed to parse {}: {e}", config_path.display()))
        })?
    } else {
        Config::default()
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.max_chars == 0 {
        return Err(KbError::InvalidInput(
            "chunking.max_chars must be > 0".to_string(),
        ));
    }
    if chunking.min_chars > chunking.max_chars {
        return Err(KbError::InvalidInput(
            "chunking.min_chars must not exceed chunking.max_chars".to_string(),
        ));
    }
    if chunking.overlap_chars >= chunking.max_chars {
        return Err(KbError::InvalidInput(
            "chunking.overlap_chars must be smaller than chunking.max_chars".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        return Err(KbError::InvalidInput(
            "retrieval.hybrid_alpha must be in [0.0, 1.0]".to_string(),
        ));
    }
    if config.retrieval.structural_boost < 0.0 {
        return Err(KbError::InvalidInput(
            "retrieval.structural_boost must be >= 0".to_string(),
        ));
    }
    Ok(())
}

pub fn default_config_toml() -> String {
    r#"[paths]
kb = "kb"
index = "kb_index"

[chunking]
max_chars = 1200
overlap_chars = 150
min_chars = 20

[retrieval]
hybrid_alpha = 0.6
candidate_k = 50
structural_boost = 0.15

[capability]
base_url = ""
api_key_env = "MDKB_API_KEY"
model_embed = ""
model_chat = ""
timeout_secs = 60
max_retries = 2

[scan]
include_globs = ["**/*.md"]
exclude_globs = []
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.chunking.max_chars, 1200);
        assert_eq!(config.chunking.overlap_chars, 150);
        assert_eq!(config.paths.kb, "kb");
        assert!(!config.capability.embed_enabled());
    }

    #[test]
    fn test_default_config_toml_parses_to_defaults() {
        let parsed: Config = toml::from_str(&default_config_toml()).unwrap();
        assert_eq!(parsed.chunking.max_chars, 1200);
        assert_eq!(parsed.retrieval.hybrid_alpha, 0.6);
        assert_eq!(parsed.scan.include_globs, vec!["**/*.md".to_string()]);
    }

    #[test]
    fn test_partial_config_merges_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            "[chunking]\nmax_chars = 400\n",
        )
        .unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.chunking.max_chars, 400);
        assert_eq!(config.chunking.overlap_chars, 150);
        assert_eq!(config.retrieval.hybrid_alpha, 0.6);
    }

    #[test]
    fn test_validation_rejects_bad_alpha() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            "[retrieval]\nhybrid_alpha = 1.5\n",
        )
        .unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    #[test]
    fn test_validation_rejects_overlap_not_below_max() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            "[chunking]\nmax_chars = 100\noverlap_chars = 100\n",
        )
        .unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    #[test]
    fn test_capability_enable_requires_model_and_url() {
        let mut cap = CapabilityConfig::default();
        assert!(!cap.embed_enabled());
        cap.base_url = "http://localhost:8080".to_string();
        assert!(!cap.embed_enabled());
        cap.model_embed = "embed-model".to_string();
        assert!(cap.embed_enabled());
        assert!(!cap.chat_enabled());
    }
}
