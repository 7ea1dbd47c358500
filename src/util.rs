use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::error::{KbError, Result};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalize a caller-supplied relative path to forward slashes and
/// reject anything that escapes the KB directory.
pub fn normalize_rel_path(rel: &str) -> Result<String> {
    let rel = rel.replace('\\', "/");
    let rel = rel.trim().trim_start_matches('/');
    if rel.is_empty() || rel == "." {
        return Ok(String::new());
    }
    let parts: Vec<&str> = rel
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.iter().any(|p| *p == "..") {
        return Err(KbError::InvalidInput(format!(
            "relative path escapes the knowledge base: {rel}"
        )));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_stable() {
        assert_eq!(sha256_text("abc"), sha256_text("abc"));
        assert_ne!(sha256_text("abc"), sha256_text("abd"));
        assert_eq!(sha256_text("abc").len(), 64);
    }

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path("a/b.md").unwrap(), "a/b.md");
        assert_eq!(normalize_rel_path("/a//b.md").unwrap(), "a/b.md");
        assert_eq!(normalize_rel_path("\\a\\b.md").unwrap(), "a/b.md");
        assert_eq!(normalize_rel_path("./a/./b.md").unwrap(), "a/b.md");
        assert_eq!(normalize_rel_path(".").unwrap(), "");
        assert!(normalize_rel_path("../etc/passwd").is_err());
        assert!(normalize_rel_path("a/../../b").is_err());
    }
}
