//! Capability health checks for `kb doctor`.
//!
//! Exercises the configured embed/chat endpoints with a probe text and
//! reports per-check latency and errors, plus configuration hints.
//! Neither check touches the index.

use serde::Serialize;
use std::path::Path;
use std::time::Instant;

use crate::capability::{Capability, HttpCapability};
use crate::config;
use crate::error::Result;

const PROBE_TEXT: &str = "knowledge base connectivity check";

#[derive(Debug, Clone, Copy, Default)]
pub struct DoctorOptions {
    pub check_embed: bool,
    pub check_chat: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub ok: bool,
    pub elapsed_ms: u64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub base_url: String,
    pub model_embed: String,
    pub model_chat: String,
    pub api_key_env: String,
    pub api_key_present: bool,
    pub embed: Option<DoctorCheck>,
    pub chat: Option<DoctorCheck>,
    pub hints: Vec<String>,
}

pub async fn doctor(root: &Path, options: DoctorOptions) -> Result<DoctorReport> {
    let config = config::load_config(root)?;
    let capability = HttpCapability::new(&config.capability)?;
    Ok(doctor_with(&config.capability, options, &capability).await)
}

pub async fn doctor_with(
    capability_config: &config::CapabilityConfig,
    options: DoctorOptions,
    capability: &dyn Capability,
) -> DoctorReport {
    // Neither flag set means check everything.
    let (check_embed, check_chat) = if options.check_embed || options.check_chat {
        (options.check_embed, options.check_chat)
    } else {
        (true, true)
    };

    let api_key_present = std::env::var(&capability_config.api_key_env)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);

    let mut ok = true;

    let embed = if check_embed {
        let check = run_embed_check(capability).await;
        ok = ok && check.ok;
        Some(check)
    } else {
        None
    };

    let chat = if check_chat {
        let check = run_chat_check(capability).await;
        ok = ok && check.ok;
        Some(check)
    } else {
        None
    };

    let hints = build_hints(capability_config, check_embed, check_chat, api_key_present);

    DoctorReport {
        ok,
        base_url: capability_config.base_url.clone(),
        model_embed: capability_config.model_embed.clone(),
        model_chat: capability_config.model_chat.clone(),
        api_key_env: capability_config.api_key_env.clone(),
        api_key_present,
        embed,
        chat,
        hints,
    }
}

async fn run_embed_check(capability: &dyn Capability) -> DoctorCheck {
    let started = Instant::now();
    match capability.embed(&[PROBE_TEXT.to_string()]).await {
        Ok(vectors) => DoctorCheck {
            ok: true,
            elapsed_ms: started.elapsed().as_millis() as u64,
            detail: format!(
                "vectors={}, dims={}",
                vectors.len(),
                vectors.first().map(|v| v.len()).unwrap_or(0)
            ),
        },
        Err(e) => DoctorCheck {
            ok: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
            detail: e.to_string(),
        },
    }
}

async fn run_chat_check(capability: &dyn Capability) -> DoctorCheck {
    let started = Instant::now();
    match capability.chat(PROBE_TEXT).await {
        Ok(reply) => {
            let mut sample = reply.replace('\n', " ").trim().to_string();
            if sample.chars().count() > 60 {
                sample = sample.chars().take(60).collect::<String>() + "…";
            }
            DoctorCheck {
                ok: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
                detail: format!("length={}, sample={sample:?}", reply.len()),
            }
        }
        Err(e) => DoctorCheck {
            ok: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
            detail: e.to_string(),
        },
    }
}

fn build_hints(
    config: &config::CapabilityConfig,
    check_embed: bool,
    check_chat: bool,
    api_key_present: bool,
) -> Vec<String> {
    let mut hints = Vec::new();
    if config.base_url.is_empty() {
        hints.push("set capability.base_url in kb.toml".to_string());
    }
    if check_embed && config.model_embed.is_empty() {
        hints.push("set capability.model_embed in kb.toml (used for embeddings)".to_string());
    }
    if check_chat && config.model_chat.is_empty() {
        hints.push("set capability.model_chat in kb.toml (used for chat)".to_string());
    }
    if !config.api_key_env.is_empty() && !api_key_present {
        hints.push(format!(
            "export {} (API key), or inject auth via capability.extra_headers",
            config.api_key_env
        ));
    }
    hints
}

/// Render the report the way `kb doctor` prints it.
pub fn format_report(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "KB Doctor: {}",
        if report.ok { "OK" } else { "FAIL" }
    ));
    lines.push(format!(
        "- base_url: {}",
        or_empty_marker(&report.base_url)
    ));
    lines.push(format!(
        "- model_embed: {}",
        or_empty_marker(&report.model_embed)
    ));
    lines.push(format!(
        "- model_chat: {}",
        or_empty_marker(&report.model_chat)
    ));
    lines.push(format!(
        "- api_key: {} ({})",
        report.api_key_env,
        if report.api_key_present {
            "present"
        } else {
            "missing"
        }
    ));
    for (name, check) in [("embed", &report.embed), ("chat", &report.chat)] {
        if let Some(check) = check {
            if check.ok {
                lines.push(format!(
                    "- {name}: OK ({}) [{}ms]",
                    check.detail, check.elapsed_ms
                ));
            } else {
                lines.push(format!("- {name}: FAIL [{}ms]", check.elapsed_ms));
                lines.push(format!("    error: {}", check.detail));
            }
        }
    }
    if !report.hints.is_empty() {
        lines.push("- hints:".to_string());
        for hint in &report.hints {
            lines.push(format!("    - {hint}"));
        }
    }
    lines.join("\n") + "\n"
}

fn or_empty_marker(value: &str) -> &str {
    if value.is_empty() {
        "(empty)"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapabilityConfig;
    use crate::error::KbError;
    use async_trait::async_trait;

    struct StubCapability {
        fail: bool,
    }

    #[async_trait]
    impl Capability for StubCapability {
        fn model_embed(&self) -> &str {
            "stub-embed"
        }

        async fn embed(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            if self.fail {
                return Err(KbError::CapabilityUnavailable("boom".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        async fn chat(&self, _prompt: &str) -> crate::error::Result<String> {
            if self.fail {
                return Err(KbError::CapabilityUnavailable("boom".to_string()));
            }
            Ok("pong".to_string())
        }
    }

    fn configured() -> CapabilityConfig {
        CapabilityConfig {
            base_url: "http://example.local".to_string(),
            model_embed: "stub-embed".to_string(),
            model_chat: "stub-chat".to_string(),
            ..CapabilityConfig::default()
        }
    }

    #[tokio::test]
    async fn test_doctor_ok_when_checks_pass() {
        let report = doctor_with(
            &configured(),
            DoctorOptions::default(),
            &StubCapability { fail: false },
        )
        .await;
        assert!(report.ok);
        assert!(report.embed.as_ref().unwrap().ok);
        assert!(report.chat.as_ref().unwrap().ok);
        assert!(report.embed.unwrap().detail.contains("dims=3"));
    }

    #[tokio::test]
    async fn test_doctor_fail_collects_errors_and_hints() {
        let report = doctor_with(
            &CapabilityConfig::default(),
            DoctorOptions::default(),
            &StubCapability { fail: true },
        )
        .await;
        assert!(!report.ok);
        assert!(!report.embed.as_ref().unwrap().ok);
        assert!(report.hints.iter().any(|h| h.contains("base_url")));
        let rendered = format_report(&report);
        assert!(rendered.contains("KB Doctor: FAIL"));
        assert!(rendered.contains("error: capability unavailable: boom"));
    }

    #[tokio::test]
    async fn test_doctor_single_check_selection() {
        let report = doctor_with(
            &configured(),
            DoctorOptions {
                check_embed: true,
                check_chat: false,
            },
            &StubCapability { fail: false },
        )
        .await;
        assert!(report.embed.is_some());
        assert!(report.chat.is_none());
    }
}
