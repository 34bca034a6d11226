//! Configuration from environment variables and `gateway.json`.
//!
//! Environment:
//! - `PORT`: listen port (default: 8080)
//! - `DEBUG`: verbose logging (default: false)
//! - `FALLBACK`: alternate-model fallback when the pool is exhausted
//!   (default: false)
//! - `WEBUI_PASSWORD`: optional password for the management surface
//! - `COOLDOWN_SECS`: base account cooldown after a 429 (default: 60)
//!
//! Persisted state lives under `$HOME/.config/antigravity-gateway/`:
//! `accounts.json` (the credential pool) and `gateway.json` (the system
//! instruction). The system instruction must contain the literal sentinel
//! `"You are Antigravity"`; the upstream rejects sessions that do not
//! identify as its own IDE client, so writes dropping the sentinel are
//! refused.

use crate::atomic_write::write_atomic;
use crate::error::GatewayError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Sentinel the system instruction must carry.
pub const SYSTEM_INSTRUCTION_SENTINEL: &str = "You are Antigravity";

/// Default system instruction, used until an operator stores another one.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Antigravity, an agentic AI \
coding assistant. You are pair programming with a USER to solve their task: \
answering questions, writing code, and operating tools on their behalf.";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub debug: bool,
    pub fallback_enabled: bool,
    pub webui_password: Option<String>,
    pub cooldown_secs: u64,
    pub config_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayFile {
    system_instruction: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            debug: env_flag("DEBUG"),
            fallback_enabled: env_flag("FALLBACK"),
            webui_password: env::var("WEBUI_PASSWORD").ok().filter(|p| !p.is_empty()),
            cooldown_secs: env::var("COOLDOWN_SECS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(60),
            config_dir: default_config_dir(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("antigravity-gateway")
}

impl GatewayConfig {
    #[cfg(test)]
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.config_dir.join("accounts.json")
    }

    pub fn gateway_file_path(&self) -> PathBuf {
        self.config_dir.join("gateway.json")
    }

    /// The active system instruction: `gateway.json` if present and valid,
    /// otherwise the built-in default.
    pub fn system_instruction(&self) -> String {
        match read_gateway_file(&self.gateway_file_path()) {
            Ok(Some(file)) if file.system_instruction.contains(SYSTEM_INSTRUCTION_SENTINEL) => {
                file.system_instruction
            }
            Ok(Some(_)) => {
                tracing::warn!("stored system instruction lost its sentinel, using default");
                DEFAULT_SYSTEM_INSTRUCTION.to_string()
            }
            Ok(None) => DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read gateway.json, using default");
                DEFAULT_SYSTEM_INSTRUCTION.to_string()
            }
        }
    }

    /// Store a new system instruction. Rejected unless it carries the
    /// sentinel.
    pub fn store_system_instruction(&self, instruction: &str) -> Result<(), GatewayError> {
        if !instruction.contains(SYSTEM_INSTRUCTION_SENTINEL) {
            return Err(GatewayError::Translation(format!(
                "system instruction must contain \"{}\"",
                SYSTEM_INSTRUCTION_SENTINEL
            )));
        }
        let file = GatewayFile {
            system_instruction: instruction.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        write_atomic(&self.gateway_file_path(), &bytes, false)
            .map_err(|e| GatewayError::Config(format!("failed to write gateway.json: {}", e)))
    }
}

fn read_gateway_file(path: &Path) -> Result<Option<GatewayFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let file = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {:?}", path))?;
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_instruction_carries_sentinel() {
        assert!(DEFAULT_SYSTEM_INSTRUCTION.contains(SYSTEM_INSTRUCTION_SENTINEL));
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        assert_eq!(config.system_instruction(), DEFAULT_SYSTEM_INSTRUCTION);
    }

    #[test]
    fn store_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        let custom = "You are Antigravity. Prefer short answers.";
        config.store_system_instruction(custom).unwrap();
        assert_eq!(config.system_instruction(), custom);
    }

    #[test]
    fn write_without_sentinel_is_rejected() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        let err = config
            .store_system_instruction("You are a helpful assistant.")
            .unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
        // Nothing was written.
        assert!(!config.gateway_file_path().exists());
    }

    #[test]
    fn truncated_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(config.gateway_file_path(), "{\"systemInstr").unwrap();
        assert_eq!(config.system_instruction(), DEFAULT_SYSTEM_INSTRUCTION);
    }
}
