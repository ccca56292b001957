use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;

use crate::query::Granularity;

pub const CONFIG_FILE_NAME: &str = "usage-board.json";

static CONFIG_SCHEMA: OnceCell<JSONSchema> = OnceCell::new();
static CONFIG_SCHEMA_JSON: OnceCell<Value> = OnceCell::new();

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    pub base_url: Option<String>,
    pub access_token: Option<String>,
    pub admin: Option<bool>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DefaultsConfig {
    pub json: Option<bool>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub granularity: Option<Granularity>,
    pub user: Option<String>,
    pub quota_per_unit: Option<f64>,
    pub display_in_currency: Option<bool>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandConfigs {
    pub report: Option<DefaultsConfig>,
    pub dashboard: Option<DefaultsConfig>,
    pub request: Option<DefaultsConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerConfig>,
    pub defaults: Option<DefaultsConfig>,
    pub commands: Option<CommandConfigs>,
}

pub fn load_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    let candidate = if let Some(p) = path {
        Some(p.clone())
    } else {
        let cwd = PathBuf::from(CONFIG_FILE_NAME);
        if cwd.exists() {
            Some(cwd)
        } else if let Some(home) = home_dir() {
            let default = home.join(".config/usage-board/config.json");
            if default.exists() { Some(default) } else { None }
        } else {
            None
        }
    };

    match candidate {
        Some(path) => read_config(&path),
        None => Ok(FileConfig::default()),
    }
}

fn read_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    validate_config(&value)?;
    let cfg: FileConfig = serde_json::from_value(value)
        .with_context(|| format!("Failed to deserialize config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

fn validate_config(value: &Value) -> Result<()> {
    let schema_value = CONFIG_SCHEMA_JSON.get_or_try_init(|| {
        let schema_str = include_str!("../config-schema.json");
        serde_json::from_str(schema_str).context("parsing config schema")
    })?;
    let schema = CONFIG_SCHEMA.get_or_try_init(|| {
        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema_value)
            .context("compiling config schema")
    })?;

    if let Err(errors) = schema.validate(value) {
        let mut msg = String::from("Config validation failed:\n");
        for err in errors {
            msg.push_str(&format!(" - {} at {}\n", err, err.instance_path));
        }
        anyhow::bail!(msg.trim_end().to_string());
    }
    Ok(())
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// First value set among CLI flag, per-command config and global defaults.
pub fn resolve<T: Clone>(cli: Option<&T>, cmd: Option<&T>, defaults: Option<&T>) -> Option<T> {
    cli.or(cmd).or(defaults).cloned()
}

pub fn resolve_bool(
    cli: Option<bool>,
    cmd: Option<bool>,
    defaults: Option<bool>,
    fallback: bool,
) -> bool {
    cli.or(cmd).or(defaults).unwrap_or(fallback)
}
