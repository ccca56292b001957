use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::query::Granularity;

pub const PREFS_ENV: &str = "USAGE_BOARD_PREFS";

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_granularity: Option<Granularity>,
}

pub fn preferences_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(PREFS_ENV) {
        return Some(PathBuf::from(path));
    }
    ProjectDirs::from("com", "usage-board", "usage-board")
        .map(|dirs| dirs.config_dir().join("preferences.json"))
}

/// A missing or unreadable file means no preference.
pub fn load(path: Option<&Path>) -> Preferences {
    let Some(path) = path else {
        return Preferences::default();
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Preferences::default(),
    };
    match serde_json::from_str(&contents) {
        Ok(prefs) => prefs,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "ignoring unreadable preferences");
            Preferences::default()
        }
    }
}

pub fn save(path: &Path, prefs: &Preferences) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating preferences dir {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(prefs).context("serializing preferences")?;
    std::fs::write(path, contents)
        .with_context(|| format!("writing preferences {}", path.display()))?;
    Ok(())
}
