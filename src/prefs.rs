use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Offset, Utc};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::PreferencesError;

const FILE_NAME: &str = ".logdeck.json";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_ROOT: &str = "/var/log";

/// Operator preferences. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub exclude_profiles: Vec<String>,
    pub profiles: BTreeMap<String, PathBuf>,
    pub utc_offset_minutes: i32,
}

impl Preferences {
    /// Per-directory, per-user and config-directory files, in lookup order.
    pub fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(FILE_NAME));
        }
        if let Some(config) = dirs::config_dir() {
            paths.push(config.join("logdeck").join("logdeck.json"));
        }
        paths
    }

    pub fn load_default() -> Self {
        Self::load_first(&Self::candidates())
    }

    /// First candidate that reads and parses wins; none yields the default.
    pub fn load_first(paths: &[PathBuf]) -> Self {
        for path in paths {
            match Self::load_from(path) {
                Ok(prefs) => {
                    info!("loaded preferences from {}", path.display());
                    return prefs;
                }
                Err(PreferencesError::Read { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    debug!("no preferences at {}", path.display());
                }
                Err(err) => warn!("skipping preferences: {err}"),
            }
        }
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, PreferencesError> {
        let text = std::fs::read_to_string(path).map_err(|source| PreferencesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| PreferencesError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Display timezone. Offsets outside a day fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Profile roots to scan, including excluded ones.
    pub fn profile_roots(&self) -> Vec<(String, PathBuf)> {
        if self.profiles.is_empty() {
            return vec![(DEFAULT_PROFILE.to_owned(), PathBuf::from(DEFAULT_ROOT))];
        }
        self.profiles
            .iter()
            .map(|(name, root)| (name.clone(), root.clone()))
            .collect()
    }
}
