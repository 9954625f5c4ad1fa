//! Language → color registry backed by Linguist's `languages.json`.
//!
//! The registry is process-wide and initialized at most once, at startup.
//! Languages without a configured color get a stable color derived from
//! the SHA-256 of their name.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{AppError, Result};

static REGISTRY: OnceLock<ColorMap> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct Language {
    #[serde(default)]
    color: Option<String>,
}

/// Colors keyed by language name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorMap {
    colors: HashMap<String, String>,
}

impl ColorMap {
    /// Parse the contents of `languages.json`.
    ///
    /// Languages without a `color` entry are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for malformed JSON.
    pub fn from_json(raw: &str) -> Result<Self> {
        let languages: HashMap<String, Language> = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("invalid languages.json: {err}")))?;
        let colors = languages
            .into_iter()
            .filter_map(|(name, language)| {
                language
                    .color
                    .filter(|color| !color.is_empty())
                    .map(|color| (name, color))
            })
            .collect();
        Ok(Self { colors })
    }

    /// Read and parse `languages.json` from `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Number of languages with a configured color.
    #[must_use]
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    /// Whether no colors are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Color of `language`, falling back to [`fallback_color`].
    #[must_use]
    pub fn color(&self, language: &str) -> String {
        self.colors
            .get(language)
            .cloned()
            .unwrap_or_else(|| fallback_color(language))
    }
}

/// `#` followed by the hex of the first three bytes of `sha256(language)`.
#[must_use]
pub fn fallback_color(language: &str) -> String {
    let digest = Sha256::digest(language.as_bytes());
    digest[..3]
        .iter()
        .fold(String::from("#"), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Install `map` as the process-wide registry.
///
/// Returns `false` when the registry was already initialized; the existing
/// map is kept.
pub fn install(map: ColorMap) -> bool {
    REGISTRY.set(map).is_ok()
}

/// Load `languages.json` from `path` into the process-wide registry.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read or parsed.
pub fn load_colors(path: &Path) -> Result<()> {
    let map = ColorMap::load(path)?;
    let count = map.len();
    if install(map) {
        info!(languages = count, path = %path.display(), "linguist colors loaded");
    } else {
        warn!(path = %path.display(), "linguist colors already loaded, keeping existing map");
    }
    Ok(())
}

/// Color of `language` from the process-wide registry.
#[must_use]
pub fn color(language: &str) -> String {
    match REGISTRY.get() {
        Some(map) => map.color(language),
        None => fallback_color(language),
    }
}
