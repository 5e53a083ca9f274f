// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{Config, CONFIG_DIR_NAME};

/// A loaded configuration plus any warnings produced while loading it.
///
/// Warnings are recorded when a layer fails to parse or validate; the layer
/// is skipped and the remaining layers (or the built-in defaults) apply.
/// The core never displays them itself; the hosting front-end decides when
/// and whether to surface them.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: Config,
    pub warnings: Vec<String>,
}

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/runa/config.yaml"));
    paths.push(PathBuf::from("/etc/runa/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/runa/config.yaml"));
        paths.push(home.join(".config/runa/config.yml"));
        paths.push(home.join(CONFIG_DIR_NAME).join("config.yaml"));
        paths.push(home.join(CONFIG_DIR_NAME).join("config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".runa/config.yaml"));
    paths.push(PathBuf::from(".runa.yaml"));
    paths.push(PathBuf::from("runa.yaml"));

    paths
}

/// Load configuration by folding all discovered YAML files into one
/// document, highest-priority layer last.
///
/// The `extra` argument may provide an explicit path (e.g. a `--config` CLI
/// flag); a missing explicit path is a hard error, while discovered layers
/// that fail to read or parse only record a warning and are skipped.
pub fn load(extra: Option<&Path>) -> anyhow::Result<LoadedConfig> {
    let mut merged = serde_yaml::Value::Null;
    let mut warnings = Vec::new();

    for path in config_search_paths() {
        if !path.is_file() {
            continue;
        }
        debug!(path = %path.display(), "loading config layer");
        match read_layer(&path) {
            // An empty file parses to Null; it contributes nothing and must
            // not wipe the layers below it.
            Ok(layer) if layer.is_null() => {}
            Ok(layer) => merged = merge_yaml(merged, layer),
            Err(e) => warnings.push(format!(
                "Invalid config at {}: {e}. Falling back to built-in defaults.",
                path.display()
            )),
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_layer(p)?;
        if !layer.is_null() {
            merged = merge_yaml(merged, layer);
        }
    }

    // A Null document means no layer contributed anything.
    let config = if merged.is_null() {
        Config::default()
    } else {
        match serde_yaml::from_value(merged) {
            Ok(c) => c,
            Err(e) => {
                warnings.push(format!(
                    "Invalid config values: {e}. Falling back to built-in defaults."
                ));
                Config::default()
            }
        }
    };

    Ok(LoadedConfig { config, warnings })
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Merge `overlay` onto `base` and return the combined document.
///
/// Mappings merge key by key, recursing into keys present on both sides;
/// anything else (scalars, sequences, mismatched kinds) is replaced by the
/// overlay wholesale.
fn merge_yaml(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;

    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
