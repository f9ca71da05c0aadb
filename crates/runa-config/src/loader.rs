// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths(project_root: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/runa/config.json"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/runa/config.json"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("runa/config.json"));
    }

    // 3. Workspace-local
    if let Some(root) = project_root {
        paths.push(root.join(".runa/config.json"));
        paths.push(root.join(".runa.json"));
    }

    paths
}

/// Load configuration by merging all discovered JSON files.
/// The `extra` argument may provide an explicit path supplied by the host.
pub fn load(project_root: Option<&Path>, extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for path in config_search_paths(project_root) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_json(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_json(&mut merged, layer);
    }

    // Deserialize the merged value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_json::Value::Object(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_json::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Effective log filter string.
///
/// `LOG_LEVEL` defaults to `info`; `debug` additionally enables per-iteration
/// prompt dumps in the agent loop (gated on `tracing::enabled!` there).
pub fn log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = serde_json::json!({"a": 1});
        merge_json(&mut dst, serde_json::json!({"a": 2}));
        assert_eq!(dst["a"], 2);
    }

    #[test]
    fn merge_preserves_unrelated_keys() {
        let mut dst = serde_json::json!({"a": 1, "b": {"x": true}});
        merge_json(&mut dst, serde_json::json!({"b": {"y": false}}));
        assert_eq!(dst["a"], 1);
        assert_eq!(dst["b"]["x"], true);
        assert_eq!(dst["b"]["y"], false);
    }

    #[test]
    fn load_without_files_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(dir.path()), None).unwrap();
        assert_eq!(cfg.agent.max_iterations, 30);
    }

    #[test]
    fn explicit_file_overrides_project_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".runa")).unwrap();
        std::fs::write(
            dir.path().join(".runa/config.json"),
            r#"{"agent": {"max_iterations": 10}}"#,
        )
        .unwrap();
        let extra = dir.path().join("override.json");
        std::fs::write(&extra, r#"{"agent": {"max_iterations": 3}}"#).unwrap();

        let cfg = load(Some(dir.path()), Some(&extra)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 3);
    }

    #[test]
    fn project_layer_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".runa")).unwrap();
        std::fs::write(
            dir.path().join(".runa/config.json"),
            r#"{"tools": {"default_timeout_secs": 90}}"#,
        )
        .unwrap();
        let cfg = load(Some(dir.path()), None).unwrap();
        assert_eq!(cfg.tools.default_timeout_secs, 90);
    }

    #[test]
    fn malformed_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("broken.json");
        std::fs::write(&extra, "{not json").unwrap();
        assert!(load(Some(dir.path()), Some(&extra)).is_err());
    }
}
