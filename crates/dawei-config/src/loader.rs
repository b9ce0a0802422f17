// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::WorkspaceConfig;

/// Resolve the dawei home directory.
///
/// `DAWEI_HOME` wins when set; otherwise `~/.dawei`.  Global resources
/// (workspace index, checkpoints, sessions) live here.
pub fn dawei_home() -> PathBuf {
    if let Ok(home) = std::env::var("DAWEI_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".dawei")
}

/// Ordered list of config layers for a workspace, lowest priority first.
///
/// Later files override earlier ones field-wise.  `settings.json` carries
/// user-level defaults inherited by the workspace; `config.json` is the
/// workspace-explicit file and wins on conflicts.
fn config_layers(workspace: &Path) -> Vec<PathBuf> {
    vec![
        dawei_home().join("settings.json"),
        workspace.join(".dawei").join("settings.json"),
        workspace.join(".dawei").join("config.json"),
    ]
}

/// Load the merged configuration for one workspace.
pub fn load_workspace_config(workspace: &Path) -> anyhow::Result<WorkspaceConfig> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for path in config_layers(workspace) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_json(&mut merged, layer);
        }
    }

    let config: WorkspaceConfig =
        if matches!(&merged, serde_json::Value::Object(m) if m.is_empty()) {
            WorkspaceConfig::default()
        } else {
            serde_json::from_value(merged).context("deserializing merged workspace config")?
        };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_json::Value::Object(Default::default()));
                merge_json(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
