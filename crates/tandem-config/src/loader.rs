// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/tandem/config.toml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/tandem/config.toml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("tandem/config.toml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".tandem/config.toml"));
    paths.push(PathBuf::from("tandem.toml"));

    paths
}

/// Load configuration by merging all discovered TOML files.
/// The `extra` argument may provide an explicit path (e.g. a CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = toml::Table::new();

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_file(&mut merged, &path)?;
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_file(&mut merged, p)?;
    }

    if merged.is_empty() {
        return Ok(Config::default());
    }
    let config = toml::Value::Table(merged)
        .try_into()
        .context("deserializing merged config")?;
    Ok(config)
}

fn merge_file(dst: &mut toml::Table, path: &Path) -> anyhow::Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let layer: toml::Table =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_tables(dst, layer);
    Ok(())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_tables(dst: &mut toml::Table, src: toml::Table) {
    for (k, v) in src {
        match (dst.get_mut(&k), v) {
            (Some(toml::Value::Table(d)), toml::Value::Table(s)) => merge_tables(d, s),
            (_, v) => {
                dst.insert(k, v);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
