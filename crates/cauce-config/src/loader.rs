// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Merge order: compiled defaults, then `/etc/cauce/cauce.toml`, then the
//! user XDG config, then `./cauce.toml`, then `CAUCE_*` environment
//! variables.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::CauceConfig;

/// Load configuration from the standard hierarchy with env var overrides.
pub fn load_config() -> Result<CauceConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(CauceConfig::default()))
        .merge(Toml::file("/etc/cauce/cauce.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("cauce/cauce.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("cauce.toml"))
        .merge(env_provider())
        .extract()
}

/// Load configuration from a TOML string only (no file lookup, no env).
///
/// Used by tests and for explicit config injection.
pub fn load_config_from_str(toml_content: &str) -> Result<CauceConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(CauceConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<CauceConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(CauceConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Create the environment variable provider using explicit `map()` for
/// section-to-dot mapping.
///
/// Uses `Env::map()` NOT `Env::split("_")` to avoid ambiguity with
/// underscore-containing key names: `CAUCE_AGENT_API_KEY` must map to
/// `agent.api_key`, not `agent.api.key`.
fn env_provider() -> Env {
    Env::prefixed("CAUCE_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("agent_", "agent.", 1)
            .replacen("whatsapp_", "whatsapp.", 1)
            .replacen("chatwoot_", "chatwoot.", 1)
            .replacen("storage_", "storage.", 1)
            .replacen("cache_", "cache.", 1)
            .replacen("dispatch_", "dispatch.", 1)
            .replacen("rate_", "rate.", 1)
            .replacen("followup_", "followup.", 1)
            .replacen("gateway_", "gateway.", 1);
        mapped.into()
    })
}
