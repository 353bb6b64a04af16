// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loading for the Cauce dispatcher.
//!
//! TOML model structs with serde defaults, merged through Figment with
//! `CAUCE_` environment variable overrides.

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::CauceConfig;
