// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Hearth CLI

pub mod blueprint;
pub mod config;

pub use self::blueprint::BlueprintCommand;
pub use self::config::ConfigCommand;

use std::path::PathBuf;

use hearth_core::domain::node_config::NodeConfigManifest;

/// Log level to start with before the subscriber exists. Falls back to
/// `info` when the configuration cannot be read; the command itself reports
/// that failure.
pub fn configured_log_level(config_path: Option<PathBuf>) -> String {
    NodeConfigManifest::load_or_default(config_path)
        .map(|config| config.spec.observability.log_level)
        .unwrap_or_else(|_| "info".to_string())
}
