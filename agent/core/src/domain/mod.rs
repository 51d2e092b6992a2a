// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod access;
pub mod blueprint;
pub mod engine;
pub mod file_policy;
pub mod node_config;
pub mod path_sanitizer;
pub mod repository;
pub mod server;
pub mod telemetry;
