// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Hearth Node Agent Core
//!
//! Server lifecycle orchestration, console/terminal streaming, resource
//! telemetry and sandboxed file access for hosted game servers.
//!
//! ## Layers
//!
//! - [`domain`]: aggregates, value objects, the container engine port and
//!   repository traits
//! - [`application`]: lifecycle orchestrator and the runtime-facing services
//! - [`infrastructure`]: Docker, SQLite, in-memory and `cap-std` adapters
//! - [`presentation`]: HTTP and WebSocket surface

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
