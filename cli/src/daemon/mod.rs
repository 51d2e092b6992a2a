// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground agent process
//!
//! Handles:
//! - Service wiring from the node configuration
//! - Metrics exporter
//! - HTTP/WebSocket server
//! - Graceful shutdown

pub mod server;

pub use server::serve;
