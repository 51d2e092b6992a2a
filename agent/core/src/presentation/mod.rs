// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! HTTP and WebSocket surface that translates requests into application
//! service calls. No business logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/WebSocket (Axum) | Lifecycle and file endpoints, console/terminal/telemetry sockets |

pub mod api;
