// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod access;
pub mod db;
pub mod docker;
pub mod repositories;
pub mod sandbox;
