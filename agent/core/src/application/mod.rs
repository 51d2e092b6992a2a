// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod console;
pub mod error;
pub mod files;
pub mod lifecycle;
pub mod locks;
pub mod provisioning;
pub mod repository_factory;
pub mod telemetry;
pub mod terminal;

use metrics::gauge;

/// Counts an open streaming call in `hearth_active_streams` while alive.
pub(crate) struct StreamGauge {
    kind: &'static str,
}

impl StreamGauge {
    pub(crate) fn open(kind: &'static str) -> Self {
        gauge!("hearth_active_streams", "kind" => kind).increment(1.0);
        Self { kind }
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        gauge!("hearth_active_streams", "kind" => self.kind).decrement(1.0);
    }
}
