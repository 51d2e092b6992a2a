// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

const MIB: f64 = 1024.0 * 1024.0;

/// One reading from the engine's stats feed, with the previous reading's
/// counters carried alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSample {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub memory_usage_bytes: u64,
}

impl StatsSample {
    /// Container busy time over total system time, as a percentage in
    /// `[0, 100]`. `None` while either delta is non-positive, which is the
    /// case for the first sample of a stream.
    pub fn cpu_percent(&self) -> Option<f32> {
        let cpu_delta = self.cpu_total_usage as i128 - self.precpu_total_usage as i128;
        let system_delta = self.system_cpu_usage as i128 - self.presystem_cpu_usage as i128;
        if cpu_delta <= 0 || system_delta <= 0 {
            return None;
        }
        let percent = (cpu_delta as f64 / system_delta as f64) * 100.0;
        Some(percent.clamp(0.0, 100.0) as f32)
    }

    pub fn memory_mb(&self) -> f32 {
        bytes_to_mb(self.memory_usage_bytes)
    }
}

pub fn bytes_to_mb(bytes: u64) -> f32 {
    (bytes as f64 / MIB) as f32
}

/// One emitted telemetry point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Percent of one core, `0..=100`
    pub cpu: f32,
    /// Megabytes
    pub ram: f32,
    /// Megabytes used on the volume at the last walk
    pub storage: f32,
}
