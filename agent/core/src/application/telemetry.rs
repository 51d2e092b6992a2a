// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource usage sampling.
//!
//! CPU and memory come from the engine's stats feed, one point per sample.
//! Storage is a walk of the server volume, refreshed on its own timer and
//! cached between walks because it is far more expensive. The first walk
//! completes before any point is emitted.

use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::error::ServiceError;
use crate::application::StreamGauge;
use crate::domain::access::{AccessGuard, Caller};
use crate::domain::engine::ContainerEngine;
use crate::domain::repository::ServerRepository;
use crate::domain::server::ServerId;
use crate::domain::telemetry::{bytes_to_mb, ResourceUsage};
use crate::infrastructure::sandbox::SandboxedRoot;

pub struct TelemetryService {
    engine: Arc<dyn ContainerEngine>,
    servers: Arc<dyn ServerRepository>,
    guard: Arc<dyn AccessGuard>,
    storage_interval: Duration,
}

/// Aborts the storage walker when the stream ends.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_storage_sampler(root: SandboxedRoot, interval: Duration, cache: Arc<AtomicU64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            match root.dir_size(PathBuf::new()).await {
                Ok(bytes) => cache.store(bytes, Ordering::Relaxed),
                Err(e) => warn!(root = %root.host_path().display(), error = %e, "Volume size walk failed"),
            }
        }
    })
}

impl TelemetryService {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        servers: Arc<dyn ServerRepository>,
        guard: Arc<dyn AccessGuard>,
        storage_interval: Duration,
    ) -> Self {
        Self {
            engine,
            servers,
            guard,
            storage_interval,
        }
    }

    /// Emit usage points into `out` until the feed ends or the receiver is
    /// dropped.
    pub async fn resource_usage(
        &self,
        caller: &Caller,
        sid: &ServerId,
        out: mpsc::Sender<ResourceUsage>,
    ) -> Result<(), ServiceError> {
        self.guard.check_access(caller, sid).await?;
        let server = self
            .servers
            .find_by_id(sid)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("server {}", sid)))?;
        server.require_container()?;

        let name = sid.engine_name();
        let volume = self.engine.inspect_volume(&name).await?;
        let root = SandboxedRoot::open(&volume.mountpoint)?;
        let mut stats = self.engine.stats(&name).await?;

        let _gauge = StreamGauge::open("telemetry");
        let storage = Arc::new(AtomicU64::new(root.dir_size(PathBuf::new()).await?));
        let _sampler = AbortOnDrop(spawn_storage_sampler(root, self.storage_interval, storage.clone()));
        info!(sid = %sid, caller = %caller, "Telemetry stream opened");

        loop {
            let sample = tokio::select! {
                _ = out.closed() => break,
                next = stats.next() => match next {
                    Some(sample) => sample?,
                    None => break,
                },
            };
            let Some(cpu) = sample.cpu_percent() else {
                debug!(sid = %sid, "Skipping sample without CPU delta");
                continue;
            };
            let usage = ResourceUsage {
                cpu,
                ram: sample.memory_mb(),
                storage: bytes_to_mb(storage.load(Ordering::Relaxed)),
            };
            if out.send(usage).await.is_err() {
                break;
            }
        }

        info!(sid = %sid, "Telemetry stream closed");
        Ok(())
    }
}
