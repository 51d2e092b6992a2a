// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container engine port.
//!
//! Everything the agent needs from the engine, expressed in domain terms.
//! Objects are addressed by name only (see [`ServerId::engine_name`]); no
//! engine handle is cached between calls.
//!
//! [`ServerId::engine_name`]: crate::domain::server::ServerId::engine_name

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::domain::server::{ResourceLimit, ServerAllocation, ServerError};
use crate::domain::telemetry::StatsSample;

/// CFS period used for proportional CPU limits (microseconds).
pub const CPU_PERIOD_US: i64 = 100_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine object not found: {0}")]
    NotFound(String),

    #[error("Engine conflict: {0}")]
    Conflict(String),

    #[error("Engine connection failed: {0}")]
    Connection(String),

    #[error("Engine request failed: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Memory and CPU ceilings applied to both the setup and runtime containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCeilings {
    pub memory_bytes: i64,
    /// Memory plus swap
    pub memory_swap_bytes: i64,
    pub cpu_quota_us: Option<i64>,
    pub cpu_period_us: Option<i64>,
}

impl ResourceCeilings {
    /// `cpu_percent` of 0 leaves the CPU unconstrained.
    pub fn from_limit(limit: &ResourceLimit) -> Result<Self, ServerError> {
        let (memory_bytes, memory_swap_bytes) = limit.memory_bytes()?;
        let (cpu_quota_us, cpu_period_us) = if limit.cpu_percent > 0 {
            (Some(i64::from(limit.cpu_percent) * 1000), Some(CPU_PERIOD_US))
        } else {
            (None, None)
        };
        Ok(Self {
            memory_bytes,
            memory_swap_bytes,
            cpu_quota_us,
            cpu_period_us,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// One published port: `host_ip:port/protocol` to the same port in the
/// container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortBinding {
    pub host_ip: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    /// Every allocation is published on both TCP and UDP.
    pub fn from_allocations(allocations: &[ServerAllocation]) -> Vec<Self> {
        allocations
            .iter()
            .flat_map(|a| {
                [Protocol::Tcp, Protocol::Udp].into_iter().map(move |protocol| Self {
                    host_ip: a.ip.to_string(),
                    port: a.port,
                    protocol,
                })
            })
            .collect()
    }

    /// Docker-style key, e.g. `25565/tcp`.
    pub fn container_port_key(&self) -> String {
        format!("{}/{}", self.port, self.protocol.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub mount: VolumeMount,
    pub ceilings: ResourceCeilings,
    pub ports: Vec<PortBinding>,
    /// Network to join; `None` uses the engine default bridge
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    /// Host path backing the volume
    pub mountpoint: PathBuf,
}

/// How long the engine waits after SIGTERM before killing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopGrace {
    EngineDefault,
    Immediate,
}

/// Attached stdio of a container or exec session.
pub struct AttachedIo {
    pub output: BoxStream<'static, Result<Bytes, EngineError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for AttachedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedIo").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub cmd: Vec<String>,
    pub user: String,
    pub privileged: bool,
    pub tty: bool,
}

impl Default for ShellSpec {
    fn default() -> Self {
        Self {
            cmd: vec!["sh".to_string()],
            user: "root".to_string(),
            privileged: true,
            tty: true,
        }
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Volumes whose name is exactly `name`.
    async fn list_volumes(&self, name: &str) -> Result<Vec<VolumeInfo>, EngineError>;

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo, EngineError>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// Create without starting; returns the engine's container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, name: &str, grace: StopGrace) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError>;

    async fn container_exists(&self, name: &str) -> Result<bool, EngineError>;

    async fn is_running(&self, name: &str) -> Result<bool, EngineError>;

    /// Block until the container is not running; returns its exit code.
    async fn wait_until_stopped(&self, name: &str) -> Result<i64, EngineError>;

    async fn attach(&self, name: &str) -> Result<AttachedIo, EngineError>;

    /// Last `tail` log lines, each prefixed with an RFC 3339 timestamp.
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError>;

    async fn exec_shell(&self, name: &str, spec: &ShellSpec) -> Result<AttachedIo, EngineError>;

    async fn stats(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError>;
}
