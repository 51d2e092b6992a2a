// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::blueprint::BlueprintId;

/// Lowest port a server allocation may bind.
pub const MIN_ALLOCATION_PORT: u16 = 1024;

const MIB: i64 = 1024 * 1024;

// ============================================================================
// Value Objects
// ============================================================================

/// Platform-wide identity of a hosted server (SID).
///
/// Engine objects are named after the SID, so only characters Docker accepts
/// in object names are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Result<Self, ServerError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ServerError::EmptyField("sid"));
        }
        let valid = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid || !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(ServerError::InvalidId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name shared by the runtime container, the data volume and the network.
    pub fn engine_name(&self) -> String {
        format!("server_{}", self.0)
    }

    /// Name of the ephemeral container that runs the setup script.
    pub fn install_container_name(&self) -> String {
        format!("server_{}_install", self.0)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a platform user, as issued by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ServerError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ServerError::EmptyField("user id"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An (IP, port) pair reserved for a server's traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAllocation {
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAllocation {
    pub fn new(ip: IpAddr, port: u16) -> Result<Self, ServerError> {
        let allocation = Self { ip, port };
        allocation.validate()?;
        Ok(allocation)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port < MIN_ALLOCATION_PORT {
            return Err(ServerError::InvalidPort(self.port));
        }
        Ok(())
    }
}

/// Resource budget granted to a server.
///
/// `cpu_percent` is relative to a single core: 100 means one full core,
/// 0 leaves the CPU unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub cpu_percent: u32,
    pub ram_mb: u64,
    pub swap_mb: u64,
    pub storage_mb: u64,
}

fn mib_to_bytes(mb: Option<u64>) -> Option<i64> {
    i64::try_from(mb?).ok()?.checked_mul(MIB)
}

impl ResourceLimit {
    /// Memory ceiling and memory-plus-swap ceiling, in bytes.
    pub fn memory_bytes(&self) -> Result<(i64, i64), ServerError> {
        let memory = mib_to_bytes(Some(self.ram_mb));
        let with_swap = mib_to_bytes(self.ram_mb.checked_add(self.swap_mb));
        match (memory, with_swap) {
            (Some(memory), Some(with_swap)) => Ok((memory, with_swap)),
            _ => Err(ServerError::InvalidLimit(format!(
                "ram_mb {} with swap_mb {} does not fit in a byte count",
                self.ram_mb, self.swap_mb
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.memory_bytes().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Installing,
    Starting,
    Stopping,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "INSTALLING",
            Self::Starting => "STARTING",
            Self::Stopping => "STOPPING",
            Self::Offline => "OFFLINE",
        }
    }
}

impl FromStr for ServerStatus {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSTALLING" => Ok(Self::Installing),
            "STARTING" => Ok(Self::Starting),
            "STOPPING" => Ok(Self::Stopping),
            "OFFLINE" => Ok(Self::Offline),
            other => Err(ServerError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a server is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineReason {
    /// Installed but never started
    Created,
    Stopped,
    Killed,
    Error,
}

impl OfflineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Stopped => "STOPPED",
            Self::Killed => "KILLED",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for OfflineReason {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "STOPPED" => Ok(Self::Stopped),
            "KILLED" => Ok(Self::Killed),
            "ERROR" => Ok(Self::Error),
            other => Err(ServerError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// A hosted server assigned to this node.
///
/// Status only moves forward on confirmed engine outcomes; the orchestrator
/// calls the `mark_*` transitions after the engine call succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub owner: UserId,
    pub users: Vec<UserId>,
    pub allocations: Vec<ServerAllocation>,
    pub resource_limit: ResourceLimit,
    pub image: String,
    pub blueprint_id: BlueprintId,
    pub status: ServerStatus,
    pub offline_reason: Option<OfflineReason>,
    pub container_exists: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Failure recorded by the last background pipeline attempt
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ServerId,
        owner: UserId,
        users: Vec<UserId>,
        allocations: Vec<ServerAllocation>,
        resource_limit: ResourceLimit,
        image: String,
        blueprint_id: BlueprintId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            users,
            allocations,
            resource_limit,
            image,
            blueprint_id,
            status: ServerStatus::Installing,
            offline_reason: None,
            container_exists: false,
            started_at: None,
            stopped_at: None,
            last_error: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Owner or one of the listed users.
    pub fn grants_access_to(&self, user: &UserId) -> bool {
        &self.owner == user || self.users.contains(user)
    }

    pub fn require_container(&self) -> Result<(), ServerError> {
        if !self.container_exists {
            return Err(ServerError::ContainerMissing(self.id.clone()));
        }
        Ok(())
    }

    pub fn mark_installing(&mut self) {
        self.status = ServerStatus::Installing;
        self.offline_reason = None;
        self.touch();
    }

    pub fn mark_container_removed(&mut self) {
        self.container_exists = false;
        self.touch();
    }

    /// Runtime container created but not started.
    pub fn mark_installed(&mut self) {
        self.container_exists = true;
        self.status = ServerStatus::Offline;
        self.offline_reason = Some(OfflineReason::Created);
        self.touch();
    }

    pub fn mark_starting(&mut self, at: DateTime<Utc>) {
        self.status = ServerStatus::Starting;
        self.offline_reason = None;
        self.started_at = Some(at);
        self.touch();
    }

    pub fn mark_stopping(&mut self) -> Result<(), ServerError> {
        if matches!(self.status, ServerStatus::Installing) {
            return Err(ServerError::InvalidStateTransition {
                from: self.status,
                to: ServerStatus::Stopping,
            });
        }
        self.status = ServerStatus::Stopping;
        self.touch();
        Ok(())
    }

    pub fn mark_offline(&mut self, reason: OfflineReason, at: DateTime<Utc>) {
        self.status = ServerStatus::Offline;
        self.offline_reason = Some(reason);
        self.stopped_at = Some(at);
        self.touch();
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(at);
        self.touch();
    }

    pub fn clear_failure(&mut self, at: DateTime<Utc>) {
        self.last_error = None;
        self.last_attempt_at = Some(at);
        self.touch();
    }

    /// Port of the first allocation, substituted for `SERVER_PORT`.
    pub fn primary_port(&self) -> Option<u16> {
        self.allocations.first().map(|a| a.port)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    #[error("Invalid server id '{0}': only [A-Za-z0-9_.-] allowed, starting alphanumeric")]
    InvalidId(String),

    #[error("Port {0} outside allowed range 1024-65535")]
    InvalidPort(u16),

    #[error("Invalid resource limit: {0}")]
    InvalidLimit(String),

    #[error("Unknown status value '{0}'")]
    UnknownStatus(String),

    #[error("Server {0} has no container; install it first")]
    ContainerMissing(ServerId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: ServerStatus, to: ServerStatus },
}
