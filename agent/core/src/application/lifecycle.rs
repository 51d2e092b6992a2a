// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server lifecycle orchestration.
//!
//! ```text
//! INSTALLING ──▶ OFFLINE(CREATED) ──▶ STARTING ──▶ STOPPING ──▶ OFFLINE(STOPPED|KILLED|ERROR)
//!                                        ▲                            │
//!                                        └────────────────────────────┘
//! ```
//!
//! Every mutating request holds the server's token from [`ServerLocks`].
//! Work that outlives the request (install pipelines, stop waiters) takes
//! the owned guard with it, so the next request on that server queues
//! behind it. Delete is the exception: it cancels a running install
//! pipeline instead of waiting for it.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::error::ServiceError;
use crate::application::locks::{ServerGuard, ServerLocks};
use crate::application::provisioning::{ignore_not_found, Provisioner, ProvisioningSettings};
use crate::application::terminal::TerminalSessions;
use crate::domain::access::{AccessGuard, Caller};
use crate::domain::blueprint::{render_template, Blueprint, BlueprintId, TemplateVars};
use crate::domain::engine::{ContainerEngine, StopGrace};
use crate::domain::node_config::NodeConfigSpec;
use crate::domain::repository::{BlueprintRepository, RepositoryError, ServerRepository};
use crate::domain::server::{
    OfflineReason, ResourceLimit, Server, ServerAllocation, ServerId, ServerStatus, UserId,
};

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateServerCommand {
    pub sid: ServerId,
    pub owner: UserId,
    pub users: Vec<UserId>,
    pub allocations: Vec<ServerAllocation>,
    pub resource_limit: ResourceLimit,
    pub image: String,
    pub blueprint_id: BlueprintId,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateServerCommand {
    pub users: Option<Vec<UserId>>,
    pub allocations: Option<Vec<ServerAllocation>>,
    pub resource_limit: Option<ResourceLimit>,
    pub image: Option<String>,
    pub blueprint_id: Option<BlueprintId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

impl FromStr for PowerAction {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            other => Err(ServiceError::Validation(format!("unknown power action '{}'", other))),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Bounded exponential backoff for the install pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub lock_timeout: Duration,
    pub stop_timeout: Duration,
    pub retry: RetryPolicy,
    pub provisioning: ProvisioningSettings,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            provisioning: ProvisioningSettings::default(),
        }
    }
}

impl LifecycleSettings {
    pub fn from_config(spec: &NodeConfigSpec) -> Self {
        let lifecycle = &spec.lifecycle;
        Self {
            lock_timeout: lifecycle.lock_timeout,
            stop_timeout: lifecycle.stop_timeout,
            retry: RetryPolicy {
                max_attempts: lifecycle.retry.max_attempts,
                initial_backoff: lifecycle.retry.initial_backoff,
                max_backoff: lifecycle.retry.max_backoff,
            },
            provisioning: ProvisioningSettings {
                data_mount: lifecycle.data_mount.clone(),
                network_mode: spec.docker.network_mode.clone(),
                install_timeout: lifecycle.install_timeout,
            },
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[async_trait]
pub trait LifecycleService: Send + Sync {
    /// Register a server and install and start it in the background.
    async fn create_server(&self, caller: &Caller, cmd: CreateServerCommand) -> Result<Server, ServiceError>;

    async fn update_server(
        &self,
        caller: &Caller,
        sid: &ServerId,
        cmd: UpdateServerCommand,
    ) -> Result<Server, ServiceError>;

    /// Tear down registry rows and engine objects. Every step runs.
    async fn delete_server(&self, caller: &Caller, sid: &ServerId, force: bool) -> Result<(), ServiceError>;

    async fn reinstall(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError>;

    async fn status(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError>;

    async fn power(&self, caller: &Caller, sid: &ServerId, action: PowerAction) -> Result<Server, ServiceError>;
}

/// How a stop was initiated; decides what the waiter does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// The blueprint stop command was typed into the console
    Command,
    /// The engine was asked to stop the container
    Signalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterStop {
    Offline(OfflineReason),
    Restart,
}

#[derive(Clone)]
pub struct StandardLifecycleService {
    servers: Arc<dyn ServerRepository>,
    blueprints: Arc<dyn BlueprintRepository>,
    engine: Arc<dyn ContainerEngine>,
    guard: Arc<dyn AccessGuard>,
    terminals: Arc<TerminalSessions>,
    locks: Arc<ServerLocks>,
    /// Cancellation handles of running install pipelines
    pipelines: Arc<DashMap<ServerId, CancellationToken>>,
    provisioner: Arc<Provisioner>,
    retry: RetryPolicy,
    stop_timeout: Duration,
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, ServiceError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.kind().as_str(),
    };
    counter!("hearth_lifecycle_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

fn require_backend(caller: &Caller, operation: &str) -> Result<(), ServiceError> {
    match caller {
        Caller::Backend => Ok(()),
        Caller::User(user) => Err(ServiceError::AccessDenied(format!(
            "{} is reserved for the backend; user {} may not call it",
            operation, user
        ))),
    }
}

fn ensure_image_allowed(blueprint: &Blueprint, image: &str) -> Result<(), ServiceError> {
    if !blueprint.allows_image(image) {
        return Err(ServiceError::Validation(format!(
            "image '{}' is not allowed by blueprint {}",
            image, blueprint.id
        )));
    }
    Ok(())
}

impl StandardLifecycleService {
    pub fn new(
        servers: Arc<dyn ServerRepository>,
        blueprints: Arc<dyn BlueprintRepository>,
        engine: Arc<dyn ContainerEngine>,
        guard: Arc<dyn AccessGuard>,
        terminals: Arc<TerminalSessions>,
        settings: LifecycleSettings,
    ) -> Self {
        let provisioner = Provisioner::new(engine.clone(), servers.clone(), settings.provisioning);
        Self {
            servers,
            blueprints,
            engine,
            guard,
            terminals,
            locks: Arc::new(ServerLocks::new(settings.lock_timeout)),
            pipelines: Arc::new(DashMap::new()),
            provisioner: Arc::new(provisioner),
            retry: settings.retry,
            stop_timeout: settings.stop_timeout,
        }
    }

    /// Wait until no operation holds the server's token.
    pub async fn wait_idle(&self, sid: &ServerId) -> Result<(), ServiceError> {
        drop(self.locks.acquire(sid).await?);
        Ok(())
    }

    /// Restart install pipelines that a previous process left in INSTALLING.
    pub async fn resume_pending_installs(&self) -> Result<usize, ServiceError> {
        let mut resumed = 0;
        for server in self.servers.list_all().await? {
            if server.status != ServerStatus::Installing {
                continue;
            }
            let guard = self.locks.acquire(&server.id).await?;
            info!(sid = %server.id, "Resuming interrupted install");
            self.spawn_pipeline(server.id.clone(), guard, "resume");
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn load(&self, sid: &ServerId) -> Result<Server, ServiceError> {
        self.servers
            .find_by_id(sid)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("server {}", sid)))
    }

    async fn load_blueprint(&self, id: &BlueprintId) -> Result<Blueprint, ServiceError> {
        self.blueprints
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("blueprint {}", id)))
    }

    /// Insert the server row, then its users, then its allocations. Anything
    /// written is deleted again when a later step fails.
    async fn persist_new(&self, server: &Server) -> Result<(), ServiceError> {
        self.servers.insert(server).await?;

        let rows = async {
            self.servers.replace_users(&server.id, &server.users).await?;
            self.servers
                .replace_allocations(&server.id, &server.allocations)
                .await?;
            Ok::<(), RepositoryError>(())
        }
        .await;

        if let Err(e) = rows {
            warn!(sid = %server.id, error = %e, "Rolling back partially created server");
            if let Err(rollback) = self.servers.delete(&server.id).await {
                error!(sid = %server.id, error = %rollback, "Rollback of server rows failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Write changed user and allocation rows, then the server row. On
    /// failure the previous user and allocation rows are written back.
    async fn persist_update(&self, previous: &Server, server: &Server) -> Result<(), ServiceError> {
        let users_changed = previous.users != server.users;
        let allocations_changed = previous.allocations != server.allocations;

        let written = async {
            if users_changed {
                self.servers.replace_users(&server.id, &server.users).await?;
            }
            if allocations_changed {
                self.servers
                    .replace_allocations(&server.id, &server.allocations)
                    .await?;
            }
            self.servers.save(server).await
        }
        .await;

        if let Err(e) = written {
            warn!(sid = %server.id, error = %e, "Restoring server rows after failed update");
            let restored = async {
                if users_changed {
                    self.servers.replace_users(&previous.id, &previous.users).await?;
                }
                if allocations_changed {
                    self.servers
                        .replace_allocations(&previous.id, &previous.allocations)
                        .await?;
                }
                Ok::<(), RepositoryError>(())
            }
            .await;
            if let Err(restore) = restored {
                error!(sid = %server.id, error = %restore, "Restoring server rows failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Number of install pipelines currently running.
    pub fn running_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Number of servers with a live execution token.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    /// Run the install pipeline in the background. The guard is released
    /// when the pipeline finishes or is cancelled.
    fn spawn_pipeline(&self, sid: ServerId, guard: ServerGuard, operation: &'static str) {
        let token = CancellationToken::new();
        self.pipelines.insert(sid.clone(), token.clone());

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.run_pipeline(&sid, operation) => {}
                _ = token.cancelled() => {
                    info!(sid = %sid, operation, "Install pipeline cancelled");
                    counter!("hearth_lifecycle_operations_total", "operation" => operation, "outcome" => "cancelled")
                        .increment(1);
                }
            }
            this.pipelines.remove(&sid);
            drop(guard);
        });
    }

    /// Install then start, retrying transient failures.
    async fn run_pipeline(&self, sid: &ServerId, operation: &'static str) {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(sid = %sid, attempt, "Install pipeline attempt");

            let result = self.provision_once(sid).await;
            match result {
                Ok(()) => {
                    self.persist_success(sid).await;
                    histogram!("hearth_install_duration_seconds").record(started.elapsed().as_secs_f64());
                    record_outcome(operation, &Ok::<(), ServiceError>(()));
                    info!(sid = %sid, attempt, "Server installed and started");
                    return;
                }
                Err(e) => {
                    let last = attempt >= self.retry.max_attempts || !e.is_retryable();
                    self.persist_failure(sid, &e, last).await;
                    if last {
                        error!(sid = %sid, attempt, error = %e, "Install pipeline failed");
                        record_outcome(operation, &Err::<(), ServiceError>(e));
                        return;
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(sid = %sid, attempt, error = %e, retry_in = ?delay, "Install attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn provision_once(&self, sid: &ServerId) -> Result<(), ServiceError> {
        let mut server = self.load(sid).await?;
        let blueprint = self.load_blueprint(&server.blueprint_id).await?;

        if server.status != ServerStatus::Installing {
            server.mark_installing();
            self.servers.save(&server).await?;
        }
        self.terminals.teardown(sid).await;

        self.provisioner.install(&mut server, &blueprint).await?;
        self.start_locked(&mut server).await
    }

    async fn persist_success(&self, sid: &ServerId) {
        match self.servers.find_by_id(sid).await {
            Ok(Some(mut server)) => {
                server.clear_failure(Utc::now());
                if let Err(e) = self.servers.save(&server).await {
                    error!(sid = %sid, error = %e, "Failed to clear last error");
                }
            }
            Ok(None) => debug!(sid = %sid, "Server deleted before pipeline finished"),
            Err(e) => error!(sid = %sid, error = %e, "Failed to load server after install"),
        }
    }

    async fn persist_failure(&self, sid: &ServerId, failure: &ServiceError, last: bool) {
        let mut server = match self.servers.find_by_id(sid).await {
            Ok(Some(server)) => server,
            Ok(None) => return,
            Err(e) => {
                error!(sid = %sid, error = %e, "Failed to load server to record failure");
                return;
            }
        };
        let now = Utc::now();
        server.record_failure(failure.to_string(), now);
        if last {
            server.mark_offline(OfflineReason::Error, now);
        }
        if let Err(e) = self.servers.save(&server).await {
            error!(sid = %sid, error = %e, "Failed to persist pipeline failure");
        }
    }

    /// Start the runtime container; a running container is left alone.
    async fn start_locked(&self, server: &mut Server) -> Result<(), ServiceError> {
        server.require_container()?;
        let name = server.id.engine_name();
        if self.engine.is_running(&name).await? {
            debug!(sid = %server.id, "Container already running");
            return Ok(());
        }
        self.engine.start_container(&name).await?;
        server.mark_starting(Utc::now());
        self.servers.save(server).await?;
        info!(sid = %server.id, "Server starting");
        Ok(())
    }

    async fn start(&self, sid: &ServerId) -> Result<Server, ServiceError> {
        let _guard = self.locks.acquire(sid).await?;
        let mut server = self.load(sid).await?;
        if let Err(e) = self.start_locked(&mut server).await {
            if !matches!(e, ServiceError::FailedPrecondition(_)) {
                server.record_failure(e.to_string(), Utc::now());
                self.servers.save(&server).await?;
            }
            return Err(e);
        }
        Ok(server)
    }

    /// Shared by stop, kill and restart. Flips to STOPPING, issues the stop
    /// and leaves the rest to a waiter that keeps the server's token.
    async fn stop(&self, sid: &ServerId, grace: StopGrace, after: AfterStop) -> Result<Server, ServiceError> {
        let guard = self.locks.acquire(sid).await?;
        let mut server = self.load(sid).await?;
        server.require_container()?;

        let name = sid.engine_name();
        if !self.engine.is_running(&name).await? {
            if after == AfterStop::Restart {
                self.start_locked(&mut server).await?;
            } else if server.status != ServerStatus::Offline {
                server.mark_offline(OfflineReason::Stopped, Utc::now());
                self.servers.save(&server).await?;
            }
            return Ok(server);
        }

        let previous = server.status;
        server.mark_stopping()?;
        self.servers.save(&server).await?;
        self.terminals.teardown(sid).await;

        let mode = match self.begin_stop(&server, grace).await {
            Ok(mode) => mode,
            Err(e) => {
                error!(sid = %sid, error = %e, "Engine refused to stop container");
                server.status = previous;
                server.record_failure(e.to_string(), Utc::now());
                self.servers.save(&server).await?;
                return Err(e);
            }
        };
        info!(sid = %sid, ?grace, ?mode, "Server stopping");

        let this = self.clone();
        let waiter_sid = sid.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.finish_stop(&waiter_sid, mode, after).await;
        });

        Ok(server)
    }

    async fn begin_stop(&self, server: &Server, grace: StopGrace) -> Result<StopMode, ServiceError> {
        let name = server.id.engine_name();
        if grace == StopGrace::EngineDefault {
            if let Some(line) = self.stop_command_line(server).await {
                match self.send_console_line(&name, &line).await {
                    Ok(()) => return Ok(StopMode::Command),
                    Err(e) => {
                        warn!(sid = %server.id, error = %e, "Could not send stop command, stopping through the engine");
                    }
                }
            }
        }
        self.engine.stop_container(&name, grace).await?;
        Ok(StopMode::Signalled)
    }

    async fn stop_command_line(&self, server: &Server) -> Option<String> {
        let blueprint = match self.blueprints.find_by_id(&server.blueprint_id).await {
            Ok(Some(blueprint)) => blueprint,
            Ok(None) => return None,
            Err(e) => {
                warn!(sid = %server.id, error = %e, "Blueprint lookup failed during stop");
                return None;
            }
        };
        if blueprint.stop_command.trim().is_empty() {
            return None;
        }
        let vars = TemplateVars::new(
            &blueprint.server_binary,
            server.resource_limit.ram_mb,
            server.primary_port(),
        );
        match render_template(&blueprint.stop_command, &vars) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(sid = %server.id, error = %e, "Invalid stop command template");
                None
            }
        }
    }

    async fn send_console_line(&self, name: &str, line: &str) -> Result<(), ServiceError> {
        let mut io = self.engine.attach(name).await?;
        let payload = format!("{}\n", line);
        let written = async {
            io.input.write_all(payload.as_bytes()).await?;
            io.input.flush().await
        }
        .await;
        written.map_err(|e| ServiceError::Dependency(format!("console write failed: {}", e)))
    }

    async fn await_stop(&self, name: &str, mode: StopMode) -> Result<i64, ServiceError> {
        if mode == StopMode::Command {
            match tokio::time::timeout(self.stop_timeout, self.engine.wait_until_stopped(name)).await {
                Ok(result) => return Ok(result?),
                Err(_) => {
                    warn!(container = %name, timeout = ?self.stop_timeout, "Stop command timed out, stopping through the engine");
                    self.engine.stop_container(name, StopGrace::EngineDefault).await?;
                }
            }
        }
        Ok(self.engine.wait_until_stopped(name).await?)
    }

    async fn finish_stop(&self, sid: &ServerId, mode: StopMode, after: AfterStop) {
        let name = sid.engine_name();
        let outcome = self.await_stop(&name, mode).await;

        let mut server = match self.servers.find_by_id(sid).await {
            Ok(Some(server)) => server,
            Ok(None) => return,
            Err(e) => {
                error!(sid = %sid, error = %e, "Failed to load server after stop");
                return;
            }
        };

        let now = Utc::now();
        match outcome {
            Ok(exit_code) => {
                if exit_code != 0 {
                    warn!(sid = %sid, exit_code, "Server exited with non-zero code");
                }
                match after {
                    AfterStop::Offline(reason) => {
                        server.mark_offline(reason, now);
                        info!(sid = %sid, reason = %reason, "Server offline");
                    }
                    AfterStop::Restart => match self.engine.start_container(&name).await {
                        Ok(()) => {
                            server.mark_starting(now);
                            info!(sid = %sid, "Server restarted");
                        }
                        Err(e) => {
                            error!(sid = %sid, error = %e, "Restart failed after stop");
                            server.mark_offline(OfflineReason::Stopped, now);
                            server.record_failure(e.to_string(), now);
                        }
                    },
                }
            }
            Err(e) => {
                error!(sid = %sid, error = %e, "Waiting for container to stop failed");
                server.mark_offline(OfflineReason::Error, now);
                server.record_failure(e.to_string(), now);
            }
        }

        if let Err(e) = self.servers.save(&server).await {
            error!(sid = %sid, error = %e, "Failed to persist stop outcome");
        }
    }

    async fn create_inner(&self, caller: &Caller, cmd: CreateServerCommand) -> Result<Server, ServiceError> {
        require_backend(caller, "create")?;
        for allocation in &cmd.allocations {
            allocation.validate()?;
        }
        cmd.resource_limit.validate()?;
        let blueprint = self.load_blueprint(&cmd.blueprint_id).await?;
        ensure_image_allowed(&blueprint, &cmd.image)?;

        let guard = self.locks.acquire(&cmd.sid).await?;
        if self.servers.find_by_id(&cmd.sid).await?.is_some() {
            return Err(ServiceError::Conflict(format!("server {} already exists", cmd.sid)));
        }

        let server = Server::new(
            cmd.sid,
            cmd.owner,
            cmd.users,
            cmd.allocations,
            cmd.resource_limit,
            cmd.image,
            cmd.blueprint_id,
        );
        self.persist_new(&server).await?;
        info!(sid = %server.id, blueprint = %server.blueprint_id, "Server created");

        self.spawn_pipeline(server.id.clone(), guard, "install");
        Ok(server)
    }

    async fn update_inner(
        &self,
        caller: &Caller,
        sid: &ServerId,
        cmd: UpdateServerCommand,
    ) -> Result<Server, ServiceError> {
        require_backend(caller, "update")?;
        if let Some(allocations) = &cmd.allocations {
            for allocation in allocations {
                allocation.validate()?;
            }
        }
        if let Some(limit) = &cmd.resource_limit {
            limit.validate()?;
        }

        let guard = self.locks.acquire(sid).await?;
        let mut server = self.load(sid).await?;

        if cmd.image.is_some() || cmd.blueprint_id.is_some() {
            let blueprint_id = cmd.blueprint_id.as_ref().unwrap_or(&server.blueprint_id);
            let image = cmd.image.as_deref().unwrap_or(&server.image);
            let blueprint = self.load_blueprint(blueprint_id).await?;
            ensure_image_allowed(&blueprint, image)?;
        }

        let previous = server.clone();
        let mut reprovision = false;

        if let Some(users) = cmd.users {
            server.users = users;
        }
        if let Some(allocations) = cmd.allocations {
            if allocations != server.allocations {
                server.allocations = allocations;
                reprovision = true;
            }
        }
        if let Some(limit) = cmd.resource_limit {
            if limit != server.resource_limit {
                server.resource_limit = limit;
                reprovision = true;
            }
        }
        if let Some(image) = cmd.image {
            if image != server.image {
                server.image = image;
                reprovision = true;
            }
        }
        if let Some(blueprint_id) = cmd.blueprint_id {
            if blueprint_id != server.blueprint_id {
                server.blueprint_id = blueprint_id;
                reprovision = true;
            }
        }

        if reprovision {
            server.mark_installing();
        }
        self.persist_update(&previous, &server).await?;

        if reprovision {
            info!(sid = %sid, "Provisioning fields changed, reinstalling");
            self.spawn_pipeline(sid.clone(), guard, "update");
        } else {
            debug!(sid = %sid, "Update touched no provisioning fields");
        }
        Ok(server)
    }

    async fn delete_inner(&self, caller: &Caller, sid: &ServerId, force: bool) -> Result<(), ServiceError> {
        require_backend(caller, "delete")?;
        if let Some((_, pipeline)) = self.pipelines.remove(sid) {
            info!(sid = %sid, "Cancelling install pipeline before delete");
            pipeline.cancel();
        }
        let guard = self.locks.acquire(sid).await?;
        self.terminals.teardown(sid).await;

        let name = sid.engine_name();
        let mut failures: Vec<ServiceError> = Vec::new();

        if let Err(e) = self.servers.delete(sid).await {
            warn!(sid = %sid, error = %e, "Failed to delete server rows");
            failures.push(e.into());
        }

        let steps = [
            ("container", self.engine.remove_container(&name, force).await),
            (
                "install container",
                self.engine.remove_container(&sid.install_container_name(), true).await,
            ),
            ("volume", self.engine.remove_volume(&name).await),
            ("network", self.engine.remove_network(&name).await),
        ];
        for (step, result) in steps {
            if let Err(e) = ignore_not_found(result) {
                warn!(sid = %sid, step, error = %e, "Teardown step failed");
                failures.push(e.into());
            }
        }

        drop(guard);
        self.locks.prune(sid);

        if failures.is_empty() {
            info!(sid = %sid, "Server deleted");
            Ok(())
        } else {
            Err(ServiceError::Aggregate(failures))
        }
    }

    async fn reinstall_inner(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError> {
        self.guard.check_access(caller, sid).await?;
        let guard = self.locks.acquire(sid).await?;
        let mut server = self.load(sid).await?;
        server.mark_installing();
        self.servers.save(&server).await?;
        info!(sid = %sid, caller = %caller, "Reinstall requested");
        self.spawn_pipeline(sid.clone(), guard, "reinstall");
        Ok(server)
    }

    async fn power_inner(&self, caller: &Caller, sid: &ServerId, action: PowerAction) -> Result<Server, ServiceError> {
        self.guard.check_access(caller, sid).await?;
        info!(sid = %sid, caller = %caller, action = action.as_str(), "Power action");
        match action {
            PowerAction::Start => self.start(sid).await,
            PowerAction::Stop => {
                self.stop(sid, StopGrace::EngineDefault, AfterStop::Offline(OfflineReason::Stopped))
                    .await
            }
            PowerAction::Kill => {
                self.stop(sid, StopGrace::Immediate, AfterStop::Offline(OfflineReason::Killed))
                    .await
            }
            PowerAction::Restart => self.stop(sid, StopGrace::EngineDefault, AfterStop::Restart).await,
        }
    }
}

#[async_trait]
impl LifecycleService for StandardLifecycleService {
    async fn create_server(&self, caller: &Caller, cmd: CreateServerCommand) -> Result<Server, ServiceError> {
        let result = self.create_inner(caller, cmd).await;
        if result.is_err() {
            record_outcome("create", &result);
        }
        result
    }

    async fn update_server(
        &self,
        caller: &Caller,
        sid: &ServerId,
        cmd: UpdateServerCommand,
    ) -> Result<Server, ServiceError> {
        let result = self.update_inner(caller, sid, cmd).await;
        record_outcome("update", &result);
        result
    }

    async fn delete_server(&self, caller: &Caller, sid: &ServerId, force: bool) -> Result<(), ServiceError> {
        let result = self.delete_inner(caller, sid, force).await;
        record_outcome("delete", &result);
        result
    }

    async fn reinstall(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError> {
        let result = self.reinstall_inner(caller, sid).await;
        if result.is_err() {
            record_outcome("reinstall", &result);
        }
        result
    }

    async fn status(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError> {
        self.guard.check_access(caller, sid).await?;
        self.load(sid).await
    }

    async fn power(&self, caller: &Caller, sid: &ServerId, action: PowerAction) -> Result<Server, ServiceError> {
        let result = self.power_inner(caller, sid, action).await;
        record_outcome(action.as_str(), &result);
        result
    }
}
