// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server installation.
//!
//! Turns a blueprint and a server record into an installed-but-stopped
//! runtime container:
//!
//! 1. pull the setup image
//! 2. resolve or create the server volume (exactly one)
//! 3. write the setup script, with a completion sentinel, into the volume
//! 4. remove a previous runtime container
//! 5. run the setup script in an ephemeral container and wait for it, up to
//!    the install timeout
//! 6. pull the runtime image
//! 7. create the runtime container with the rendered start command
//!
//! Installing twice converges on the same state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::error::ServiceError;
use crate::domain::blueprint::{render_command, Blueprint, TemplateVars};
use crate::domain::engine::{
    ContainerEngine, ContainerSpec, EngineError, PortBinding, ResourceCeilings, StopGrace,
    VolumeInfo, VolumeMount,
};
use crate::domain::repository::ServerRepository;
use crate::domain::server::Server;
use crate::infrastructure::sandbox::SandboxedRoot;

/// File name of the setup script inside the volume.
pub const SETUP_SCRIPT_NAME: &str = "install";

/// Appended to every setup script; its output marks a completed download.
pub const COMPLETION_SENTINEL: &str = "\necho \"DOWNLOAD FINISHED\"\n";

#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    /// Where the volume is mounted inside containers
    pub data_mount: String,
    /// Network for runtime containers
    pub network_mode: Option<String>,
    /// Longest a setup script may run before it is killed
    pub install_timeout: Duration,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            data_mount: "/data".to_string(),
            network_mode: None,
            install_timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Provisioner {
    engine: Arc<dyn ContainerEngine>,
    servers: Arc<dyn ServerRepository>,
    settings: ProvisioningSettings,
}

pub(crate) fn ignore_not_found(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl Provisioner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        servers: Arc<dyn ServerRepository>,
        settings: ProvisioningSettings,
    ) -> Self {
        Self {
            engine,
            servers,
            settings,
        }
    }

    /// Install `server` from `blueprint`. Persists presence changes as they
    /// happen.
    pub async fn install(&self, server: &mut Server, blueprint: &Blueprint) -> Result<(), ServiceError> {
        let sid = server.id.clone();
        let name = sid.engine_name();
        info!(sid = %sid, blueprint = %blueprint.id, version = blueprint.version, "Installing server");

        // template, script and limit problems surface before any engine work
        let script = blueprint.setup_script()?;
        let vars = TemplateVars::new(
            &blueprint.server_binary,
            server.resource_limit.ram_mb,
            server.primary_port(),
        );
        let cmd = render_command(&blueprint.start_command, &vars)?;
        let ceilings = ResourceCeilings::from_limit(&server.resource_limit)?;

        self.engine.pull_image(&blueprint.setup_image).await?;

        let volume = self.resolve_volume(&name).await?;
        self.write_setup_script(&volume, script).await?;

        if server.container_exists || self.engine.container_exists(&name).await? {
            info!(sid = %sid, "Removing existing runtime container before reinstall");
            ignore_not_found(self.engine.remove_container(&name, true).await)?;
            server.mark_container_removed();
            self.servers.save(server).await?;
        }

        self.run_setup(server, blueprint, &volume, ceilings).await?;

        self.engine.pull_image(&server.image).await?;

        let mut env = HashMap::new();
        env.insert("SERVER_BINARY".to_string(), blueprint.server_binary.clone());
        env.insert("SERVER_MEMORY".to_string(), server.resource_limit.ram_mb.to_string());
        if let Some(port) = server.primary_port() {
            env.insert("SERVER_PORT".to_string(), port.to_string());
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: server.image.clone(),
            cmd,
            env,
            working_dir: Some(self.settings.data_mount.clone()),
            mount: VolumeMount {
                volume: volume.name.clone(),
                target: self.settings.data_mount.clone(),
            },
            ceilings,
            ports: PortBinding::from_allocations(&server.allocations),
            network: self.settings.network_mode.clone(),
        };
        let container_id = self.engine.create_container(&spec).await?;
        debug!(sid = %sid, container_id = %container_id, "Runtime container created");

        server.mark_installed();
        self.servers.save(server).await?;

        info!(sid = %sid, "Server installed");
        Ok(())
    }

    /// The single volume named `name`, created when absent.
    async fn resolve_volume(&self, name: &str) -> Result<VolumeInfo, ServiceError> {
        let mut volumes = self.engine.list_volumes(name).await?;
        match volumes.len() {
            0 => {
                info!(volume = %name, "Creating server volume");
                Ok(self.engine.create_volume(name).await?)
            }
            1 => Ok(volumes.remove(0)),
            n => Err(ServiceError::Conflict(format!(
                "{} volumes named {} exist; refusing to pick one",
                n, name
            ))),
        }
    }

    async fn write_setup_script(&self, volume: &VolumeInfo, mut script: Vec<u8>) -> Result<(), ServiceError> {
        script.extend_from_slice(COMPLETION_SENTINEL.as_bytes());
        let root = SandboxedRoot::open(&volume.mountpoint)?;
        let path = PathBuf::from(SETUP_SCRIPT_NAME);
        if root.stat(path.clone()).await.is_ok() {
            root.delete(path.clone()).await?;
        }
        root.write_with_mode(path, script, 0o755).await?;
        Ok(())
    }

    async fn run_setup(
        &self,
        server: &Server,
        blueprint: &Blueprint,
        volume: &VolumeInfo,
        ceilings: ResourceCeilings,
    ) -> Result<(), ServiceError> {
        let name = server.id.install_container_name();

        // a failed earlier run leaves its container behind for inspection
        ignore_not_found(self.engine.remove_container(&name, true).await)?;

        let mut env = HashMap::new();
        env.insert("SERVER_BINARY".to_string(), blueprint.server_binary.clone());

        let spec = ContainerSpec {
            name: name.clone(),
            image: blueprint.setup_image.clone(),
            cmd: vec![
                blueprint.setup_interpreter.clone(),
                format!("./{}", SETUP_SCRIPT_NAME),
            ],
            env,
            working_dir: Some(self.settings.data_mount.clone()),
            mount: VolumeMount {
                volume: volume.name.clone(),
                target: self.settings.data_mount.clone(),
            },
            ceilings,
            ports: Vec::new(),
            network: None,
        };

        self.engine.create_container(&spec).await?;
        self.engine.start_container(&name).await?;
        info!(sid = %server.id, container = %name, "Setup script running");

        let timeout = self.settings.install_timeout;
        let exit_code = match tokio::time::timeout(timeout, self.engine.wait_until_stopped(&name)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(sid = %server.id, timeout = ?timeout, "Setup script timed out, killing it");
                self.discard_setup(&name).await;
                return Err(ServiceError::InstallFailed(format!(
                    "setup script did not finish within {:?}",
                    timeout
                )));
            }
        };
        if exit_code != 0 {
            warn!(sid = %server.id, exit_code, "Setup script failed");
            return Err(ServiceError::InstallFailed(format!(
                "setup script exited with code {}",
                exit_code
            )));
        }

        ignore_not_found(self.engine.remove_container(&name, true).await)?;
        Ok(())
    }

    async fn discard_setup(&self, name: &str) {
        if let Err(e) = ignore_not_found(self.engine.stop_container(name, StopGrace::Immediate).await) {
            warn!(container = %name, error = %e, "Could not kill setup container");
        }
        if let Err(e) = ignore_not_found(self.engine.remove_container(name, true).await) {
            warn!(container = %name, error = %e, "Could not remove setup container");
        }
    }
}
